use std::io::Read;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

/// Response payload handed to the caller's handler. The runtime only ever
/// drains or closes it; decoding is the handler's business.
pub enum ResponseBody {
    Empty,
    Buffered(Bytes),
    Streaming(Box<dyn Read + Send>),
}

impl ResponseBody {
    /// Reads the remainder of the body to completion so the connection can go
    /// back to the pool. Returns `false` when draining failed and the
    /// connection must be closed instead of reused.
    pub(crate) fn drain(&mut self) -> bool {
        match self {
            Self::Empty | Self::Buffered(_) => true,
            Self::Streaming(reader) => std::io::copy(reader, &mut std::io::sink()).is_ok(),
        }
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => formatter.write_str("Empty"),
            Self::Buffered(bytes) => formatter
                .debug_tuple("Buffered")
                .field(&bytes.len())
                .finish(),
            Self::Streaming(_) => formatter.write_str("Streaming(..)"),
        }
    }
}

/// A received response: status line and headers plus a body the handler owns.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: ResponseBody,
}

impl Response {
    pub fn new(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    /// Consumes the response, buffering a streaming body fully into memory.
    pub fn into_bytes(self) -> std::io::Result<Bytes> {
        match self.body {
            ResponseBody::Empty => Ok(Bytes::new()),
            ResponseBody::Buffered(bytes) => Ok(bytes),
            ResponseBody::Streaming(mut reader) => {
                let mut buffer = Vec::new();
                reader.read_to_end(&mut buffer)?;
                Ok(Bytes::from(buffer))
            }
        }
    }
}
