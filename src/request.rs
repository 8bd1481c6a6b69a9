use std::io::Read;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};

use crate::error::ExecutionError;

/// The (scheme, host, port) tuple a connection is pooled under.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Route {
    scheme: String,
    host: String,
    port: u16,
}

impl Route {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    pub fn from_uri(uri: &Uri) -> Result<Self, ExecutionError> {
        let scheme = uri.scheme_str().unwrap_or("http");
        let host = uri.host().ok_or_else(|| {
            ExecutionError::invalid_argument(format!("request uri has no host: {uri}"))
        })?;
        let port = uri.port_u16().unwrap_or(match scheme {
            "https" => 443,
            _ => 80,
        });
        Ok(Self::new(scheme, host, port))
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Request payload. Buffered bodies can be replayed on every retry; streaming
/// bodies only when explicitly marked replayable by a caller that can rewind
/// the reader via `reset`.
pub enum RequestBody {
    Empty,
    Buffered(Bytes),
    Streaming {
        reader: Box<dyn Read + Send>,
        replayable: bool,
    },
}

impl RequestBody {
    pub fn replayable(&self) -> bool {
        match self {
            Self::Empty | Self::Buffered(_) => true,
            Self::Streaming { replayable, .. } => *replayable,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty) || matches!(self, Self::Buffered(bytes) if bytes.is_empty())
    }
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => formatter.write_str("Empty"),
            Self::Buffered(bytes) => formatter
                .debug_tuple("Buffered")
                .field(&bytes.len())
                .finish(),
            Self::Streaming { replayable, .. } => formatter
                .debug_struct("Streaming")
                .field("replayable", replayable)
                .finish_non_exhaustive(),
        }
    }
}

/// Per-request overrides of the client-level timeout configuration. `None`
/// falls back to the configured value; an explicit `Duration::ZERO` disables
/// the timeout for this request only.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestOverrides {
    pub socket_timeout: Option<Duration>,
    pub client_execution_timeout: Option<Duration>,
}

impl RequestOverrides {
    pub fn socket_timeout(mut self, socket_timeout: Duration) -> Self {
        self.socket_timeout = Some(socket_timeout);
        self
    }

    pub fn client_execution_timeout(mut self, client_execution_timeout: Duration) -> Self {
        self.client_execution_timeout = Some(client_execution_timeout);
        self
    }
}

/// A fully-built, protocol-agnostic request: everything the runtime needs to
/// move bytes, nothing about how they were marshalled.
#[derive(Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: RequestBody,
    overrides: RequestOverrides,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            overrides: RequestOverrides::default(),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_overrides(mut self, overrides: RequestOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut RequestBody {
        &mut self.body
    }

    pub fn overrides(&self) -> RequestOverrides {
        self.overrides
    }

    pub fn route(&self) -> Result<Route, ExecutionError> {
        Route::from_uri(&self.uri)
    }
}
