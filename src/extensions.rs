use crate::context::Credentials;
use crate::error::ExecutionError;
use crate::request::Request;
use crate::response::Response;

/// Turns a typed operation input into a wire request. The runtime never
/// inspects the input; client libraries implement this per operation and call
/// it before `execute`.
pub trait Marshaller<I>: Send + Sync {
    fn marshal(&self, input: &I) -> Result<Request, ExecutionError>;
}

/// Consumes a successful response and produces the caller's output type.
///
/// `needs_connection_close` forces the connection closed instead of pooled,
/// for handlers that hand the raw stream to the caller.
pub trait ResponseHandler: Send + Sync {
    type Output;

    fn handle(&self, response: Response) -> Result<Self::Output, ExecutionError>;

    fn needs_connection_close(&self) -> bool {
        false
    }
}

/// Signs a request before it is sent. Runs once per attempt, after retries
/// rewind the request, so time-sensitive signatures stay fresh.
pub trait Signer: Send + Sync {
    fn sign(&self, request: &mut Request, credentials: &Credentials) -> Result<(), ExecutionError>;
}

/// Signer for unauthenticated endpoints; leaves the request untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpSigner;

impl Signer for NoOpSigner {
    fn sign(
        &self,
        _request: &mut Request,
        _credentials: &Credentials,
    ) -> Result<(), ExecutionError> {
        Ok(())
    }
}

/// Observation hooks around the attempt lifecycle. All methods default to
/// no-ops; implement only the ones you need. Hooks must not panic and must
/// be fast, they run on the calling thread inside the attempt loop.
pub trait RequestHandler: Send + Sync {
    fn before_attempt(&self, _request: &mut Request, _attempt: usize) {}
    fn after_response(&self, _request: &Request, _response: &Response) {}
    fn after_error(&self, _request: &Request, _error: &ExecutionError) {}
}

/// Extracts a machine-readable error code and message from a non-success
/// response, feeding retry classification (throttling codes) and the terminal
/// service error.
pub trait ErrorResponseHandler: Send + Sync {
    fn parse(&self, response: &mut Response) -> (Option<String>, String);
}

pub(crate) const ERROR_CODE_HEADER: &str = "x-error-code";

/// Default parser: the error code comes from the `x-error-code` header and
/// the message from the status line. Services with structured error bodies
/// install their own handler.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeaderErrorResponseHandler;

impl ErrorResponseHandler for HeaderErrorResponseHandler {
    fn parse(&self, response: &mut Response) -> (Option<String>, String) {
        let code = response
            .headers()
            .get(ERROR_CODE_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let message = response
            .status()
            .canonical_reason()
            .unwrap_or("request failed")
            .to_owned();
        (code, message)
    }
}
