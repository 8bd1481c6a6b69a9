use std::time::Duration;

use thiserror::Error;

use crate::request::Route;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Low-level classification of a transport failure, used by the retry policy
/// instead of inspecting source error types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Connect,
    Reset,
    BrokenPipe,
    UnexpectedEof,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Connect => "connect",
            Self::Reset => "reset",
            Self::BrokenPipe => "broken_pipe",
            Self::UnexpectedEof => "unexpected_eof",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Failure surfaced by a transport connection, already classified. The
/// connector and connection implementations construct these; everything above
/// the pool only looks at `kind`.
#[derive(Debug, Error)]
#[error("{kind}: {source}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    #[source]
    pub source: BoxError,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    /// Classifies an I/O error by its `ErrorKind`. `connecting` marks errors
    /// raised before any request bytes were written, which are always safe to
    /// retry.
    pub fn from_io(error: std::io::Error, connecting: bool) -> Self {
        use std::io::ErrorKind;
        let kind = if connecting {
            TransportErrorKind::Connect
        } else {
            match error.kind() {
                ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                    TransportErrorKind::Reset
                }
                ErrorKind::BrokenPipe => TransportErrorKind::BrokenPipe,
                ErrorKind::UnexpectedEof => TransportErrorKind::UnexpectedEof,
                _ => TransportErrorKind::Other,
            }
        };
        Self::new(kind, error)
    }

    /// True when the underlying cause was an I/O timeout.
    pub fn is_timeout(&self) -> bool {
        self.source
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| {
                matches!(
                    io.kind(),
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                )
            })
    }
}

impl From<TransportError> for ExecutionErrorKind {
    fn from(error: TransportError) -> Self {
        ExecutionErrorKind::TransportError {
            kind: error.kind,
            source: error.source,
        }
    }
}

/// Whether a failure kind is eligible for another attempt.
///
/// `RetryableIfReplayable` marks failures that may have happened after part of
/// the request body was written; they can only be retried when the body can be
/// replayed from the start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retryability {
    Retryable,
    RetryableIfReplayable,
    Never,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutionErrorKind {
    #[error("timed out acquiring a connection to {route} after {timeout_ms}ms")]
    ConnectTimeout { route: Route, timeout_ms: u128 },
    #[error("connection pool exhausted for {route}")]
    PoolExhausted { route: Route },
    #[error("connection pool is shut down")]
    PoolShutdown,
    #[error("attempt aborted by the per-attempt timer after {timeout_ms}ms")]
    AttemptAborted { timeout_ms: u128 },
    #[error("operation aborted: whole-operation deadline of {timeout_ms}ms elapsed")]
    ClientExecutionAborted { timeout_ms: u128 },
    #[error("service returned status {status}: {message}")]
    ServiceError {
        status: u16,
        code: Option<String>,
        message: String,
    },
    #[error("transport error ({kind}): {source}")]
    TransportError {
        kind: TransportErrorKind,
        #[source]
        source: BoxError,
    },
    #[error("request body cannot be replayed for a retry")]
    BodyNotReplayable,
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
}

impl ExecutionErrorKind {
    /// Explicit retryability classification. The retry policy consults this
    /// (through the per-attempt `RetryContext`) rather than matching on error
    /// types, and may still veto a retryable kind.
    pub fn retryability(&self) -> Retryability {
        match self {
            Self::ConnectTimeout { .. } | Self::PoolExhausted { .. } => Retryability::Retryable,
            Self::AttemptAborted { .. } => Retryability::Retryable,
            Self::ServiceError { .. } => Retryability::Retryable,
            Self::TransportError { kind, .. } => match kind {
                TransportErrorKind::Connect => Retryability::Retryable,
                _ => Retryability::RetryableIfReplayable,
            },
            Self::PoolShutdown
            | Self::ClientExecutionAborted { .. }
            | Self::BodyNotReplayable
            | Self::InvalidArgument { .. } => Retryability::Never,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ServiceError { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Terminal failure of one logical operation. Wraps the failure kind with the
/// number of attempts made and total elapsed time, so a retry storm is
/// distinguishable from a single-shot failure in logs and error reports.
#[derive(Debug, Error)]
#[error("{kind} (attempts={attempts}, elapsed={}ms)", .elapsed.as_millis())]
pub struct ExecutionError {
    kind: ExecutionErrorKind,
    attempts: usize,
    elapsed: Duration,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, attempts: usize, elapsed: Duration) -> Self {
        Self {
            kind,
            attempts,
            elapsed,
        }
    }

    /// Synchronously detected misconfiguration; no attempt was ever made.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self {
            kind: ExecutionErrorKind::InvalidArgument {
                message: message.into(),
            },
            attempts: 0,
            elapsed: Duration::ZERO,
        }
    }

    pub fn kind(&self) -> &ExecutionErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ExecutionErrorKind {
        self.kind
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::{ExecutionError, ExecutionErrorKind, Retryability, TransportErrorKind};
    use std::time::Duration;

    #[test]
    fn watchdog_aborts_are_never_reclassified_as_retryable() {
        let kind = ExecutionErrorKind::ClientExecutionAborted { timeout_ms: 5000 };
        assert_eq!(kind.retryability(), Retryability::Never);
    }

    #[test]
    fn attempt_abort_is_retry_eligible() {
        let kind = ExecutionErrorKind::AttemptAborted { timeout_ms: 1000 };
        assert_eq!(kind.retryability(), Retryability::Retryable);
    }

    #[test]
    fn mid_stream_transport_faults_require_a_replayable_body() {
        let kind = ExecutionErrorKind::TransportError {
            kind: TransportErrorKind::Reset,
            source: "connection reset by peer".into(),
        };
        assert_eq!(kind.retryability(), Retryability::RetryableIfReplayable);
    }

    #[test]
    fn terminal_error_reports_attempts_and_elapsed() {
        let error = ExecutionError::new(
            ExecutionErrorKind::PoolShutdown,
            3,
            Duration::from_millis(1200),
        );
        let text = error.to_string();
        assert!(text.contains("attempts=3"), "unexpected display: {text}");
        assert!(text.contains("elapsed=1200ms"), "unexpected display: {text}");
    }
}
