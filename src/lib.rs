//! Request execution runtime for blocking HTTP service clients.
//!
//! `reqcore` owns everything between "a fully built request" and "a response
//! or a terminal error": a route-keyed connection pool with an idle reaper,
//! per-attempt and whole-operation watchdog timers, and a retry loop with
//! jittered exponential backoff. Transports plug in through the
//! [`pool::Connector`] trait; this crate never opens a socket itself.
//!
//! The entry point is [`RequestExecutor`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use reqcore::{ClientConfiguration, Request, RequestExecutor, RetryPolicy};
//!
//! # fn connector() -> Arc<dyn reqcore::pool::Connector> { unimplemented!() }
//! let executor = RequestExecutor::builder(connector())
//!     .config(
//!         ClientConfiguration::new()
//!             .socket_timeout(Duration::from_secs(10))
//!             .client_execution_timeout(Duration::from_secs(30)),
//!     )
//!     .retry_policy(RetryPolicy::standard())
//!     .build();
//!
//! let request = Request::new(http::Method::GET, "https://api.example.com/v1".parse().unwrap());
//! let response = executor.execute(request)?;
//! # Ok::<(), reqcore::ExecutionError>(())
//! ```
//!
//! Every timeout treats `Duration::ZERO` as disabled. The whole-operation
//! timeout always wins: once it fires, the in-flight attempt is aborted and
//! no retry is attempted, regardless of what the retry policy would say.

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod extensions;
pub mod metrics;
pub mod pool;
pub mod reaper;
pub mod request;
pub mod response;
pub mod retry;
pub mod timer;

mod util;

pub use config::ClientConfiguration;
pub use context::{AbortHandle, AbortSignal, Credentials, ExecutionContext, RetryContext};
pub use error::{
    ExecutionError, ExecutionErrorKind, Retryability, TransportError, TransportErrorKind,
};
pub use executor::{RequestExecutor, RequestExecutorBuilder};
pub use extensions::{
    ErrorResponseHandler, HeaderErrorResponseHandler, Marshaller, NoOpSigner, RequestHandler,
    ResponseHandler, Signer,
};
pub use metrics::{MetricsCollector, MetricsSink, MetricsSnapshot, TimingEvent};
pub use pool::{Connection, ConnectionPool, Connector, PoolStats, PooledConnection};
pub use reaper::{IdleConnectionReaper, ReapablePool};
pub use request::{Request, RequestBody, RequestOverrides, Route};
pub use response::{Response, ResponseBody};
pub use retry::{RetryClassifier, RetryPolicy};
pub use timer::{ClientExecutionTimer, RequestTimer, TimerHandle, TimerScheduler};

/// Convenience alias for fallible runtime operations.
pub type Result<T> = std::result::Result<T, ExecutionError>;
