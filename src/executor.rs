use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ClientConfiguration;
use crate::context::{AbortSignal, ExecutionContext, RetryContext};
use crate::error::{ExecutionError, ExecutionErrorKind, Retryability, TransportErrorKind};
use crate::extensions::{
    ErrorResponseHandler, HeaderErrorResponseHandler, NoOpSigner, RequestHandler, Signer,
};
use crate::metrics::{MetricsCollector, TimingEvent};
use crate::pool::{ConnectionPool, Connector};
use crate::reaper::{IdleConnectionReaper, ReapablePool};
use crate::request::{Request, Route};
use crate::response::{Response, ResponseBody};
use crate::retry::RetryPolicy;
use crate::timer::{ClientExecutionTimer, RequestTimer, TimerHandle, TimerScheduler};
use crate::util::bounded_backoff;

/// Cancels its watchdog on drop, so every exit path, success, error, or
/// panic, tears the timer down.
struct TimerGuard {
    handle: TimerHandle,
}

impl TimerGuard {
    fn new(handle: TimerHandle) -> Self {
        Self { handle }
    }

    /// Cancels the watchdog now. Returns `true` when it had already fired,
    /// meaning the guarded work was aborted rather than completed.
    fn disarm(&self) -> bool {
        !self.handle.cancel() && self.handle.has_fired()
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

struct ExecutorInner {
    pool: ConnectionPool,
    config: ClientConfiguration,
    retry_policy: RetryPolicy,
    signer: Arc<dyn Signer>,
    request_handlers: Vec<Arc<dyn RequestHandler>>,
    error_handler: Arc<dyn ErrorResponseHandler>,
    execution_timer: ClientExecutionTimer,
    request_timer: RequestTimer,
    reaper: Option<IdleConnectionReaper>,
    reaper_handle: Option<Arc<dyn ReapablePool>>,
    metrics: MetricsCollector,
}

/// The request execution runtime: owns the pool, the watchdog timers, and
/// the retry loop, and drives one logical operation per `execute` call.
///
/// Clones share the same pool and timers, so one executor per remote service
/// is the expected shape.
#[derive(Clone)]
pub struct RequestExecutor {
    inner: Arc<ExecutorInner>,
}

pub struct RequestExecutorBuilder {
    connector: Arc<dyn Connector>,
    config: ClientConfiguration,
    retry_policy: RetryPolicy,
    signer: Arc<dyn Signer>,
    request_handlers: Vec<Arc<dyn RequestHandler>>,
    error_handler: Arc<dyn ErrorResponseHandler>,
    scheduler: Option<TimerScheduler>,
    reaper: Option<IdleConnectionReaper>,
    metrics: MetricsCollector,
}

impl RequestExecutorBuilder {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            config: ClientConfiguration::default(),
            retry_policy: RetryPolicy::standard(),
            signer: Arc::new(NoOpSigner),
            request_handlers: Vec::new(),
            error_handler: Arc::new(HeaderErrorResponseHandler),
            scheduler: None,
            reaper: None,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn config(mut self, config: ClientConfiguration) -> Self {
        self.config = config;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = signer;
        self
    }

    pub fn add_request_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.request_handlers.push(handler);
        self
    }

    pub fn error_response_handler(mut self, handler: Arc<dyn ErrorResponseHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    /// Shares a scheduler between executors instead of each one owning a
    /// worker thread.
    pub fn timer_scheduler(mut self, scheduler: TimerScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Shares a reaper between executors. Without this, an executor built
    /// with reaping enabled creates its own.
    pub fn idle_connection_reaper(mut self, reaper: IdleConnectionReaper) -> Self {
        self.reaper = Some(reaper);
        self
    }

    pub fn metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> RequestExecutor {
        let pool = ConnectionPool::new(
            self.connector,
            self.config.max_connections_value(),
            self.config.max_connections_per_route_value(),
        );
        let scheduler = self.scheduler.unwrap_or_default();

        let mut reaper = None;
        let mut reaper_handle = None;
        if self.config.use_connection_reaper_value() {
            let instance = self.reaper.unwrap_or_default();
            let handle: Arc<dyn ReapablePool> = Arc::new(pool.clone());
            // Threshold validated as non-zero by the configuration builder.
            let registered = instance
                .register_pool(handle.clone(), self.config.max_connection_idle_time_value());
            debug_assert!(registered.is_ok());
            reaper = Some(instance);
            reaper_handle = Some(handle);
        }

        RequestExecutor {
            inner: Arc::new(ExecutorInner {
                pool,
                config: self.config,
                retry_policy: self.retry_policy,
                signer: self.signer,
                request_handlers: self.request_handlers,
                error_handler: self.error_handler,
                execution_timer: ClientExecutionTimer::new(scheduler.clone()),
                request_timer: RequestTimer::new(scheduler),
                reaper,
                reaper_handle,
                metrics: self.metrics,
            }),
        }
    }
}

impl RequestExecutor {
    pub fn builder(connector: Arc<dyn Connector>) -> RequestExecutorBuilder {
        RequestExecutorBuilder::new(connector)
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.inner.metrics
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    /// Executes with a fresh anonymous context. Use `execute_with_context`
    /// to supply credentials or keep an abort handle on the operation.
    pub fn execute(&self, request: Request) -> Result<Response, ExecutionError> {
        let mut context = ExecutionContext::default().with_metrics(self.inner.metrics.clone());
        self.execute_with_context(request, &mut context)
    }

    pub fn execute_with_context(
        &self,
        request: Request,
        context: &mut ExecutionContext,
    ) -> Result<Response, ExecutionError> {
        self.execute_inner(request, context, false)
    }

    /// Executes and hands the successful response to `handler`. The handler
    /// may demand the connection be closed instead of pooled, for output
    /// types that keep reading from the stream.
    pub fn execute_handled<H: crate::extensions::ResponseHandler>(
        &self,
        request: Request,
        handler: &H,
        context: &mut ExecutionContext,
    ) -> Result<H::Output, ExecutionError> {
        let response = self.execute_inner(request, context, handler.needs_connection_close())?;
        handler.handle(response)
    }

    fn execute_inner(
        &self,
        mut request: Request,
        context: &mut ExecutionContext,
        force_connection_close: bool,
    ) -> Result<Response, ExecutionError> {
        let started_at = Instant::now();
        let _in_flight = self.inner.metrics.enter_in_flight();

        let route = request.route()?;
        let overrides = request.overrides();
        let execution_timeout = overrides
            .client_execution_timeout
            .unwrap_or(self.inner.config.client_execution_timeout_value());
        let socket_timeout = overrides
            .socket_timeout
            .unwrap_or(self.inner.config.socket_timeout_value());
        let execution_deadline = (!execution_timeout.is_zero()).then_some(execution_timeout);

        let signal = context.abort_signal().clone();
        let execution_guard =
            TimerGuard::new(self.inner.execution_timer.start(execution_timeout, &signal));

        let outcome = self.attempt_loop(
            &mut request,
            context,
            &route,
            started_at,
            execution_timeout,
            execution_deadline,
            socket_timeout,
            force_connection_close,
            &signal,
        );
        drop(execution_guard);

        let elapsed = started_at.elapsed();
        self.inner
            .metrics
            .record_timing(TimingEvent::TotalOperation, elapsed);
        match outcome {
            Ok(response) => {
                self.inner.metrics.record_operation_succeeded();
                Ok(response)
            }
            Err(kind) => {
                self.inner.metrics.record_operation_failed();
                if matches!(kind, ExecutionErrorKind::ClientExecutionAborted { .. }) {
                    self.inner.metrics.record_execution_abort();
                }
                let error = ExecutionError::new(kind, context.attempts(), elapsed);
                tracing::warn!(route = %route, error = %error, "request execution failed");
                for handler in &self.inner.request_handlers {
                    handler.after_error(&request, &error);
                }
                Err(error)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn attempt_loop(
        &self,
        request: &mut Request,
        context: &mut ExecutionContext,
        route: &Route,
        started_at: Instant,
        execution_timeout: Duration,
        execution_deadline: Option<Duration>,
        socket_timeout: Duration,
        force_connection_close: bool,
        signal: &AbortSignal,
    ) -> Result<Response, ExecutionErrorKind> {
        loop {
            if signal.is_aborted() {
                return Err(execution_aborted(execution_timeout));
            }
            let attempt = context.begin_attempt();
            self.inner.metrics.record_attempt_started();
            if attempt > 1 {
                self.inner.metrics.record_retry();
            }
            for handler in &self.inner.request_handlers {
                handler.before_attempt(request, attempt);
            }

            let attempt_started = Instant::now();
            let mut connection = match self.inner.pool.lease_abortable(
                route,
                self.inner.config.connect_timeout_value(),
                Some(signal),
            ) {
                Ok(connection) => connection,
                Err(kind) => {
                    if signal.is_aborted() {
                        return Err(execution_aborted(execution_timeout));
                    }
                    let retry_context = RetryContext {
                        attempt,
                        retryability: kind.retryability(),
                        status: None,
                        error_code: None,
                        transport_error_kind: match &kind {
                            ExecutionErrorKind::TransportError { kind, .. } => Some(*kind),
                            _ => None,
                        },
                        attempt_aborted: false,
                        connection_acquisition_failed: !matches!(
                            &kind,
                            ExecutionErrorKind::TransportError { .. }
                        ),
                        body_replayable: request.body().replayable(),
                        elapsed: started_at.elapsed(),
                    };
                    if !self.inner.retry_policy.should_retry(&retry_context) {
                        return Err(kind);
                    }
                    tracing::debug!(route = %route, attempt, error = %kind,
                        "connection acquisition failed; retrying");
                    self.backoff(
                        &retry_context,
                        execution_deadline,
                        started_at,
                        signal,
                        execution_timeout,
                    )?;
                    continue;
                }
            };
            self.inner
                .metrics
                .record_timing(TimingEvent::Connect, attempt_started.elapsed());

            // Sign once the connection is held, so time spent waiting for a
            // lease never ages the signature.
            self.inner
                .signer
                .sign(request, context.credentials())
                .map_err(ExecutionError::into_kind)?;

            connection.set_socket_timeout(socket_timeout);
            let abort_handle = connection.abort_handle();
            signal.set_target(abort_handle.clone());
            let request_guard =
                TimerGuard::new(self.inner.request_timer.start(socket_timeout, abort_handle));

            let send_started = Instant::now();
            let sent = connection.send(request);
            // Disarm as soon as response headers (or the failure) arrive.
            let attempt_timed_out = request_guard.disarm();
            signal.clear_target();
            self.inner
                .metrics
                .record_timing(TimingEvent::Send, send_started.elapsed());
            self.inner
                .metrics
                .record_timing(TimingEvent::TotalAttempt, attempt_started.elapsed());

            match sent {
                Err(transport) => {
                    // Errored connections never go back to the pool.
                    drop(connection);
                    if signal.is_aborted() {
                        return Err(execution_aborted(execution_timeout));
                    }
                    let replayable = request.body().replayable();
                    if attempt_timed_out {
                        self.inner.metrics.record_attempt_abort();
                        let retry_context = RetryContext {
                            attempt,
                            retryability: Retryability::Retryable,
                            status: None,
                            error_code: None,
                            transport_error_kind: None,
                            attempt_aborted: true,
                            connection_acquisition_failed: false,
                            body_replayable: replayable,
                            elapsed: started_at.elapsed(),
                        };
                        if !self.inner.retry_policy.should_retry(&retry_context) {
                            return Err(ExecutionErrorKind::AttemptAborted {
                                timeout_ms: socket_timeout.as_millis(),
                            });
                        }
                        // The attempt may have written body bytes already.
                        if !replayable {
                            return Err(ExecutionErrorKind::BodyNotReplayable);
                        }
                        tracing::debug!(route = %route, attempt,
                            "attempt timed out; retrying");
                        self.backoff(
                            &retry_context,
                            execution_deadline,
                            started_at,
                            signal,
                            execution_timeout,
                        )?;
                        continue;
                    }

                    self.inner.metrics.record_transport_error();
                    // Connect failures happen before any body bytes move; a
                    // mid-request fault needs a replayable body to resend.
                    let retryability = if transport.kind == TransportErrorKind::Connect {
                        Retryability::Retryable
                    } else {
                        Retryability::RetryableIfReplayable
                    };
                    let retry_context = RetryContext {
                        attempt,
                        retryability,
                        status: None,
                        error_code: None,
                        transport_error_kind: Some(transport.kind),
                        attempt_aborted: false,
                        connection_acquisition_failed: false,
                        body_replayable: replayable,
                        elapsed: started_at.elapsed(),
                    };
                    if !self.inner.retry_policy.should_retry(&retry_context) {
                        // Name the real blocker: a consumed one-shot body,
                        // not the wire fault, when replay alone would have
                        // salvaged the attempt.
                        let blocked_by_body = !replayable
                            && self.inner.retry_policy.should_retry(&RetryContext {
                                body_replayable: true,
                                ..retry_context.clone()
                            });
                        if blocked_by_body {
                            return Err(ExecutionErrorKind::BodyNotReplayable);
                        }
                        return Err(transport.into());
                    }
                    tracing::debug!(route = %route, attempt, error = %transport,
                        "transport error; retrying");
                    self.backoff(
                        &retry_context,
                        execution_deadline,
                        started_at,
                        signal,
                        execution_timeout,
                    )?;
                    continue;
                }
                Ok(mut response) => {
                    self.inner
                        .metrics
                        .record_timing(TimingEvent::ReceiveHeaders, send_started.elapsed());
                    if signal.is_aborted() {
                        drop(connection);
                        return Err(execution_aborted(execution_timeout));
                    }
                    let status = response.status();
                    if status.is_success() {
                        // A connection handing back a streaming body cannot
                        // be parked; the caller decides when it is done.
                        if !force_connection_close
                            && matches!(
                                response.body(),
                                ResponseBody::Empty | ResponseBody::Buffered(_)
                            )
                        {
                            connection.mark_reusable(true);
                        }
                        drop(connection);
                        for handler in &self.inner.request_handlers {
                            handler.after_response(request, &response);
                        }
                        return Ok(response);
                    }

                    self.inner.metrics.record_service_error();
                    let (code, message) = self.inner.error_handler.parse(&mut response);
                    if response.body_mut().drain() {
                        connection.mark_reusable(true);
                    }
                    drop(connection);

                    let retry_context = RetryContext {
                        attempt,
                        retryability: Retryability::Retryable,
                        status: Some(status.as_u16()),
                        error_code: code.clone(),
                        transport_error_kind: None,
                        attempt_aborted: false,
                        connection_acquisition_failed: false,
                        body_replayable: request.body().replayable(),
                        elapsed: started_at.elapsed(),
                    };
                    if !self.inner.retry_policy.should_retry(&retry_context) {
                        return Err(ExecutionErrorKind::ServiceError {
                            status: status.as_u16(),
                            code,
                            message,
                        });
                    }
                    tracing::debug!(route = %route, attempt, status = status.as_u16(),
                        "service error; retrying");
                    self.backoff(
                        &retry_context,
                        execution_deadline,
                        started_at,
                        signal,
                        execution_timeout,
                    )?;
                }
            }
        }
    }

    fn backoff(
        &self,
        retry_context: &RetryContext,
        execution_deadline: Option<Duration>,
        started_at: Instant,
        signal: &AbortSignal,
        execution_timeout: Duration,
    ) -> Result<(), ExecutionErrorKind> {
        let delay = self.inner.retry_policy.backoff_delay(retry_context);
        // A sleep that would cross the deadline fails fast instead of
        // burning the remaining budget on a doomed attempt.
        let Some(delay) = bounded_backoff(delay, execution_deadline, started_at) else {
            return Err(execution_aborted(execution_timeout));
        };
        if !signal.interruptible_sleep(delay) {
            return Err(execution_aborted(execution_timeout));
        }
        Ok(())
    }

    /// Deregisters from the reaper and shuts the pool down. In-flight
    /// operations fail on their next lease; idle connections close now.
    pub fn shutdown(&self) {
        if let (Some(reaper), Some(handle)) = (&self.inner.reaper, &self.inner.reaper_handle) {
            reaper.deregister_pool(handle);
        }
        self.inner.pool.shutdown();
    }
}

fn execution_aborted(execution_timeout: Duration) -> ExecutionErrorKind {
    ExecutionErrorKind::ClientExecutionAborted {
        timeout_ms: execution_timeout.as_millis(),
    }
}
