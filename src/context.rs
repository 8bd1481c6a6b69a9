use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Retryability, TransportErrorKind};
use crate::metrics::MetricsCollector;
use crate::util::lock_unpoisoned;

/// Something a watchdog can abort: in practice the connection currently
/// carrying an attempt's I/O. Abort must be safe to call from another thread
/// and idempotent.
pub trait AbortHandle: Send + Sync {
    fn abort(&self);
}

#[derive(Default)]
struct AbortSignalState {
    target: Option<Arc<dyn AbortHandle>>,
}

struct AbortSignalInner {
    aborted: AtomicBool,
    state: Mutex<AbortSignalState>,
    condvar: Condvar,
}

/// Cancellation token for one logical operation.
///
/// The whole-operation watchdog fires by tripping this signal instead of
/// interrupting a thread: the flag is observed at every suspension point, the
/// current in-flight connection (if any) is aborted so blocking I/O unblocks,
/// and any backoff sleep waiting on the condvar wakes immediately.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<AbortSignalInner>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AbortSignalInner {
                aborted: AtomicBool::new(false),
                state: Mutex::new(AbortSignalState::default()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Trips the signal. Idempotent: a second call (or a call racing with
    /// normal completion) does nothing beyond the first.
    pub fn abort(&self) {
        if self.inner.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        let target = {
            let mut state = lock_unpoisoned(&self.inner.state);
            state.target.take()
        };
        if let Some(target) = target {
            target.abort();
        }
        self.inner.condvar.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Registers the connection carrying the current attempt so an abort can
    /// unblock its I/O. If the signal already fired, the target is aborted on
    /// the spot rather than parked.
    pub(crate) fn set_target(&self, target: Arc<dyn AbortHandle>) {
        if self.is_aborted() {
            target.abort();
            return;
        }
        let mut state = lock_unpoisoned(&self.inner.state);
        state.target = Some(target);
        drop(state);
        // Re-check: abort may have raced between the flag check and the store.
        if self.is_aborted() {
            let target = lock_unpoisoned(&self.inner.state).target.take();
            if let Some(target) = target {
                target.abort();
            }
        }
    }

    pub(crate) fn clear_target(&self) {
        lock_unpoisoned(&self.inner.state).target = None;
    }

    /// Sleeps up to `duration`, waking early if the signal trips. Returns
    /// `true` when the full sleep completed, `false` on abort.
    pub(crate) fn interruptible_sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut state = lock_unpoisoned(&self.inner.state);
        loop {
            if self.is_aborted() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let (guard, _timed_out) = match self.inner.condvar.wait_timeout(state, deadline - now) {
                Ok(result) => result,
                Err(poisoned) => poisoned.into_inner(),
            };
            state = guard;
        }
    }
}

/// Credentials snapshot taken once per logical operation and handed to the
/// signer on every attempt. The secret never appears in debug output.
#[derive(Clone)]
pub struct Credentials {
    principal: String,
    secret: String,
}

impl Credentials {
    pub fn new(principal: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            secret: secret.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new("", "")
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn is_anonymous(&self) -> bool {
        self.principal.is_empty() && self.secret.is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Credentials")
            .field("principal", &self.principal)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Per-logical-operation state. Created once per top-level call; the executor
/// increments the attempt counter between attempts and the metrics collector
/// accumulates across them.
pub struct ExecutionContext {
    credentials: Credentials,
    metrics: MetricsCollector,
    abort_signal: AbortSignal,
    attempts: usize,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(Credentials::anonymous())
    }
}

impl ExecutionContext {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            metrics: MetricsCollector::new(),
            abort_signal: AbortSignal::new(),
            attempts: 0,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// The operation's cancellation token. Callers may clone it to cancel the
    /// call explicitly; the effect is identical to the whole-operation
    /// watchdog firing.
    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort_signal
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub(crate) fn begin_attempt(&mut self) -> usize {
        self.attempts += 1;
        self.attempts
    }
}

/// Immutable snapshot of one failed attempt, handed to the retry policy.
/// Never mutated after construction; the executor builds a fresh one per
/// attempt.
#[derive(Clone, Debug)]
pub struct RetryContext {
    pub attempt: usize,
    /// The failing error kind's own classification; the policy's first gate.
    pub retryability: Retryability,
    pub status: Option<u16>,
    pub error_code: Option<String>,
    pub transport_error_kind: Option<TransportErrorKind>,
    pub attempt_aborted: bool,
    pub connection_acquisition_failed: bool,
    pub body_replayable: bool,
    pub elapsed: Duration,
}

impl RetryContext {
    /// Retries attempted so far: attempt 1 has had zero retries.
    pub fn retries_attempted(&self) -> usize {
        self.attempt.saturating_sub(1)
    }
}
