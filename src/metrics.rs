use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::util::lock_unpoisoned;

/// Named timing events the runtime emits around each request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimingEvent {
    Connect,
    Send,
    ReceiveHeaders,
    TotalAttempt,
    TotalOperation,
}

impl TimingEvent {
    pub const ALL: [TimingEvent; 5] = [
        TimingEvent::Connect,
        TimingEvent::Send,
        TimingEvent::ReceiveHeaders,
        TimingEvent::TotalAttempt,
        TimingEvent::TotalOperation,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Send => "send",
            Self::ReceiveHeaders => "receive-headers",
            Self::TotalAttempt => "total-attempt",
            Self::TotalOperation => "total-operation",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Connect => 0,
            Self::Send => 1,
            Self::ReceiveHeaders => 2,
            Self::TotalAttempt => 3,
            Self::TotalOperation => 4,
        }
    }
}

impl std::fmt::Display for TimingEvent {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// External subscriber for timing events. Implementations must be cheap; a
/// sink that panics is isolated and never fails the request that emitted the
/// event.
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: TimingEvent, duration: Duration);
}

#[derive(Clone, Debug)]
pub struct MetricsSnapshot {
    pub attempts: u64,
    pub retries: u64,
    pub operations_succeeded: u64,
    pub operations_failed: u64,
    pub attempt_aborts: u64,
    pub execution_aborts: u64,
    pub service_errors: u64,
    pub transport_errors: u64,
    pub in_flight: u64,
    /// Total accumulated duration per timing event, in milliseconds, indexed
    /// as in [`TimingEvent::ALL`].
    pub event_totals_ms: [u64; 5],
    pub event_counts: [u64; 5],
}

impl MetricsSnapshot {
    pub fn event_total(&self, event: TimingEvent) -> Duration {
        Duration::from_millis(self.event_totals_ms[event.index()])
    }

    pub fn event_count(&self, event: TimingEvent) -> u64 {
        self.event_counts[event.index()]
    }
}

#[derive(Default)]
struct MetricsInner {
    attempts: AtomicU64,
    retries: AtomicU64,
    operations_succeeded: AtomicU64,
    operations_failed: AtomicU64,
    attempt_aborts: AtomicU64,
    execution_aborts: AtomicU64,
    service_errors: AtomicU64,
    transport_errors: AtomicU64,
    in_flight: AtomicU64,
    event_totals_ms: [AtomicU64; 5],
    event_counts: [AtomicU64; 5],
    sinks: Mutex<Vec<Arc<dyn MetricsSink>>>,
}

/// Shared, clone-cheap metrics accumulator. One collector may serve a whole
/// client or a single `ExecutionContext`; all mutation is atomic.
#[derive(Clone, Default)]
pub struct MetricsCollector {
    inner: Arc<MetricsInner>,
}

pub(crate) struct InFlightGuard {
    metrics: MetricsCollector,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sink: Arc<dyn MetricsSink>) {
        lock_unpoisoned(&self.inner.sinks).push(sink);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            attempts: load(&self.inner.attempts),
            retries: load(&self.inner.retries),
            operations_succeeded: load(&self.inner.operations_succeeded),
            operations_failed: load(&self.inner.operations_failed),
            attempt_aborts: load(&self.inner.attempt_aborts),
            execution_aborts: load(&self.inner.execution_aborts),
            service_errors: load(&self.inner.service_errors),
            transport_errors: load(&self.inner.transport_errors),
            in_flight: load(&self.inner.in_flight),
            event_totals_ms: std::array::from_fn(|i| load(&self.inner.event_totals_ms[i])),
            event_counts: std::array::from_fn(|i| load(&self.inner.event_counts[i])),
        }
    }

    /// Records a named timing event and fans it out to subscribers. Sink
    /// panics are swallowed: emission must never fail the request.
    pub fn record_timing(&self, event: TimingEvent, duration: Duration) {
        let index = event.index();
        self.inner.event_totals_ms[index].fetch_add(
            duration.as_millis().min(u64::MAX as u128) as u64,
            Ordering::Relaxed,
        );
        self.inner.event_counts[index].fetch_add(1, Ordering::Relaxed);

        let sinks = lock_unpoisoned(&self.inner.sinks).clone();
        for sink in sinks {
            if catch_unwind(AssertUnwindSafe(|| sink.record(event, duration))).is_err() {
                tracing::debug!(event = event.as_str(), "metrics sink panicked; ignoring");
            }
        }
    }

    pub(crate) fn record_attempt_started(&self) {
        self.inner.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_operation_succeeded(&self) {
        self.inner
            .operations_succeeded
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_operation_failed(&self) {
        self.inner.operations_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_attempt_abort(&self) {
        self.inner.attempt_aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_execution_abort(&self) {
        self.inner.execution_aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_service_error(&self) {
        self.inner.service_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transport_error(&self) {
        self.inner.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn enter_in_flight(&self) -> InFlightGuard {
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            metrics: self.clone(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::{MetricsCollector, MetricsSink, TimingEvent};
    use std::sync::Arc;
    use std::time::Duration;

    struct PanickingSink;

    impl MetricsSink for PanickingSink {
        fn record(&self, _event: TimingEvent, _duration: Duration) {
            panic!("sink failure");
        }
    }

    #[test]
    fn panicking_sink_does_not_poison_the_collector() {
        let metrics = MetricsCollector::new();
        metrics.subscribe(Arc::new(PanickingSink));
        metrics.record_timing(TimingEvent::Connect, Duration::from_millis(5));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.event_count(TimingEvent::Connect), 1);
        assert_eq!(
            snapshot.event_total(TimingEvent::Connect),
            Duration::from_millis(5)
        );
    }

    #[test]
    fn in_flight_guard_restores_the_gauge() {
        let metrics = MetricsCollector::new();
        {
            let _guard = metrics.enter_in_flight();
            assert_eq!(metrics.snapshot().in_flight, 1);
        }
        assert_eq!(metrics.snapshot().in_flight, 0);
    }

    #[test]
    fn timing_event_names_are_stable() {
        assert_eq!(TimingEvent::ReceiveHeaders.as_str(), "receive-headers");
        assert_eq!(TimingEvent::TotalOperation.as_str(), "total-operation");
    }
}
