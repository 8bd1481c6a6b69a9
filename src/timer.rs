use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::context::{AbortHandle, AbortSignal};
use crate::util::lock_unpoisoned;

/// How long the worker thread lingers with an empty queue before retiring.
/// It is respawned lazily by the next `schedule` call.
const WORKER_IDLE_RETIREMENT: Duration = Duration::from_secs(5);

const STATE_SCHEDULED: u8 = 0;
const STATE_CANCELLED: u8 = 1;
const STATE_FIRED: u8 = 2;

/// One scheduled cancellation unit. State machine:
/// `Scheduled -> {Cancelled | Fired}`, both terminal; the CAS on `state`
/// makes the transition race-free so a task can neither fire twice nor fire
/// after a successful cancel.
struct TimerTask {
    state: AtomicU8,
    callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl TimerTask {
    fn fire(&self) {
        if self
            .state
            .compare_exchange(
                STATE_SCHEDULED,
                STATE_FIRED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }
        let callback = lock_unpoisoned(&self.callback).take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// Handle to a scheduled watchdog task. A handle for a disabled timeout holds
/// no task at all; cancelling it is a no-op and it never reports fired.
pub struct TimerHandle {
    task: Option<Arc<TimerTask>>,
}

impl TimerHandle {
    pub(crate) fn disabled() -> Self {
        Self { task: None }
    }

    pub fn is_scheduled(&self) -> bool {
        self.task
            .as_ref()
            .is_some_and(|task| task.state.load(Ordering::SeqCst) == STATE_SCHEDULED)
    }

    pub fn has_fired(&self) -> bool {
        self.task
            .as_ref()
            .is_some_and(|task| task.state.load(Ordering::SeqCst) == STATE_FIRED)
    }

    /// Cancels the pending task. Returns `true` when this call won the race
    /// against the deadline; cancelling an already-fired or already-cancelled
    /// task is a no-op returning `false`.
    pub fn cancel(&self) -> bool {
        let Some(task) = &self.task else {
            return false;
        };
        let cancelled = task
            .state
            .compare_exchange(
                STATE_SCHEDULED,
                STATE_CANCELLED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if cancelled {
            // Drop the callback eagerly so captured handles release now
            // rather than when the queue entry is popped.
            lock_unpoisoned(&task.callback).take();
        }
        cancelled
    }
}

struct QueueEntry {
    deadline: Instant,
    sequence: u64,
    task: Arc<TimerTask>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct SchedulerState {
    queue: BinaryHeap<QueueEntry>,
    worker_running: bool,
    next_sequence: u64,
}

struct SchedulerShared {
    state: Mutex<SchedulerState>,
    condvar: Condvar,
}

/// Shared scheduled-task service backing both watchdog flavors.
///
/// One instance serves any number of concurrent executions; the single worker
/// thread is created lazily on first use and retires after an idle period, so
/// resource usage stays bounded under high concurrency. Intended to be built
/// once per process and injected into clients; tests construct isolated
/// instances.
#[derive(Clone)]
pub struct TimerScheduler {
    shared: Arc<SchedulerShared>,
}

impl Default for TimerScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerScheduler {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                state: Mutex::new(SchedulerState {
                    queue: BinaryHeap::new(),
                    worker_running: false,
                    next_sequence: 0,
                }),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Schedules `on_fire` to run once `delay` elapses, unless the returned
    /// handle is cancelled first.
    pub fn schedule(
        &self,
        delay: Duration,
        on_fire: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        let task = Arc::new(TimerTask {
            state: AtomicU8::new(STATE_SCHEDULED),
            callback: Mutex::new(Some(Box::new(on_fire))),
        });

        let mut state = lock_unpoisoned(&self.shared.state);
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.queue.push(QueueEntry {
            deadline: Instant::now() + delay,
            sequence,
            task: Arc::clone(&task),
        });
        if !state.worker_running {
            state.worker_running = true;
            let shared = Arc::clone(&self.shared);
            std::thread::Builder::new()
                .name("reqcore-timer".to_owned())
                .spawn(move || run_worker(shared))
                .expect("failed to spawn timer worker thread");
        }
        drop(state);
        self.shared.condvar.notify_all();

        TimerHandle { task: Some(task) }
    }

    #[cfg(test)]
    fn worker_running(&self) -> bool {
        lock_unpoisoned(&self.shared.state).worker_running
    }
}

fn run_worker(shared: Arc<SchedulerShared>) {
    let mut state = lock_unpoisoned(&shared.state);
    loop {
        // Discard entries whose task already left the Scheduled state.
        while let Some(entry) = state.queue.peek() {
            if entry.task.state.load(Ordering::SeqCst) == STATE_SCHEDULED {
                break;
            }
            state.queue.pop();
        }

        let Some(next_deadline) = state.queue.peek().map(|entry| entry.deadline) else {
            let (guard, timeout) = match shared.condvar.wait_timeout(state, WORKER_IDLE_RETIREMENT)
            {
                Ok(result) => result,
                Err(poisoned) => {
                    let guard = poisoned.into_inner();
                    (guard.0, guard.1)
                }
            };
            state = guard;
            if timeout.timed_out() && state.queue.is_empty() {
                state.worker_running = false;
                return;
            }
            continue;
        };

        let now = Instant::now();
        if now < next_deadline {
            let (guard, _) = match shared.condvar.wait_timeout(state, next_deadline - now) {
                Ok(result) => result,
                Err(poisoned) => {
                    let guard = poisoned.into_inner();
                    (guard.0, guard.1)
                }
            };
            state = guard;
            continue;
        }

        let entry = state.queue.pop().expect("peeked entry disappeared");
        drop(state);
        entry.task.fire();
        state = lock_unpoisoned(&shared.state);
    }
}

/// Whole-operation watchdog. On fire it trips the execution's abort signal,
/// which unblocks any in-flight I/O and backoff sleep and surfaces as
/// `ClientExecutionAborted`; the execution is never retried past it.
#[derive(Clone)]
pub struct ClientExecutionTimer {
    scheduler: TimerScheduler,
}

impl ClientExecutionTimer {
    pub fn new(scheduler: TimerScheduler) -> Self {
        Self { scheduler }
    }

    /// Zero timeout means disabled: nothing is ever scheduled.
    pub fn start(&self, timeout: Duration, signal: &AbortSignal) -> TimerHandle {
        if timeout.is_zero() {
            return TimerHandle::disabled();
        }
        let signal = signal.clone();
        self.scheduler.schedule(timeout, move || {
            tracing::debug!(
                timeout_ms = timeout.as_millis() as u64,
                "client execution timer fired; aborting operation"
            );
            signal.abort();
        })
    }
}

/// Per-attempt watchdog. On fire it aborts only the connection carrying the
/// attempt, which surfaces to the executor as a retry-eligible attempt abort.
#[derive(Clone)]
pub struct RequestTimer {
    scheduler: TimerScheduler,
}

impl RequestTimer {
    pub fn new(scheduler: TimerScheduler) -> Self {
        Self { scheduler }
    }

    /// Zero timeout means disabled: nothing is ever scheduled.
    pub fn start(&self, timeout: Duration, target: Arc<dyn AbortHandle>) -> TimerHandle {
        if timeout.is_zero() {
            return TimerHandle::disabled();
        }
        self.scheduler.schedule(timeout, move || {
            tracing::debug!(
                timeout_ms = timeout.as_millis() as u64,
                "request timer fired; aborting in-flight attempt"
            );
            target.abort();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{ClientExecutionTimer, RequestTimer, TimerHandle, TimerScheduler};
    use crate::context::{AbortHandle, AbortSignal};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    struct CountingTarget {
        aborts: AtomicUsize,
    }

    impl AbortHandle for CountingTarget {
        fn abort(&self) {
            self.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let started = Instant::now();
        while started.elapsed() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn scheduled_task_fires_once_after_its_deadline() {
        let scheduler = TimerScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let handle = scheduler.schedule(Duration::from_millis(20), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(wait_until(Duration::from_secs(2), || handle.has_fired()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_before_deadline_prevents_the_callback() {
        let scheduler = TimerScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let handle = scheduler.schedule(Duration::from_millis(100), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handle.cancel());
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!handle.has_fired());
    }

    #[test]
    fn cancel_after_fire_is_a_noop() {
        let scheduler = TimerScheduler::new();
        let handle = scheduler.schedule(Duration::from_millis(10), || {});
        assert!(wait_until(Duration::from_secs(2), || handle.has_fired()));
        assert!(!handle.cancel());
        assert!(handle.has_fired());
    }

    #[test]
    fn double_cancel_reports_false_the_second_time() {
        let scheduler = TimerScheduler::new();
        let handle = scheduler.schedule(Duration::from_secs(60), || {});
        assert!(handle.cancel());
        assert!(!handle.cancel());
    }

    #[test]
    fn disabled_handle_never_schedules_or_fires() {
        let handle = TimerHandle::disabled();
        assert!(!handle.is_scheduled());
        assert!(!handle.has_fired());
        assert!(!handle.cancel());
    }

    #[test]
    fn execution_timer_with_zero_timeout_is_disabled() {
        let timer = ClientExecutionTimer::new(TimerScheduler::new());
        let signal = AbortSignal::new();
        let handle = timer.start(Duration::ZERO, &signal);
        assert!(!handle.is_scheduled());
        std::thread::sleep(Duration::from_millis(50));
        assert!(!signal.is_aborted());
    }

    #[test]
    fn execution_timer_trips_the_abort_signal() {
        let timer = ClientExecutionTimer::new(TimerScheduler::new());
        let signal = AbortSignal::new();
        let _handle = timer.start(Duration::from_millis(20), &signal);
        assert!(wait_until(Duration::from_secs(2), || signal.is_aborted()));
    }

    #[test]
    fn request_timer_aborts_only_its_target() {
        let timer = RequestTimer::new(TimerScheduler::new());
        let target = Arc::new(CountingTarget {
            aborts: AtomicUsize::new(0),
        });
        let _handle = timer.start(Duration::from_millis(20), target.clone());
        assert!(wait_until(Duration::from_secs(2), || {
            target.aborts.load(Ordering::SeqCst) == 1
        }));
    }

    #[test]
    fn worker_retires_when_idle_and_respawns_on_demand() {
        let scheduler = TimerScheduler::new();
        let handle = scheduler.schedule(Duration::from_millis(5), || {});
        assert!(wait_until(Duration::from_secs(2), || handle.has_fired()));
        assert!(wait_until(Duration::from_secs(10), || {
            !scheduler.worker_running()
        }));

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let handle = scheduler.schedule(Duration::from_millis(5), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(wait_until(Duration::from_secs(2), || handle.has_fired()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn many_tasks_share_one_worker_and_fire_in_deadline_order() {
        let scheduler = TimerScheduler::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for (index, delay_ms) in [(0_usize, 60_u64), (1, 20), (2, 40)] {
            let order = Arc::clone(&order);
            handles.push(scheduler.schedule(Duration::from_millis(delay_ms), move || {
                order.lock().unwrap().push(index);
            }));
        }
        assert!(wait_until(Duration::from_secs(2), || {
            handles.iter().all(TimerHandle::has_fired)
        }));
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 0]);
    }
}
