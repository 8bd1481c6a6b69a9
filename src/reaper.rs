use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::ExecutionError;
use crate::pool::ConnectionPool;
use crate::util::lock_unpoisoned;

/// What the reaper needs from a pool: close connections idle past a
/// threshold. Kept as a trait so tests can register doubles.
pub trait ReapablePool: Send + Sync {
    fn close_idle(&self, older_than: Duration) -> usize;
}

impl ReapablePool for ConnectionPool {
    fn close_idle(&self, older_than: Duration) -> usize {
        ConnectionPool::close_idle(self, older_than)
    }
}

struct Registration {
    pool: Arc<dyn ReapablePool>,
    idle_threshold: Duration,
}

struct ReaperState {
    registrations: Vec<Registration>,
    period: Duration,
    worker_running: bool,
    stop_requested: bool,
}

struct ReaperInner {
    state: Mutex<ReaperState>,
    wakeup: Condvar,
}

/// Background sweeper that periodically closes expired idle connections in
/// every registered pool.
///
/// An explicit instance, created once and shared by the clients that want
/// reaping; there is no process-global registry. The worker thread starts
/// with the first registration, stops when the last pool deregisters or
/// `shutdown_all` runs, and restarts if a pool registers afterwards.
#[derive(Clone)]
pub struct IdleConnectionReaper {
    inner: Arc<ReaperInner>,
}

pub const DEFAULT_REAP_PERIOD: Duration = Duration::from_secs(60);

impl Default for IdleConnectionReaper {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleConnectionReaper {
    pub fn new() -> Self {
        Self::with_period(DEFAULT_REAP_PERIOD)
    }

    pub fn with_period(period: Duration) -> Self {
        Self {
            inner: Arc::new(ReaperInner {
                state: Mutex::new(ReaperState {
                    registrations: Vec::new(),
                    period: if period.is_zero() {
                        DEFAULT_REAP_PERIOD
                    } else {
                        period
                    },
                    worker_running: false,
                    stop_requested: false,
                }),
                wakeup: Condvar::new(),
            }),
        }
    }

    /// Registers `pool` for sweeping; connections idle for at least
    /// `idle_threshold` are closed on each pass. Returns `false` when the
    /// pool is already registered (its threshold is left unchanged). A zero
    /// threshold is rejected.
    pub fn register_pool(
        &self,
        pool: Arc<dyn ReapablePool>,
        idle_threshold: Duration,
    ) -> Result<bool, ExecutionError> {
        if idle_threshold.is_zero() {
            return Err(ExecutionError::invalid_argument(
                "idle threshold must be greater than zero",
            ));
        }
        let mut state = lock_unpoisoned(&self.inner.state);
        if state
            .registrations
            .iter()
            .any(|registration| Arc::ptr_eq(&registration.pool, &pool))
        {
            return Ok(false);
        }
        state.registrations.push(Registration {
            pool,
            idle_threshold,
        });
        // A stop may still be pending from deregistering the previous last
        // pool; this registration supersedes it whether or not the worker
        // already exited.
        state.stop_requested = false;
        if !state.worker_running {
            state.worker_running = true;
            let inner = Arc::clone(&self.inner);
            std::thread::Builder::new()
                .name("reqcore-idle-reaper".to_owned())
                .spawn(move || run_reaper(inner))
                .expect("failed to spawn idle reaper thread");
        }
        drop(state);
        self.inner.wakeup.notify_all();
        Ok(true)
    }

    /// Removes `pool` from the sweep set. Returns `true` when it was
    /// registered. The worker thread stops once no pools remain.
    pub fn deregister_pool(&self, pool: &Arc<dyn ReapablePool>) -> bool {
        let mut state = lock_unpoisoned(&self.inner.state);
        let before = state.registrations.len();
        state
            .registrations
            .retain(|registration| !Arc::ptr_eq(&registration.pool, pool));
        let removed = state.registrations.len() != before;
        if removed && state.registrations.is_empty() {
            state.stop_requested = true;
        }
        drop(state);
        if removed {
            self.inner.wakeup.notify_all();
        }
        removed
    }

    /// Changes the sweep period. Takes effect immediately, including for a
    /// sleep already in progress. A zero period is rejected.
    pub fn set_period(&self, period: Duration) -> Result<(), ExecutionError> {
        if period.is_zero() {
            return Err(ExecutionError::invalid_argument(
                "reap period must be greater than zero",
            ));
        }
        lock_unpoisoned(&self.inner.state).period = period;
        self.inner.wakeup.notify_all();
        Ok(())
    }

    /// Deregisters every pool and stops the worker. Returns `true` when a
    /// worker was running, `false` when there was nothing to stop (including
    /// a repeated call).
    pub fn shutdown_all(&self) -> bool {
        let mut state = lock_unpoisoned(&self.inner.state);
        state.registrations.clear();
        let was_running = state.worker_running;
        if was_running {
            state.stop_requested = true;
        }
        drop(state);
        self.inner.wakeup.notify_all();
        was_running
    }

    pub fn size(&self) -> usize {
        lock_unpoisoned(&self.inner.state).registrations.len()
    }

    #[cfg(test)]
    fn worker_running(&self) -> bool {
        lock_unpoisoned(&self.inner.state).worker_running
    }
}

fn run_reaper(inner: Arc<ReaperInner>) {
    let mut state = lock_unpoisoned(&inner.state);
    loop {
        if state.stop_requested || state.registrations.is_empty() {
            state.worker_running = false;
            state.stop_requested = false;
            return;
        }
        let period = state.period;
        let (guard, _) = match inner.wakeup.wait_timeout(state, period) {
            Ok(result) => result,
            Err(poisoned) => poisoned.into_inner(),
        };
        state = guard;
        if state.stop_requested || state.registrations.is_empty() {
            continue;
        }

        // Sweep outside the lock so a slow close never blocks registration.
        let sweep: Vec<(Arc<dyn ReapablePool>, Duration)> = state
            .registrations
            .iter()
            .map(|registration| (Arc::clone(&registration.pool), registration.idle_threshold))
            .collect();
        drop(state);
        for (pool, idle_threshold) in sweep {
            let closed = pool.close_idle(idle_threshold);
            if closed > 0 {
                tracing::debug!(closed, "idle connection sweep");
            }
        }
        state = lock_unpoisoned(&inner.state);
    }
}

#[cfg(test)]
mod tests {
    use super::{IdleConnectionReaper, ReapablePool};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct CountingPool {
        sweeps: AtomicUsize,
    }

    impl ReapablePool for CountingPool {
        fn close_idle(&self, _older_than: Duration) -> usize {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            1
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
    fn registered_pool_is_swept_periodically() {
        let reaper = IdleConnectionReaper::with_period(Duration::from_millis(10));
        let pool = Arc::new(CountingPool::default());
        let handle: Arc<dyn ReapablePool> = pool.clone();
        assert!(reaper.register_pool(handle, Duration::from_secs(1)).unwrap());
        assert!(wait_until(Duration::from_secs(2), || {
            pool.sweeps.load(Ordering::SeqCst) >= 3
        }));
        assert!(reaper.shutdown_all());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let reaper = IdleConnectionReaper::with_period(Duration::from_secs(60));
        let handle: Arc<dyn ReapablePool> = Arc::new(CountingPool::default());
        assert!(
            reaper
                .register_pool(handle.clone(), Duration::from_secs(1))
                .unwrap()
        );
        assert!(
            !reaper
                .register_pool(handle.clone(), Duration::from_secs(1))
                .unwrap()
        );
        assert_eq!(reaper.size(), 1);
        reaper.shutdown_all();
    }

    #[test]
    fn zero_idle_threshold_is_an_invalid_argument() {
        let reaper = IdleConnectionReaper::new();
        let handle: Arc<dyn ReapablePool> = Arc::new(CountingPool::default());
        assert!(reaper.register_pool(handle, Duration::ZERO).is_err());
        assert_eq!(reaper.size(), 0);
    }

    #[test]
    fn zero_period_is_an_invalid_argument() {
        let reaper = IdleConnectionReaper::new();
        assert!(reaper.set_period(Duration::ZERO).is_err());
        assert!(reaper.set_period(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn deregistering_the_last_pool_stops_the_worker() {
        let reaper = IdleConnectionReaper::with_period(Duration::from_millis(10));
        let handle: Arc<dyn ReapablePool> = Arc::new(CountingPool::default());
        reaper
            .register_pool(handle.clone(), Duration::from_secs(1))
            .unwrap();
        assert!(reaper.deregister_pool(&handle));
        assert!(!reaper.deregister_pool(&handle));
        assert!(wait_until(Duration::from_secs(2), || {
            !reaper.worker_running()
        }));
        assert_eq!(reaper.size(), 0);
    }

    #[test]
    fn shutdown_all_reports_false_the_second_time() {
        let reaper = IdleConnectionReaper::with_period(Duration::from_millis(10));
        let handle: Arc<dyn ReapablePool> = Arc::new(CountingPool::default());
        reaper.register_pool(handle, Duration::from_secs(1)).unwrap();
        assert!(reaper.shutdown_all());
        assert!(wait_until(Duration::from_secs(2), || {
            !reaper.worker_running()
        }));
        assert!(!reaper.shutdown_all());
        assert_eq!(reaper.size(), 0);
    }

    #[test]
    fn register_immediately_after_deregistering_the_last_pool_keeps_sweeping() {
        let reaper = IdleConnectionReaper::with_period(Duration::from_millis(2));
        let first: Arc<dyn ReapablePool> = Arc::new(CountingPool::default());
        reaper
            .register_pool(first.clone(), Duration::from_secs(1))
            .unwrap();

        // No intervening wait: the worker may still be alive with a pending
        // stop when the second pool registers.
        assert!(reaper.deregister_pool(&first));
        let pool = Arc::new(CountingPool::default());
        let handle: Arc<dyn ReapablePool> = pool.clone();
        assert!(reaper.register_pool(handle, Duration::from_secs(1)).unwrap());

        assert!(wait_until(Duration::from_secs(2), || {
            pool.sweeps.load(Ordering::SeqCst) >= 1
        }));
        reaper.shutdown_all();
    }

    #[test]
    fn registration_after_shutdown_restarts_the_worker() {
        let reaper = IdleConnectionReaper::with_period(Duration::from_millis(10));
        let first: Arc<dyn ReapablePool> = Arc::new(CountingPool::default());
        reaper.register_pool(first, Duration::from_secs(1)).unwrap();
        reaper.shutdown_all();
        assert!(wait_until(Duration::from_secs(2), || {
            !reaper.worker_running()
        }));

        let pool = Arc::new(CountingPool::default());
        let handle: Arc<dyn ReapablePool> = pool.clone();
        assert!(reaper.register_pool(handle, Duration::from_secs(1)).unwrap());
        assert!(wait_until(Duration::from_secs(2), || {
            pool.sweeps.load(Ordering::SeqCst) >= 1
        }));
        reaper.shutdown_all();
    }
}
