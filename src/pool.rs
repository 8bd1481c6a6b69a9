use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::context::{AbortHandle, AbortSignal};
use crate::error::{ExecutionErrorKind, TransportError, TransportErrorKind};
use crate::request::{Request, Route};
use crate::response::Response;
use crate::util::lock_unpoisoned;

/// One established transport connection. `send` blocks until response headers
/// arrive; `abort_handle` returns a handle that unblocks that call from
/// another thread, after which `send` fails and `is_open` reports false.
pub trait Connection: Send {
    fn send(&mut self, request: &mut Request) -> Result<Response, TransportError>;
    fn abort_handle(&self) -> Arc<dyn AbortHandle>;
    fn is_open(&self) -> bool;
    fn close(&mut self);
    fn set_socket_timeout(&mut self, _timeout: Duration) {}
}

/// Establishes new connections for the pool. Implementations own the actual
/// dialing (TCP, TLS, a test double); the pool never touches sockets itself.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        route: &Route,
        connect_timeout: Duration,
    ) -> Result<Box<dyn Connection>, TransportError>;
}

struct IdleConnection {
    connection: Box<dyn Connection>,
    idle_since: Instant,
}

#[derive(Default)]
struct RouteCounts {
    leased: usize,
    idle: usize,
}

impl RouteCounts {
    fn total(&self) -> usize {
        self.leased + self.idle
    }
}

struct PoolState {
    idle: HashMap<Route, VecDeque<IdleConnection>>,
    counts: HashMap<Route, RouteCounts>,
    total_leased: usize,
    total_idle: usize,
    shut_down: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.total_leased + self.total_idle
    }

    fn route_counts(&mut self, route: &Route) -> &mut RouteCounts {
        self.counts.entry(route.clone()).or_default()
    }

    fn drop_lease(&mut self, route: &Route) {
        self.total_leased -= 1;
        if let Some(counts) = self.counts.get_mut(route) {
            counts.leased = counts.leased.saturating_sub(1);
            if counts.total() == 0 {
                self.counts.remove(route);
            }
        }
    }
}

struct PoolInner {
    state: Mutex<PoolState>,
    available: Condvar,
    connector: Arc<dyn Connector>,
    max_connections: usize,
    max_connections_per_route: usize,
}

/// Blocking connection pool keyed by route.
///
/// `lease` reuses the most recently parked idle connection for the route,
/// dials a new one while capacity allows, and otherwise blocks on the condvar
/// until a connection is released or the connect timeout expires. Releasing a
/// reusable connection parks it idle; anything else is closed and its slot
/// freed. All waiters are woken on release and on shutdown.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

/// Point-in-time occupancy, for diagnostics and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub leased: usize,
    pub idle: usize,
}

impl ConnectionPool {
    pub fn new(
        connector: Arc<dyn Connector>,
        max_connections: usize,
        max_connections_per_route: usize,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    idle: HashMap::new(),
                    counts: HashMap::new(),
                    total_leased: 0,
                    total_idle: 0,
                    shut_down: false,
                }),
                available: Condvar::new(),
                connector,
                max_connections: max_connections.max(1),
                max_connections_per_route: max_connections_per_route.max(1),
            }),
        }
    }

    /// Acquires a connection for `route`, blocking up to `connect_timeout`
    /// for a free slot. `Duration::ZERO` waits without bound. Returns
    /// `PoolExhausted` when the wait times out, `PoolShutdown` once the pool
    /// is shut down, and the connector's classified error when dialing fails.
    pub fn lease(
        &self,
        route: &Route,
        connect_timeout: Duration,
    ) -> Result<PooledConnection, ExecutionErrorKind> {
        self.lease_abortable(route, connect_timeout, None)
    }

    /// `lease` that also honors an operation-level abort signal: a trip of
    /// the signal unblocks the wait, even when `connect_timeout` is zero and
    /// the wait would otherwise be unbounded.
    pub fn lease_abortable(
        &self,
        route: &Route,
        connect_timeout: Duration,
        abort: Option<&AbortSignal>,
    ) -> Result<PooledConnection, ExecutionErrorKind> {
        let wait_deadline = if connect_timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + connect_timeout)
        };
        // The signal's condvar is not ours, so an aborted waiter is woken by
        // bounding each wait slice and re-checking the flag.
        let wait_slice = if abort.is_some() {
            Duration::from_millis(20)
        } else {
            Duration::from_millis(500)
        };

        let mut state = lock_unpoisoned(&self.inner.state);
        loop {
            if state.shut_down {
                return Err(ExecutionErrorKind::PoolShutdown);
            }
            if abort.is_some_and(AbortSignal::is_aborted) {
                return Err(ExecutionErrorKind::ClientExecutionAborted {
                    timeout_ms: connect_timeout.as_millis(),
                });
            }

            // Most recently parked first, so cold connections age out via the
            // reaper rather than getting picked up again.
            while let Some(idle) = state
                .idle
                .get_mut(route)
                .and_then(|parked| parked.pop_front())
            {
                state.total_idle -= 1;
                let counts = state.route_counts(route);
                counts.idle -= 1;
                if !idle.connection.is_open() {
                    continue;
                }
                counts.leased += 1;
                state.total_leased += 1;
                return Ok(PooledConnection {
                    pool: self.clone(),
                    route: route.clone(),
                    connection: Some(idle.connection),
                    reusable: false,
                });
            }

            let route_total = state.route_counts(route).total();
            if state.total() < self.inner.max_connections
                && route_total < self.inner.max_connections_per_route
            {
                // Hold the slot while dialing outside the lock.
                state.route_counts(route).leased += 1;
                state.total_leased += 1;
                drop(state);

                match self.inner.connector.connect(route, connect_timeout) {
                    Ok(connection) => {
                        return Ok(PooledConnection {
                            pool: self.clone(),
                            route: route.clone(),
                            connection: Some(connection),
                            reusable: false,
                        });
                    }
                    Err(transport) => {
                        let mut state = lock_unpoisoned(&self.inner.state);
                        state.drop_lease(route);
                        drop(state);
                        self.inner.available.notify_all();
                        if transport.kind == TransportErrorKind::Connect
                            && transport.is_timeout()
                        {
                            return Err(ExecutionErrorKind::ConnectTimeout {
                                route: route.clone(),
                                timeout_ms: connect_timeout.as_millis(),
                            });
                        }
                        return Err(transport.into());
                    }
                }
            }

            state = match wait_deadline {
                None => {
                    let (guard, _) = match self.inner.available.wait_timeout(state, wait_slice) {
                        Ok(result) => result,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    guard
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::warn!(
                            route = %route,
                            timeout_ms = connect_timeout.as_millis() as u64,
                            "connection pool exhausted"
                        );
                        return Err(ExecutionErrorKind::PoolExhausted {
                            route: route.clone(),
                        });
                    }
                    let (guard, _) = match self
                        .inner
                        .available
                        .wait_timeout(state, (deadline - now).min(wait_slice))
                    {
                        Ok(result) => result,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    guard
                }
            };
        }
    }

    /// Closes idle connections parked for at least `older_than` and drops any
    /// that died while parked. Returns the number closed. Leased connections
    /// are never touched.
    pub fn close_idle(&self, older_than: Duration) -> usize {
        let mut reaped = Vec::new();
        {
            let mut state = lock_unpoisoned(&self.inner.state);
            let mut emptied_routes = Vec::new();
            for (route, parked) in state.idle.iter_mut() {
                let before = parked.len();
                parked.retain_mut(|idle| {
                    let keep =
                        idle.connection.is_open() && idle.idle_since.elapsed() < older_than;
                    if !keep {
                        idle.connection.close();
                    }
                    keep
                });
                let removed = before - parked.len();
                if removed > 0 {
                    reaped.push((route.clone(), removed));
                }
                if parked.is_empty() {
                    emptied_routes.push(route.clone());
                }
            }
            for (route, removed) in &reaped {
                state.total_idle -= removed;
                if let Some(counts) = state.counts.get_mut(route) {
                    counts.idle -= removed;
                    if counts.total() == 0 {
                        state.counts.remove(route);
                    }
                }
            }
            for route in emptied_routes {
                state.idle.remove(&route);
            }
        }
        let closed: usize = reaped.iter().map(|(_, removed)| removed).sum();
        if closed > 0 {
            tracing::debug!(closed, "reaped idle connections");
            self.inner.available.notify_all();
        }
        closed
    }

    /// Shuts the pool down: closes every idle connection and fails all
    /// current and future `lease` calls with `PoolShutdown`. Idempotent.
    /// Leased connections are closed as they come back.
    pub fn shutdown(&self) {
        let parked = {
            let mut state = lock_unpoisoned(&self.inner.state);
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.total_idle = 0;
            for counts in state.counts.values_mut() {
                counts.idle = 0;
            }
            state.counts.retain(|_, counts| counts.total() > 0);
            std::mem::take(&mut state.idle)
        };
        for (_, connections) in parked {
            for mut idle in connections {
                idle.connection.close();
            }
        }
        self.inner.available.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        lock_unpoisoned(&self.inner.state).shut_down
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock_unpoisoned(&self.inner.state);
        PoolStats {
            leased: state.total_leased,
            idle: state.total_idle,
        }
    }

    fn release(&self, route: &Route, mut connection: Box<dyn Connection>, reusable: bool) {
        let mut state = lock_unpoisoned(&self.inner.state);
        state.drop_lease(route);
        if reusable && connection.is_open() && !state.shut_down {
            state.route_counts(route).idle += 1;
            state.total_idle += 1;
            state
                .idle
                .entry(route.clone())
                .or_default()
                .push_front(IdleConnection {
                    connection,
                    idle_since: Instant::now(),
                });
        } else {
            connection.close();
        }
        drop(state);
        self.inner.available.notify_all();
    }
}

/// Leased connection. Dropping it returns the slot to the pool; the
/// connection itself is parked for reuse only after `mark_reusable(true)`,
/// otherwise it is closed. Default is close, so an attempt that aborts or
/// errors can never leak a dirty connection back into the pool.
pub struct PooledConnection {
    pool: ConnectionPool,
    route: Route,
    connection: Option<Box<dyn Connection>>,
    reusable: bool,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("route", &self.route)
            .field("reusable", &self.reusable)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    pub fn send(&mut self, request: &mut Request) -> Result<Response, TransportError> {
        self.connection
            .as_mut()
            .expect("connection taken before drop")
            .send(request)
    }

    pub fn abort_handle(&self) -> Arc<dyn AbortHandle> {
        self.connection
            .as_ref()
            .expect("connection taken before drop")
            .abort_handle()
    }

    pub fn set_socket_timeout(&mut self, timeout: Duration) {
        if let Some(connection) = self.connection.as_mut() {
            connection.set_socket_timeout(timeout);
        }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn mark_reusable(&mut self, reusable: bool) {
        self.reusable = reusable;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(&self.route, connection, self.reusable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Connection, ConnectionPool, Connector};
    use crate::context::AbortHandle;
    use crate::error::{ExecutionErrorKind, TransportError, TransportErrorKind};
    use crate::request::{Request, Route};
    use crate::response::{Response, ResponseBody};
    use http::{HeaderMap, Method, StatusCode, Uri};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeAbort;

    impl AbortHandle for FakeAbort {
        fn abort(&self) {}
    }

    struct FakeConnection {
        open: Arc<AtomicBool>,
    }

    impl Connection for FakeConnection {
        fn send(&mut self, _request: &mut Request) -> Result<Response, TransportError> {
            Ok(Response::new(
                StatusCode::OK,
                HeaderMap::new(),
                ResponseBody::Empty,
            ))
        }

        fn abort_handle(&self) -> Arc<dyn AbortHandle> {
            Arc::new(FakeAbort)
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn close(&mut self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        dialed: AtomicUsize,
    }

    impl FakeConnector {
        fn dialed(&self) -> usize {
            self.dialed.load(Ordering::SeqCst)
        }
    }

    impl Connector for FakeConnector {
        fn connect(
            &self,
            _route: &Route,
            _connect_timeout: Duration,
        ) -> Result<Box<dyn Connection>, TransportError> {
            self.dialed.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeConnection {
                open: Arc::new(AtomicBool::new(true)),
            }))
        }
    }

    struct RefusingConnector;

    impl Connector for RefusingConnector {
        fn connect(
            &self,
            _route: &Route,
            _connect_timeout: Duration,
        ) -> Result<Box<dyn Connection>, TransportError> {
            Err(TransportError::new(
                TransportErrorKind::Connect,
                std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            ))
        }
    }

    fn route() -> Route {
        Route::new("https", "api.example.com", 443)
    }

    fn request() -> Request {
        let uri: Uri = "https://api.example.com/v1".parse().unwrap();
        Request::new(Method::GET, uri)
    }

    #[test]
    fn released_reusable_connection_is_reused_without_redialing() {
        let connector = Arc::new(FakeConnector::default());
        let pool = ConnectionPool::new(connector.clone(), 4, 4);

        let mut leased = pool.lease(&route(), Duration::from_secs(1)).unwrap();
        leased.send(&mut request()).unwrap();
        leased.mark_reusable(true);
        drop(leased);
        assert_eq!(pool.stats().idle, 1);

        let _again = pool.lease(&route(), Duration::from_secs(1)).unwrap();
        assert_eq!(connector.dialed(), 1);
        assert_eq!(pool.stats().leased, 1);
        assert_eq!(pool.stats().idle, 0);
    }

    #[test]
    fn connection_dropped_without_reuse_is_closed_and_slot_freed() {
        let connector = Arc::new(FakeConnector::default());
        let pool = ConnectionPool::new(connector.clone(), 1, 1);

        let leased = pool.lease(&route(), Duration::from_secs(1)).unwrap();
        drop(leased);
        assert_eq!(pool.stats().leased, 0);
        assert_eq!(pool.stats().idle, 0);

        // The freed slot allows a fresh dial.
        let _again = pool.lease(&route(), Duration::from_secs(1)).unwrap();
        assert_eq!(connector.dialed(), 2);
    }

    #[test]
    fn lease_blocks_at_capacity_until_a_release_wakes_it() {
        let pool = ConnectionPool::new(Arc::new(FakeConnector::default()), 1, 1);
        let held = pool.lease(&route(), Duration::from_secs(1)).unwrap();

        let waiter_pool = pool.clone();
        let waiter = std::thread::spawn(move || {
            waiter_pool.lease(&route(), Duration::from_secs(5)).is_ok()
        });
        std::thread::sleep(Duration::from_millis(50));
        drop(held);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn lease_times_out_with_pool_exhausted_at_capacity() {
        let pool = ConnectionPool::new(Arc::new(FakeConnector::default()), 1, 1);
        let _held = pool.lease(&route(), Duration::from_secs(1)).unwrap();

        let error = pool.lease(&route(), Duration::from_millis(50)).unwrap_err();
        assert!(matches!(error, ExecutionErrorKind::PoolExhausted { .. }));
    }

    #[test]
    fn connect_failure_frees_the_reserved_slot() {
        let pool = ConnectionPool::new(Arc::new(RefusingConnector), 1, 1);
        let error = pool.lease(&route(), Duration::from_millis(50)).unwrap_err();
        assert!(matches!(
            error,
            ExecutionErrorKind::TransportError {
                kind: TransportErrorKind::Connect,
                ..
            }
        ));
        assert_eq!(pool.stats().leased, 0);
    }

    #[test]
    fn close_idle_reaps_only_connections_older_than_the_threshold() {
        let pool = ConnectionPool::new(Arc::new(FakeConnector::default()), 4, 4);
        let mut leased = pool.lease(&route(), Duration::from_secs(1)).unwrap();
        leased.mark_reusable(true);
        drop(leased);

        assert_eq!(pool.close_idle(Duration::from_secs(60)), 0);
        assert_eq!(pool.stats().idle, 1);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(pool.close_idle(Duration::from_millis(10)), 1);
        assert_eq!(pool.stats().idle, 0);
    }

    #[test]
    fn aborted_signal_unblocks_an_unbounded_lease_wait() {
        let pool = ConnectionPool::new(Arc::new(FakeConnector::default()), 1, 1);
        let _held = pool.lease(&route(), Duration::from_secs(1)).unwrap();

        let signal = crate::context::AbortSignal::new();
        let waiter_pool = pool.clone();
        let waiter_signal = signal.clone();
        let waiter = std::thread::spawn(move || {
            let started = std::time::Instant::now();
            let result =
                waiter_pool.lease_abortable(&route(), Duration::ZERO, Some(&waiter_signal));
            (result, started.elapsed())
        });
        std::thread::sleep(Duration::from_millis(50));
        signal.abort();

        let (result, waited) = waiter.join().unwrap();
        assert!(matches!(
            result.unwrap_err(),
            ExecutionErrorKind::ClientExecutionAborted { .. }
        ));
        assert!(waited < Duration::from_secs(5), "lease wait did not unblock");
    }

    #[test]
    fn shutdown_fails_new_leases_and_pending_waiters() {
        let pool = ConnectionPool::new(Arc::new(FakeConnector::default()), 1, 1);
        let _held = pool.lease(&route(), Duration::from_secs(1)).unwrap();

        let waiter_pool = pool.clone();
        let waiter = std::thread::spawn(move || {
            waiter_pool
                .lease(&route(), Duration::from_secs(30))
                .unwrap_err()
        });
        std::thread::sleep(Duration::from_millis(50));
        pool.shutdown();
        assert!(matches!(
            waiter.join().unwrap(),
            ExecutionErrorKind::PoolShutdown
        ));
        assert!(matches!(
            pool.lease(&route(), Duration::from_secs(1)).unwrap_err(),
            ExecutionErrorKind::PoolShutdown
        ));
        assert!(pool.is_shut_down());
    }

    #[test]
    fn shutdown_is_idempotent_and_closes_parked_connections() {
        let pool = ConnectionPool::new(Arc::new(FakeConnector::default()), 4, 4);
        let mut leased = pool.lease(&route(), Duration::from_secs(1)).unwrap();
        leased.mark_reusable(true);
        drop(leased);

        pool.shutdown();
        pool.shutdown();
        assert_eq!(pool.stats().idle, 0);
    }

    #[test]
    fn per_route_limit_holds_even_with_total_capacity_left() {
        let pool = ConnectionPool::new(Arc::new(FakeConnector::default()), 8, 1);
        let _held = pool.lease(&route(), Duration::from_secs(1)).unwrap();

        let error = pool.lease(&route(), Duration::from_millis(50)).unwrap_err();
        assert!(matches!(error, ExecutionErrorKind::PoolExhausted { .. }));

        // A different route still has room.
        let other = Route::new("https", "other.example.com", 443);
        assert!(pool.lease(&other, Duration::from_secs(1)).is_ok());
    }

    struct SharedFlagConnector {
        open: Arc<AtomicBool>,
        dialed: AtomicUsize,
    }

    impl Connector for SharedFlagConnector {
        fn connect(
            &self,
            _route: &Route,
            _connect_timeout: Duration,
        ) -> Result<Box<dyn Connection>, TransportError> {
            self.dialed.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeConnection {
                open: self.open.clone(),
            }))
        }
    }

    #[test]
    fn dead_idle_connection_is_discarded_and_replaced() {
        let open = Arc::new(AtomicBool::new(true));
        let connector = Arc::new(SharedFlagConnector {
            open: open.clone(),
            dialed: AtomicUsize::new(0),
        });
        let pool = ConnectionPool::new(connector.clone(), 4, 4);

        let mut leased = pool.lease(&route(), Duration::from_secs(1)).unwrap();
        leased.mark_reusable(true);
        drop(leased);
        assert_eq!(pool.stats().idle, 1);

        // Simulate the peer dropping the parked connection; the next lease
        // must discard it and dial fresh.
        open.store(false, Ordering::SeqCst);
        drop(pool.lease(&route(), Duration::from_secs(1)));
        assert_eq!(connector.dialed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().idle, 0);
    }
}
