use std::time::Duration;

/// Client-level tuning knobs. All timeouts treat `Duration::ZERO` as
/// disabled; per-request overrides take precedence over these values.
#[derive(Clone, Debug)]
pub struct ClientConfiguration {
    connect_timeout: Duration,
    socket_timeout: Duration,
    client_execution_timeout: Duration,
    max_connections: usize,
    max_connections_per_route: usize,
    max_connection_idle_time: Duration,
    use_connection_reaper: bool,
}

impl Default for ClientConfiguration {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            socket_timeout: Duration::from_secs(50),
            // Disabled by default; callers opt in to a whole-operation bound.
            client_execution_timeout: Duration::ZERO,
            max_connections: 50,
            max_connections_per_route: 50,
            max_connection_idle_time: Duration::from_secs(60),
            use_connection_reaper: true,
        }
    }
}

impl ClientConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound on acquiring a connection, covering both the wait for a pool
    /// slot and the dial itself. Zero disables the bound.
    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Per-attempt inactivity bound. When it elapses, only the attempt is
    /// aborted; the operation may still retry. Zero disables it.
    pub fn socket_timeout(mut self, socket_timeout: Duration) -> Self {
        self.socket_timeout = socket_timeout;
        self
    }

    /// Whole-operation wall-clock bound across all attempts, retries, and
    /// backoff sleeps. Zero disables it.
    pub fn client_execution_timeout(mut self, client_execution_timeout: Duration) -> Self {
        self.client_execution_timeout = client_execution_timeout;
        self
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    pub fn max_connections_per_route(mut self, max_connections_per_route: usize) -> Self {
        self.max_connections_per_route = max_connections_per_route.max(1);
        self
    }

    /// How long a parked connection may stay idle before the reaper closes
    /// it.
    pub fn max_connection_idle_time(mut self, max_connection_idle_time: Duration) -> Self {
        self.max_connection_idle_time = max_connection_idle_time.max(Duration::from_millis(1));
        self
    }

    pub fn use_connection_reaper(mut self, use_connection_reaper: bool) -> Self {
        self.use_connection_reaper = use_connection_reaper;
        self
    }

    pub fn connect_timeout_value(&self) -> Duration {
        self.connect_timeout
    }

    pub fn socket_timeout_value(&self) -> Duration {
        self.socket_timeout
    }

    pub fn client_execution_timeout_value(&self) -> Duration {
        self.client_execution_timeout
    }

    pub fn max_connections_value(&self) -> usize {
        self.max_connections
    }

    pub fn max_connections_per_route_value(&self) -> usize {
        self.max_connections_per_route
    }

    pub fn max_connection_idle_time_value(&self) -> Duration {
        self.max_connection_idle_time
    }

    pub fn use_connection_reaper_value(&self) -> bool {
        self.use_connection_reaper
    }
}

#[cfg(test)]
mod tests {
    use super::ClientConfiguration;
    use std::time::Duration;

    #[test]
    fn defaults_disable_only_the_execution_timeout() {
        let config = ClientConfiguration::default();
        assert!(config.client_execution_timeout_value().is_zero());
        assert!(!config.connect_timeout_value().is_zero());
        assert!(!config.socket_timeout_value().is_zero());
        assert!(config.use_connection_reaper_value());
    }

    #[test]
    fn connection_limits_are_clamped_to_at_least_one() {
        let config = ClientConfiguration::new()
            .max_connections(0)
            .max_connections_per_route(0);
        assert_eq!(config.max_connections_value(), 1);
        assert_eq!(config.max_connections_per_route_value(), 1);
    }

    #[test]
    fn zero_idle_time_is_clamped_rather_than_disabled() {
        let config = ClientConfiguration::new().max_connection_idle_time(Duration::ZERO);
        assert!(!config.max_connection_idle_time_value().is_zero());
    }
}
