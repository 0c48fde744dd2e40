use std::time::Duration;

/// Timeouts shared by the host router and the guest port.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Default deadline for `invoke`. `None` waits forever.
    pub invoke_timeout: Option<Duration>,
    /// Deadline for a guest's `send_sync`. `None` blocks forever.
    pub sync_timeout: Option<Duration>,
    /// How long a cancelled correlation id keeps discarding late replies.
    pub marker_ttl: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            invoke_timeout: Some(Duration::from_secs(30)),
            sync_timeout: Some(Duration::from_secs(30)),
            marker_ttl: Duration::from_secs(60),
        }
    }
}

impl RouterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_invoke_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn with_marker_ttl(mut self, ttl: Duration) -> Self {
        self.marker_ttl = ttl;
        self
    }
}
