//! Runtime configuration

use std::time::Duration;

/// Settings shared by the thread pool, its schedulers and the watchdog
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Put every runner added without an explicit group on its own thread
    pub private_threads_by_default: bool,
    /// How long the first step after entering stepping mode waits for quiescence
    pub drain_timeout: Duration,
    /// Operations running longer than this are reported by the watchdog
    pub watchdog_threshold: Duration,
    /// How often the watchdog scans for stalled operations
    pub watchdog_interval: Duration,
    /// Prefix for worker thread names
    pub thread_name_prefix: String,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self {
            private_threads_by_default: false,
            drain_timeout: Duration::from_secs(5),
            watchdog_threshold: Duration::from_secs(5),
            watchdog_interval: Duration::from_secs(1),
            thread_name_prefix: "flow".to_string(),
        }
    }

    pub fn with_private_threads(mut self, private: bool) -> Self {
        self.private_threads_by_default = private;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_watchdog_threshold(mut self, threshold: Duration) -> Self {
        self.watchdog_threshold = threshold;
        self
    }

    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides_defaults() {
        let config = RuntimeConfig::new()
            .with_private_threads(true)
            .with_drain_timeout(Duration::from_millis(250))
            .with_thread_name_prefix("test");

        assert!(config.private_threads_by_default);
        assert_eq!(config.drain_timeout, Duration::from_millis(250));
        assert_eq!(config.thread_name_prefix, "test");
        assert_eq!(config.watchdog_threshold, Duration::from_secs(5));
    }
}
