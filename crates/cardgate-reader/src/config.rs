//! Job queue configuration.

use cardgate_core::constants::{
    DEFAULT_ENQUEUE_WAIT_MS, DEFAULT_QUEUE_CAPACITY, DEFAULT_SETTLE_DELAY_MS, MAX_TIMEOUT_MS,
};
use std::time::Duration;

/// Settings applied when a [`JobQueue`](crate::JobQueue) starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Poll timeout given to the session before the worker starts.
    pub timeout: Duration,

    /// Jobs that may wait in the queue at once.
    pub capacity: usize,

    /// How long `submit` waits for a free slot.
    pub enqueue_wait: Duration,

    /// Pause after each job before the next one is taken.
    pub settle_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(MAX_TIMEOUT_MS),
            capacity: DEFAULT_QUEUE_CAPACITY,
            enqueue_wait: Duration::from_millis(DEFAULT_ENQUEUE_WAIT_MS),
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
        }
    }
}

impl QueueConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the queue capacity; values below 1 are raised to 1.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_enqueue_wait(mut self, wait: Duration) -> Self {
        self.enqueue_wait = wait;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.timeout, Duration::from_millis(0xFFFF_FFFF));
        assert_eq!(config.enqueue_wait, Duration::from_millis(10));
        assert_eq!(config.settle_delay, Duration::from_millis(500));
        assert!(config.capacity >= 1);
    }

    #[test]
    fn test_builder_clamps_capacity() {
        let config = QueueConfig::default()
            .with_capacity(0)
            .with_timeout(Duration::from_secs(3))
            .with_settle_delay(Duration::ZERO);

        assert_eq!(config.capacity, 1);
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert_eq!(config.settle_delay, Duration::ZERO);
    }
}
