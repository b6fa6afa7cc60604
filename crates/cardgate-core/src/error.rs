//! Error taxonomy for card reads and job submission.
//!
//! Read failures never cross the session boundary as `Err`: the session turns
//! them into a failed [`ReadResult`](crate::ReadResult) whose `error` text is
//! the `Display` of one of these variants. Submission failures
//! ([`Error::QueueFull`], [`Error::QueueClosed`]) are returned directly.

use crate::constants::LOCK_CONTENTION_MESSAGE;
use crate::types::JobId;

/// Result type alias for cardgate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reading a card or scheduling a read.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Context or reader setup failed.
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// A status, connect, transmit or disconnect call failed.
    #[error("Device communication error during {operation}: {message}")]
    DeviceComm { operation: String, message: String },

    /// The session has no context or selected reader.
    #[error("not connected to any card reader")]
    NotConnected,

    /// No card showed up within the configured timeout.
    #[error("timeout exceeded after {duration_ms}ms, no card detected")]
    Timeout { duration_ms: u64 },

    /// The read observed a cancellation request.
    #[error("card read cancelled")]
    Cancelled,

    /// Another read holds the session.
    #[error("{}", LOCK_CONTENTION_MESSAGE)]
    LockContention,

    /// The queue stayed full for the whole enqueue wait; the job was dropped.
    #[error("job queue full, job {job_id} dropped after {waited_ms}ms")]
    QueueFull { job_id: JobId, waited_ms: u64 },

    /// The queue has been shut down.
    #[error("job queue is shut down")]
    QueueClosed,

    /// The queue worker thread could not be started.
    #[error("failed to start worker thread: {message}")]
    Worker { message: String },
}

impl Error {
    /// Create a new connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new device communication error.
    pub fn device_comm(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DeviceComm {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a new timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Whether the read stopped because someone asked it to.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_lock_contention_message() {
        assert_eq!(Error::LockContention.to_string(), "failed to acquire mutex");
    }

    #[test]
    fn test_device_comm_error() {
        let error = Error::device_comm("transmit", "Card was removed");
        assert!(matches!(error, Error::DeviceComm { .. }));
        assert_eq!(
            error.to_string(),
            "Device communication error during transmit: Card was removed"
        );
    }

    #[test]
    fn test_timeout_error() {
        let error = Error::timeout(3000);
        assert_eq!(
            error.to_string(),
            "timeout exceeded after 3000ms, no card detected"
        );
    }

    #[rstest]
    #[case(Error::Cancelled, true)]
    #[case(Error::timeout(0), false)]
    #[case(Error::LockContention, false)]
    #[case(Error::NotConnected, false)]
    fn test_is_cancelled(#[case] error: Error, #[case] expected: bool) {
        assert_eq!(error.is_cancelled(), expected);
    }

    #[test]
    fn test_queue_full_names_job() {
        let error = Error::QueueFull {
            job_id: JobId::new(7),
            waited_ms: 10,
        };
        assert_eq!(error.to_string(), "job queue full, job 7 dropped after 10ms");
    }
}
