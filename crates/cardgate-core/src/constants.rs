//! Core constants for card reads and job scheduling.
//!
//! Timing defaults and the command sent to a card are collected here so the
//! session, the queue and the CLI agree on them.
//!
//! # Usage
//!
//! ```
//! use cardgate_core::constants::*;
//! use std::time::Duration;
//!
//! assert_eq!(GET_UID_COMMAND.len(), 5);
//! assert_eq!(Duration::from_millis(DEFAULT_ENQUEUE_WAIT_MS).as_millis(), 10);
//! ```

// ============================================================================
// Card Commands
// ============================================================================

/// APDU requesting the unique identifier of the card on the reader.
///
/// ```text
/// FF  CA  00  00  00
/// CLA INS P1  P2  Le
/// ```
///
/// `Le = 00` asks the reader for the full-length identifier.
pub const GET_UID_COMMAND: [u8; 5] = [0xFF, 0xCA, 0x00, 0x00, 0x00];

/// Length of the status word (SW1 SW2) trailing every card response.
pub const STATUS_WORD_LEN: usize = 2;

// ============================================================================
// Timeouts
// ============================================================================

/// Largest poll timeout in milliseconds.
///
/// Used as the "wait forever" setting. It is not infinite: it works out to
/// roughly 50 days.
pub const MAX_TIMEOUT_MS: u64 = 0xFFFF_FFFF;

/// Timeout of a freshly created or reset session (instant return).
pub const DEFAULT_TIMEOUT_MS: u64 = 0;

/// Timeout passed to each individual status poll.
///
/// Polls start from an UNAWARE state, so the driver reports the current state
/// at once; the session loops on its own deadline instead.
pub const POLL_TIMEOUT_MS: u64 = 0;

// ============================================================================
// Job Queue
// ============================================================================

/// How long `submit` waits for queue capacity before dropping a job.
pub const DEFAULT_ENQUEUE_WAIT_MS: u64 = 10;

/// Delay between two jobs so the reader can settle.
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 500;

/// Default number of jobs that may wait in the queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Name given to the queue worker thread.
pub const WORKER_THREAD_NAME: &str = "cardgate-worker";

// ============================================================================
// Result Messages
// ============================================================================

/// Error text returned when a read loses the race for the reader.
pub const LOCK_CONTENTION_MESSAGE: &str = "failed to acquire mutex";
