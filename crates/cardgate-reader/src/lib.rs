//! Card reader session and job queue for cardgate.
//!
//! Two layers sit on top of a [`CardDriver`](cardgate_hardware::CardDriver):
//!
//! - [`ReaderSession`]: one exclusive session with a reader. A read polls for
//!   a card until it appears, the timeout passes or the caller cancels, then
//!   fetches the card UID. Concurrent reads never queue inside the session;
//!   the loser gets a "failed to acquire mutex" result.
//! - [`JobQueue`]: a bounded FIFO drained by one worker thread, so many
//!   producers can request reads without racing for the session.
//!
//! # Example
//!
//! ```
//! use cardgate_core::JobId;
//! use cardgate_hardware::mock::MockDriver;
//! use cardgate_reader::{JobQueue, QueueConfig};
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! let (driver, handle) = MockDriver::new();
//! handle.insert_card(&[0x12, 0x34]);
//!
//! let queue = JobQueue::new(
//!     driver,
//!     QueueConfig::default().with_timeout(Duration::from_secs(1)),
//! )
//! .unwrap();
//!
//! let reply = queue
//!     .submit_with_reply(JobId::new(1), CancellationToken::new())
//!     .unwrap();
//! let result = reply.blocking_recv().unwrap();
//! assert_eq!(result.identifier, "1234");
//! ```

pub mod config;
pub mod queue;
pub mod session;

pub use config::QueueConfig;
pub use queue::{Job, JobQueue};
pub use session::{ReadState, ReaderSession};
