//! Card service abstraction layer for cardgate.
//!
//! This crate defines the [`CardDriver`] trait, the blocking surface a reader
//! session needs from a platform card service, together with the reader state
//! types it reports. Implementations can be swapped freely: the session's
//! polling state machine never touches a platform API directly.
//!
//! # Backends
//!
//! - [`mock::MockDriver`]: a scripted reader for development and tests. Its
//!   [`mock::MockDriverHandle`] inserts and removes cards, injects failures
//!   and counts calls.
//! - `pcsc_driver::PcscDriver` (feature `hardware-pcsc`): the system PC/SC
//!   service through the `pcsc` crate.
//!
//! # Example
//!
//! ```
//! use cardgate_hardware::mock::MockDriver;
//! use cardgate_hardware::CardDriver;
//!
//! let (mut driver, _handle) = MockDriver::new();
//! let ctx = driver.establish_context().unwrap();
//! let readers = driver.list_readers(&ctx).unwrap();
//! assert_eq!(readers.len(), 1);
//! driver.release_context(ctx).unwrap();
//! ```
//!
//! # Error Handling
//!
//! All operations return [`Result<T>`][error::Result] with a [`DriverError`].
//! Callers above the session only ever see [`cardgate_core::Error`].
//!
//! # Thread Safety
//!
//! Drivers and their handles must be `Send` so a session can be moved onto
//! the queue worker thread. They need not be `Sync`: the session serializes
//! every call.

pub mod error;
pub mod mock;
#[cfg(feature = "hardware-pcsc")]
pub mod pcsc_driver;
pub mod traits;

pub use error::{DriverError, Result};
#[cfg(feature = "hardware-pcsc")]
pub use pcsc_driver::PcscDriver;
pub use traits::{CardDriver, Protocols, ReaderFlags, ReaderState};
