//! Shared types for the cardgate card reader service.
//!
//! This crate holds the pieces every other cardgate crate agrees on: the
//! [`ReadResult`] handed back to callers, the [`JobId`] naming a requester,
//! the [`Error`] taxonomy and the timing/command constants.

pub mod constants;
pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
