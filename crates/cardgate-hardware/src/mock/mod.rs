//! Mock driver implementation for testing and development.
//!
//! This module provides a simulated card service that can be controlled
//! programmatically without requiring a physical reader.

pub mod driver;

// Re-export commonly used types
pub use driver::{MockCard, MockContext, MockDriver, MockDriverHandle, MockOperation};
