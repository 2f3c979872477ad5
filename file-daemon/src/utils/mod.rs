//! Utility modules for the file daemon.

pub mod errors;
pub mod logger;

pub use errors::{FdError, Result};
