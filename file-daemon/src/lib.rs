//! File daemon library
//!
//! Client side of the backup protocol: walks the file tree and streams
//! attributes, data and digests to a storage daemon, and rebuilds files from
//! the same stream grammar on restore.

pub mod config;
pub mod crypto;
pub mod daemon;
pub mod executor;
pub mod fs;
pub mod heartbeat;
pub mod jcr;
pub mod job;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use jcr::{Jcr, JobStatus};
pub use utils::errors::FdError;
pub type Result<T> = std::result::Result<T, FdError>;
