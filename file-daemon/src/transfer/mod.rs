//! Per-record data transforms and job reporting.

pub mod compress;
pub mod progress;
pub mod sparse;

pub use progress::JobSummary;
