//! Process-level plumbing: pid file and signal-driven shutdown.

pub mod pidfile;
pub mod shutdown;

pub use pidfile::PidFile;
pub use shutdown::ShutdownCoordinator;
