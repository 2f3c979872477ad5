//! Job executors: the backup, restore and verify engines, plus estimate.
//!
//! Backup, restore and verify-volume each drive one storage daemon session
//! once the handshake in [`crate::job`] has opened it. Disk verify and
//! estimate only walk the local file set.

pub mod backup;
pub mod estimate;
pub mod restore;
pub mod verify;

pub use backup::blast_data_to_storage_daemon;
pub use estimate::{make_estimate, Estimate};
pub use restore::{do_restore, RestoreOptions, RestoreSummary, Unsupported};
pub use verify::{do_verify, do_verify_volume};
