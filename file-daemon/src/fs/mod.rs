//! File system access: enumeration, stat capture, restore-side creation.

pub mod acl;
pub mod create;
pub mod metadata;
pub mod walker;
pub mod win32;

pub use acl::{AclHandler, AclKind, NoAcl, XattrAcl};
pub use create::{create_file, output_path, CreateStatus, ReplaceMode};
pub use metadata::{lstat, set_attributes, stat_from_metadata};
pub use walker::{find_files, spawn_find_files, FileSet, FindEntry, FindOptions, FoFlags};
