//! POSIX ACL capture and apply.
//!
//! ACLs travel as the raw `system.posix_acl_*` extended attribute blobs, one
//! stream per kind.

use bnet::StreamType;
use std::io;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclKind {
    Access,
    /// Inherited by new entries; directories only
    Default,
}

impl AclKind {
    pub fn stream(self) -> StreamType {
        match self {
            AclKind::Access => StreamType::UnixAccessAcl,
            AclKind::Default => StreamType::UnixDefaultAcl,
        }
    }

    pub fn from_stream(stream: StreamType) -> Option<Self> {
        match stream {
            StreamType::UnixAccessAcl => Some(AclKind::Access),
            StreamType::UnixDefaultAcl => Some(AclKind::Default),
            _ => None,
        }
    }

    fn xattr_name(self) -> &'static str {
        match self {
            AclKind::Access => "system.posix_acl_access",
            AclKind::Default => "system.posix_acl_default",
        }
    }
}

pub trait AclHandler: Send + Sync {
    /// Read the ACL of `kind`, `None` when the file has none.
    fn capture(&self, path: &Path, kind: AclKind) -> io::Result<Option<Vec<u8>>>;

    fn apply(&self, path: &Path, kind: AclKind, data: &[u8]) -> io::Result<()>;
}

/// ACLs through the xattr interface (Linux).
#[derive(Debug, Default, Clone, Copy)]
pub struct XattrAcl;

impl AclHandler for XattrAcl {
    fn capture(&self, path: &Path, kind: AclKind) -> io::Result<Option<Vec<u8>>> {
        match xattr::get(path, kind.xattr_name()) {
            Ok(value) => Ok(value.filter(|v| !v.is_empty())),
            // Filesystem without ACL support
            Err(e) if e.raw_os_error() == Some(nix::libc::EOPNOTSUPP) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn apply(&self, path: &Path, kind: AclKind, data: &[u8]) -> io::Result<()> {
        xattr::set(path, kind.xattr_name(), data)
    }
}

/// Used when ACL support is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAcl;

impl AclHandler for NoAcl {
    fn capture(&self, _path: &Path, _kind: AclKind) -> io::Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn apply(&self, _path: &Path, kind: AclKind, _data: &[u8]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("{} ACLs are not supported", kind.stream()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_kind_stream_mapping() {
        assert_eq!(AclKind::Access.stream().code(), 15);
        assert_eq!(AclKind::Default.stream().code(), 16);
        assert_eq!(
            AclKind::from_stream(StreamType::UnixDefaultAcl),
            Some(AclKind::Default)
        );
        assert_eq!(AclKind::from_stream(StreamType::FileData), None);
    }

    #[test]
    fn test_no_acl() -> std::io::Result<()> {
        let file = NamedTempFile::new()?;
        assert_eq!(NoAcl.capture(file.path(), AclKind::Access)?, None);
        let err = NoAcl.apply(file.path(), AclKind::Access, b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
        Ok(())
    }
}
