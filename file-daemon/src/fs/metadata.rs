//! Stat capture and restoration of ownership, permissions and times.

use bnet::Stat;
use filetime::FileTime;
use std::fs::{self, Metadata};
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use tracing::debug;

/// Convert lstat/stat metadata into the wire stat.
pub fn stat_from_metadata(meta: &Metadata) -> Stat {
    Stat {
        dev: meta.dev(),
        ino: meta.ino(),
        mode: meta.mode(),
        nlink: meta.nlink(),
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev(),
        size: meta.size() as i64,
        blksize: meta.blksize() as i64,
        blocks: meta.blocks() as i64,
        atime: meta.atime(),
        mtime: meta.mtime(),
        ctime: meta.ctime(),
    }
}

pub fn lstat(path: &Path) -> io::Result<Stat> {
    fs::symlink_metadata(path).map(|m| stat_from_metadata(&m))
}

/// Apply owner, mode and times from `st` to `path`.
///
/// Ownership changes are only attempted as root; a non-root restore keeps
/// the restoring user as owner. Symlinks get owner and times but no mode.
pub fn set_attributes(path: &Path, st: &Stat, is_symlink: bool) -> io::Result<()> {
    if nix::unistd::geteuid().is_root() {
        let uid = Some(nix::unistd::Uid::from_raw(st.uid));
        let gid = Some(nix::unistd::Gid::from_raw(st.gid));
        let res = if is_symlink {
            std::os::unix::fs::lchown(path, Some(st.uid), Some(st.gid))
        } else {
            nix::unistd::chown(path, uid, gid).map_err(io::Error::from)
        };
        if let Err(e) = res {
            debug!("chown {} failed: {}", path.display(), e);
            return Err(e);
        }
    }

    let atime = FileTime::from_unix_time(st.atime, 0);
    let mtime = FileTime::from_unix_time(st.mtime, 0);
    if is_symlink {
        filetime::set_symlink_file_times(path, atime, mtime)?;
        return Ok(());
    }

    fs::set_permissions(path, fs::Permissions::from_mode(st.permissions()))?;
    filetime::set_file_times(path, atime, mtime)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_stat_from_path() -> std::io::Result<()> {
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(b"test content")?;
        temp_file.flush()?;

        let st = lstat(temp_file.path())?;
        assert_eq!(st.size, 12);
        assert!(st.is_reg());
        assert!(st.mtime > 0);
        Ok(())
    }

    #[test]
    fn test_set_attributes_restores_mode_and_mtime() -> std::io::Result<()> {
        let temp_file = NamedTempFile::new()?;
        let mut st = lstat(temp_file.path())?;
        st.mode = (st.mode & !0o7777) | 0o640;
        st.mtime = 1_600_000_000;
        st.atime = 1_600_000_100;

        set_attributes(temp_file.path(), &st, false)?;

        let back = lstat(temp_file.path())?;
        assert_eq!(back.permissions(), 0o640);
        assert_eq!(back.mtime, 1_600_000_000);
        Ok(())
    }
}
