//! Output file creation for restore, under the configured replace policy.

use bnet::{FileType, Stat};
use clap::ValueEnum;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a restore waits for a reader on a FIFO target.
pub const FIFO_OPEN_TIMEOUT: Duration = Duration::from_secs(60);

const FIFO_POLL: Duration = Duration::from_millis(50);

/// What to do when the restore target already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReplaceMode {
    #[default]
    Always,
    IfNewer,
    IfOlder,
    Never,
}

/// Outcome of [`create_file`].
#[derive(Debug)]
pub enum CreateStatus {
    /// Nothing could be created; the message says why
    Error(String),
    /// Existing file kept under the replace policy
    Skip,
    /// Opened for writing; data records follow
    Extract(File),
    /// Fully created, no data expected
    Created,
}

/// Join `fname` under the restore prefix. An empty prefix restores in place.
pub fn output_path(where_: &Path, fname: &Path) -> PathBuf {
    if where_.as_os_str().is_empty() {
        return fname.to_path_buf();
    }
    let rel = fname.strip_prefix("/").unwrap_or(fname);
    where_.join(rel)
}

/// Create or open `ofile` for an incoming file of type `file_type`.
///
/// `link` is the raw link field of the attributes record: a symlink target,
/// or for hard links the name of the file saved first.
pub fn create_file(
    ofile: &Path,
    file_type: FileType,
    stat: &Stat,
    link: &Path,
    where_: &Path,
    replace: ReplaceMode,
) -> CreateStatus {
    let existing = fs::symlink_metadata(ofile).ok();

    if let Some(meta) = &existing {
        if !file_type.is_dir() {
            let mtime = std::os::unix::fs::MetadataExt::mtime(meta);
            let keep = match replace {
                ReplaceMode::Always => false,
                ReplaceMode::IfNewer => stat.mtime <= mtime,
                ReplaceMode::IfOlder => stat.mtime >= mtime,
                ReplaceMode::Never => true,
            };
            if keep {
                debug!("Keeping existing {} ({:?})", ofile.display(), replace);
                return CreateStatus::Skip;
            }
            // Device nodes and FIFOs are written in place, never replaced
            let in_place = matches!(file_type, FileType::Raw | FileType::Fifo);
            if !meta.is_dir() && !in_place {
                if let Err(e) = fs::remove_file(ofile) {
                    return CreateStatus::Error(format!(
                        "File {} already exists and could not be replaced. ERR={}",
                        ofile.display(),
                        e
                    ));
                }
            }
        }
    }

    if let Some(parent) = ofile.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            return CreateStatus::Error(format!(
                "Could not create parent directories of {}: ERR={}",
                ofile.display(),
                e
            ));
        }
    }

    match create_by_type(ofile, file_type, stat, link, where_) {
        Ok(status) => status,
        Err(e) => CreateStatus::Error(format!("Could not create {}: ERR={}", ofile.display(), e)),
    }
}

fn create_by_type(
    ofile: &Path,
    file_type: FileType,
    stat: &Stat,
    link: &Path,
    where_: &Path,
) -> io::Result<CreateStatus> {
    match file_type {
        FileType::Reg | FileType::RegE => {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(ofile)?;
            if file_type == FileType::RegE {
                return Ok(CreateStatus::Created);
            }
            Ok(CreateStatus::Extract(file))
        }
        FileType::Fifo | FileType::Raw | FileType::Spec => {
            make_node(ofile, stat)?;
            match file_type {
                FileType::Fifo => Ok(CreateStatus::Extract(open_fifo(ofile, FIFO_OPEN_TIMEOUT)?)),
                FileType::Raw => Ok(CreateStatus::Extract(OpenOptions::new().write(true).open(ofile)?)),
                _ => Ok(CreateStatus::Created),
            }
        }
        FileType::Lnk => {
            // Targets are restored verbatim, only hard links are relocated.
            std::os::unix::fs::symlink(link, ofile)?;
            Ok(CreateStatus::Created)
        }
        FileType::LnkSaved => {
            fs::hard_link(output_path(where_, link), ofile)?;
            Ok(CreateStatus::Created)
        }
        FileType::DirEnd | FileType::DirBegin | FileType::DirNoChg => {
            fs::create_dir_all(ofile)?;
            Ok(CreateStatus::Created)
        }
        other => Ok(CreateStatus::Error(format!(
            "Original file {} has unknown file type {}",
            ofile.display(),
            other.code()
        ))),
    }
}

/// Recreate a FIFO or device node unless one is already there. Sockets
/// are not restored.
fn make_node(ofile: &Path, stat: &Stat) -> io::Result<()> {
    if fs::symlink_metadata(ofile).is_ok() {
        return Ok(());
    }
    let res = match stat.file_kind() {
        bnet::attribs::S_IFSOCK => {
            debug!("Skipping restore of socket {}", ofile.display());
            return Ok(());
        }
        bnet::attribs::S_IFIFO => nix::unistd::mkfifo(ofile, mode_of(stat)),
        kind => nix::sys::stat::mknod(
            ofile,
            nix::sys::stat::SFlag::from_bits_truncate(kind as _),
            mode_of(stat),
            stat.rdev as _,
        ),
    };
    match res {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(e) => Err(io::Error::from(e)),
    }
}

/// Open a FIFO for writing. This only succeeds once a reader has the other
/// end open, so give up after `timeout`.
fn open_fifo(ofile: &Path, timeout: Duration) -> io::Result<File> {
    let deadline = Instant::now() + timeout;
    loop {
        match OpenOptions::new()
            .write(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(ofile)
        {
            Ok(nonblocking) => {
                // A reader is attached; reopen in blocking mode
                let file = OpenOptions::new().write(true).open(ofile)?;
                drop(nonblocking);
                return Ok(file);
            }
            Err(e) if e.raw_os_error() == Some(Errno::ENXIO as i32) => {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no reader on FIFO after {}s", timeout.as_secs()),
                    ));
                }
                std::thread::sleep(FIFO_POLL);
            }
            Err(e) => return Err(e),
        }
    }
}

fn mode_of(stat: &Stat) -> nix::sys::stat::Mode {
    nix::sys::stat::Mode::from_bits_truncate(stat.permissions() as _)
}
