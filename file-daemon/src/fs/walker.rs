//! File set enumeration for backup.
//!
//! Walks each include root and classifies every entry with a [`FileType`].
//! Directories are reported after their contents (`DirEnd`) so that restore
//! can set directory times after the files inside have been written.

use crate::fs::metadata::stat_from_metadata;
use bitflags::bitflags;
use bnet::{FileType, Stat};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

bitflags! {
    /// Per-fileset options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FoFlags: u32 {
        const SPARSE = 1 << 0;
        const GZIP = 1 << 1;
        const MD5 = 1 << 2;
        const SHA1 = 1 << 3;
        const SHA256 = 1 << 4;
        const SHA512 = 1 << 5;
        /// Send file data as a BackupRead stream blob
        const WIN32 = 1 << 6;
        /// Only mtime decides whether a file changed
        const MTIMEONLY = 1 << 7;
        const NO_RECURSION = 1 << 8;
        /// Do not cross filesystem boundaries
        const ONEFS = 1 << 9;
        const ACL = 1 << 10;
        /// Read FIFOs as data instead of recreating them
        const READFIFO = 1 << 11;
    }
}

#[derive(Debug, Clone)]
pub struct FindOptions {
    pub flags: FoFlags,
    /// zlib level, 1..=9
    pub gzip_level: u32,
    /// File names to skip. A leading `*` matches any prefix.
    pub exclude_patterns: Vec<String>,
    /// Incremental base time; files not changed since are sent as `NoChg`
    pub since: Option<i64>,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            flags: FoFlags::empty(),
            gzip_level: 6,
            exclude_patterns: Vec::new(),
            since: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileSet {
    pub include: Vec<PathBuf>,
    pub options: FindOptions,
}

impl FileSet {
    pub fn new(include: Vec<PathBuf>, options: FindOptions) -> Self {
        Self { include, options }
    }
}

/// One classified entry.
#[derive(Debug, Clone)]
pub struct FindEntry {
    pub file_type: FileType,
    pub fname: PathBuf,
    /// Symlink target, first name of a hard link, or the directory name
    /// with a trailing slash.
    pub link: PathBuf,
    pub stat: Stat,
    /// Error text for the "could not" file types
    pub err: Option<String>,
}

impl FindEntry {
    fn new(file_type: FileType, fname: PathBuf, stat: Stat) -> Self {
        Self {
            file_type,
            fname,
            link: PathBuf::new(),
            stat,
            err: None,
        }
    }

    fn failed(file_type: FileType, fname: PathBuf, err: impl ToString) -> Self {
        Self {
            err: Some(err.to_string()),
            ..Self::new(file_type, fname, Stat::default())
        }
    }
}

/// Walk every include root of `fileset`, handing each entry to `callback`.
/// Returns the number of entries produced.
pub fn find_files<F>(fileset: &FileSet, mut callback: F) -> usize
where
    F: FnMut(FindEntry) -> ControlFlow<()>,
{
    let mut finder = Finder {
        options: &fileset.options,
        hard_links: HashMap::new(),
        count: 0,
    };
    for root in &fileset.include {
        if finder.walk_root(root, &mut callback).is_break() {
            debug!("File enumeration stopped by consumer");
            break;
        }
    }
    finder.count
}

/// Run [`find_files`] on the blocking pool and stream entries through a
/// bounded channel. Enumeration stops when the receiver is dropped.
pub fn spawn_find_files(
    fileset: FileSet,
    capacity: usize,
) -> (mpsc::Receiver<FindEntry>, JoinHandle<usize>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::task::spawn_blocking(move || {
        find_files(&fileset, |entry| match tx.blocking_send(entry) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        })
    });
    (rx, handle)
}

struct Finder<'a> {
    options: &'a FindOptions,
    hard_links: HashMap<(u64, u64), PathBuf>,
    count: usize,
}

impl Finder<'_> {
    fn emit<F>(&mut self, entry: FindEntry, callback: &mut F) -> ControlFlow<()>
    where
        F: FnMut(FindEntry) -> ControlFlow<()>,
    {
        self.count += 1;
        callback(entry)
    }

    fn walk_root<F>(&mut self, root: &Path, callback: &mut F) -> ControlFlow<()>
    where
        F: FnMut(FindEntry) -> ControlFlow<()>,
    {
        let root_meta = match std::fs::symlink_metadata(root) {
            Ok(m) => m,
            Err(e) => {
                return self.emit(FindEntry::failed(FileType::NoStat, root.to_path_buf(), e), callback)
            }
        };
        let root_dev = stat_from_metadata(&root_meta).dev;
        let flags = self.options.flags;

        // Directories whose DirEnd is still owed, with their depth.
        let mut pending: Vec<(usize, FindEntry)> = Vec::new();
        let mut it = WalkDir::new(root)
            .follow_links(false)
            .follow_root_links(false)
            .sort_by_file_name()
            .into_iter();

        while let Some(item) = it.next() {
            let entry = match item {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().map(Path::to_path_buf);
                    let io_text = err
                        .io_error()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| err.to_string());
                    match path {
                        // The directory itself could not be read.
                        Some(p) if pending.last().is_some_and(|(_, d)| d.fname == p) => {
                            pending.pop();
                            self.emit(FindEntry::failed(FileType::NoOpen, p, io_text), callback)?;
                        }
                        Some(p) => {
                            self.emit(FindEntry::failed(FileType::NoStat, p, io_text), callback)?;
                        }
                        None => debug!("Walk error without path: {}", io_text),
                    }
                    continue;
                }
            };

            let depth = entry.depth();
            while pending.last().is_some_and(|(d, _)| *d >= depth) {
                if let Some((_, dir)) = pending.pop() {
                    self.emit(dir, callback)?;
                }
            }

            if depth > 0 && is_excluded(&entry, &self.options.exclude_patterns) {
                if entry.file_type().is_dir() {
                    it.skip_current_dir();
                }
                continue;
            }

            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    if entry.file_type().is_dir() {
                        it.skip_current_dir();
                    }
                    self.emit(
                        FindEntry::failed(FileType::NoStat, entry.path().to_path_buf(), e),
                        callback,
                    )?;
                    continue;
                }
            };
            let stat = stat_from_metadata(&meta);
            let fname = entry.path().to_path_buf();

            if stat.is_dir() {
                if depth > 0 && flags.contains(FoFlags::ONEFS) && stat.dev != root_dev {
                    it.skip_current_dir();
                    self.emit(FindEntry::new(FileType::NoFsChg, fname, stat), callback)?;
                    continue;
                }
                if depth > 0 && flags.contains(FoFlags::NO_RECURSION) {
                    it.skip_current_dir();
                    self.emit(FindEntry::new(FileType::NoRecurse, fname, stat), callback)?;
                    continue;
                }
                let mut dir = FindEntry::new(FileType::DirEnd, fname.clone(), stat);
                let mut link = fname.into_os_string();
                link.push("/");
                dir.link = PathBuf::from(link);
                pending.push((depth, dir));
                continue;
            }

            let classified = self.classify(fname, stat, depth);
            self.emit(classified, callback)?;
        }

        while let Some((_, dir)) = pending.pop() {
            self.emit(dir, callback)?;
        }
        ControlFlow::Continue(())
    }

    fn classify(&mut self, fname: PathBuf, stat: Stat, depth: usize) -> FindEntry {
        if stat.nlink > 1 {
            match self.hard_links.get(&(stat.dev, stat.ino)) {
                Some(first) => {
                    let mut entry = FindEntry::new(FileType::LnkSaved, fname, stat);
                    entry.link = first.clone();
                    return entry;
                }
                None => {
                    self.hard_links.insert((stat.dev, stat.ino), fname.clone());
                }
            }
        }

        if stat.is_symlink() {
            return match std::fs::read_link(&fname) {
                Ok(target) => {
                    let mut entry = FindEntry::new(FileType::Lnk, fname, stat);
                    entry.link = target;
                    entry
                }
                Err(e) => FindEntry::failed(FileType::NoFollow, fname, e),
            };
        }

        if self.unchanged(&stat) {
            return FindEntry::new(FileType::NoChg, fname, stat);
        }

        let file_type = match stat.file_kind() {
            bnet::attribs::S_IFREG if stat.size == 0 => FileType::RegE,
            bnet::attribs::S_IFREG => FileType::Reg,
            bnet::attribs::S_IFIFO if self.options.flags.contains(FoFlags::READFIFO) => FileType::Fifo,
            bnet::attribs::S_IFBLK if depth == 0 => FileType::Raw,
            _ => FileType::Spec,
        };
        FindEntry::new(file_type, fname, stat)
    }

    fn unchanged(&self, stat: &Stat) -> bool {
        match self.options.since {
            Some(since) => {
                stat.mtime < since
                    && (self.options.flags.contains(FoFlags::MTIMEONLY) || stat.ctime < since)
            }
            None => false,
        }
    }
}

fn is_excluded(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|pattern| match pattern.strip_prefix('*') {
        Some(suffix) => file_name.ends_with(suffix),
        None => file_name == pattern.as_str(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn collect(fileset: &FileSet) -> Vec<FindEntry> {
        let mut out = Vec::new();
        find_files(fileset, |e| {
            out.push(e);
            ControlFlow::Continue(())
        });
        out
    }

    fn single_root(path: &Path) -> FileSet {
        FileSet::new(vec![path.to_path_buf()], FindOptions::default())
    }

    #[test]
    fn test_directories_follow_their_contents() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("sub"))?;
        fs::write(temp_dir.path().join("sub/a.txt"), b"content")?;
        fs::write(temp_dir.path().join("empty"), b"")?;

        let entries = collect(&single_root(temp_dir.path()));
        assert_eq!(entries.len(), 4);
        let pos = |p: &Path| entries.iter().position(|e| e.fname == p).unwrap();
        assert!(pos(&temp_dir.path().join("sub/a.txt")) < pos(&temp_dir.path().join("sub")));
        assert_eq!(entries.last().unwrap().fname, temp_dir.path());
        assert_eq!(entries.last().unwrap().file_type, FileType::DirEnd);

        let sub = &entries[pos(&temp_dir.path().join("sub"))];
        assert!(sub.link.to_string_lossy().ends_with("sub/"));
        let empty = &entries[pos(&temp_dir.path().join("empty"))];
        assert_eq!(empty.file_type, FileType::RegE);
        Ok(())
    }

    #[test]
    fn test_links() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let a = temp_dir.path().join("a");
        fs::write(&a, b"data")?;
        fs::hard_link(&a, temp_dir.path().join("b"))?;
        std::os::unix::fs::symlink("a", temp_dir.path().join("c"))?;

        let entries = collect(&single_root(temp_dir.path()));
        let saved: Vec<_> = entries
            .iter()
            .filter(|e| e.file_type == FileType::LnkSaved)
            .collect();
        assert_eq!(saved.len(), 1);
        let first = entries
            .iter()
            .find(|e| e.file_type == FileType::Reg)
            .unwrap();
        assert_eq!(saved[0].link, first.fname);

        let sym = entries.iter().find(|e| e.file_type == FileType::Lnk).unwrap();
        assert_eq!(sym.link, PathBuf::from("a"));
        Ok(())
    }

    #[test]
    fn test_missing_root_is_nostat() {
        let entries = collect(&single_root(Path::new("/nonexistent/fd-walker-test")));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].file_type, FileType::NoStat);
        assert!(entries[0].err.is_some());
    }

    #[test]
    fn test_no_recursion_and_excludes() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("sub"))?;
        fs::write(temp_dir.path().join("sub/inner"), b"x")?;
        fs::write(temp_dir.path().join("keep.txt"), b"x")?;
        fs::write(temp_dir.path().join("skip.tmp"), b"x")?;

        let mut fileset = single_root(temp_dir.path());
        fileset.options.flags = FoFlags::NO_RECURSION;
        fileset.options.exclude_patterns = vec!["*.tmp".to_string()];
        let entries = collect(&fileset);

        assert!(entries.iter().any(|e| e.file_type == FileType::NoRecurse));
        assert!(!entries.iter().any(|e| e.fname.ends_with("inner")));
        assert!(!entries.iter().any(|e| e.fname.ends_with("skip.tmp")));
        assert!(entries.iter().any(|e| e.fname.ends_with("keep.txt")));
        Ok(())
    }

    #[test]
    fn test_fifo_is_read_only_when_asked() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let fifo = temp_dir.path().join("pipe");
        nix::unistd::mkfifo(&fifo, nix::sys::stat::Mode::from_bits_truncate(0o600))?;

        let mut fileset = FileSet::new(vec![fifo.clone()], FindOptions::default());
        assert_eq!(collect(&fileset)[0].file_type, FileType::Spec);

        fileset.options.flags = FoFlags::READFIFO;
        assert_eq!(collect(&fileset)[0].file_type, FileType::Fifo);
        Ok(())
    }

    #[test]
    fn test_since_marks_unchanged() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("old"), b"x")?;
        let mut fileset = single_root(temp_dir.path());
        fileset.options.since = Some(i64::MAX);
        let entries = collect(&fileset);
        let old = entries.iter().find(|e| e.fname.ends_with("old")).unwrap();
        assert_eq!(old.file_type, FileType::NoChg);
        Ok(())
    }

    #[test]
    fn test_consumer_can_stop() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        for i in 0..5 {
            fs::write(temp_dir.path().join(format!("f{}", i)), b"x")?;
        }
        let mut seen = 0;
        let count = find_files(&single_root(temp_dir.path()), |_| {
            seen += 1;
            if seen == 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(count, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_spawned_enumeration() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("a"), b"x")?;
        fs::write(temp_dir.path().join("b"), b"y")?;
        let (mut rx, handle) = spawn_find_files(single_root(temp_dir.path()), 1);
        let mut n = 0;
        while rx.recv().await.is_some() {
            n += 1;
        }
        assert_eq!(n, 3);
        assert_eq!(handle.await?, 3);
        Ok(())
    }
}
