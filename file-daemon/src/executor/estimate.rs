//! Estimate: walk the file set and count what a backup would send.

use super::backup::{skip_notice, FIND_QUEUE};
use super::restore::ls_line;
use crate::fs::walker::{spawn_find_files, FileSet};
use crate::jcr::{Jcr, JobStatus, MsgType};
use crate::utils::errors::{FdError, Result};
use bnet::FileType;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Estimate {
    pub files: u32,
    pub bytes: u64,
}

impl Estimate {
    /// Reply to the director, e.g. `"2000 OK estimate files=1,234 bytes=56,789\n"`.
    pub fn reply(&self) -> String {
        format!(
            "2000 OK estimate files={} bytes={}\n",
            with_commas(self.files as u64),
            with_commas(self.bytes)
        )
    }
}

/// Count the files of `fileset` and the bytes of their regular content.
/// With `listing`, each counted file is also reported in `ls -l` form.
pub async fn make_estimate(jcr: &Jcr, fileset: FileSet, listing: bool) -> Result<Estimate> {
    jcr.set_status(JobStatus::Running);
    info!("Job {}: estimating {} roots", jcr.job_id, fileset.include.len());

    let cancel = jcr.cancel_token();
    let (mut entries, finder) = spawn_find_files(fileset, FIND_QUEUE);
    loop {
        let entry = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            entry = entries.recv() => match entry {
                Some(entry) => entry,
                None => break,
            },
        };
        if entry.file_type == FileType::DirBegin || skip_notice(&entry).is_some() {
            continue;
        }
        jcr.file_examined(&entry.fname.to_string_lossy());
        jcr.inc_files();
        if entry.file_type == FileType::Reg {
            jcr.add_job_bytes(entry.stat.size.max(0) as u64);
        }
        if listing {
            jcr.jmsg(
                MsgType::Info,
                ls_line(&entry.stat, &entry.fname, &entry.link, entry.file_type),
            );
        }
    }
    drop(entries);

    let walked = finder
        .await
        .map_err(|e| FdError::Daemon(format!("file enumeration failed: {}", e)))?;
    debug!("Estimate walked {} entries", walked);
    if jcr.is_canceled() {
        jcr.set_status(JobStatus::Canceled);
    }

    let c = jcr.counters();
    Ok(Estimate {
        files: c.job_files,
        bytes: c.job_bytes,
    })
}

/// Decimal with thousands separators.
fn with_commas(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::walker::FindOptions;
    use tempfile::TempDir;

    #[test]
    fn test_with_commas() {
        assert_eq!(with_commas(0), "0");
        assert_eq!(with_commas(999), "999");
        assert_eq!(with_commas(1000), "1,000");
        assert_eq!(with_commas(1_234_567), "1,234,567");
    }

    #[tokio::test]
    async fn test_estimate_counts_files_and_bytes() -> anyhow::Result<()> {
        let src = TempDir::new()?;
        let root = src.path().join("tree");
        std::fs::create_dir_all(root.join("sub"))?;
        std::fs::write(root.join("a"), vec![1u8; 10])?;
        std::fs::write(root.join("b"), b"")?;
        std::fs::write(root.join("sub/c"), b"12345")?;
        std::os::unix::fs::symlink("a", root.join("link"))?;

        let jcr = Jcr::new(3, "estimate");
        let fileset = FileSet::new(vec![root, src.path().join("missing")], FindOptions::default());
        let estimate = make_estimate(&jcr, fileset, true).await?;

        // tree, sub, a, b, c and link; the missing root is not counted
        assert_eq!(estimate, Estimate { files: 6, bytes: 15 });
        assert_eq!(estimate.reply(), "2000 OK estimate files=6 bytes=15\n");
        assert_eq!(jcr.messages_of(MsgType::Info).len(), 6);
        assert_eq!(jcr.counters().job_errors, 0);
        Ok(())
    }
}
