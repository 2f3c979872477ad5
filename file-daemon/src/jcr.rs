//! Job control record: per-job counters, status and message log.
//!
//! The protocol engines update the counters while a status path may read
//! them from another task, so each group of fields sits behind its own
//! mutex and is only held for the duration of one update.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Created,
    Running,
    Terminated,
    /// Terminated normally with non-fatal errors
    Warnings,
    ErrorTerminated,
    FatalError,
    Canceled,
}

impl JobStatus {
    /// Single-letter code used on the wire.
    pub fn code(self) -> char {
        match self {
            JobStatus::Created => 'C',
            JobStatus::Running => 'R',
            JobStatus::Terminated => 'T',
            JobStatus::Warnings => 'W',
            JobStatus::ErrorTerminated => 'E',
            JobStatus::FatalError => 'f',
            JobStatus::Canceled => 'A',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        Some(match code {
            'C' => JobStatus::Created,
            'R' => JobStatus::Running,
            'T' => JobStatus::Terminated,
            'W' => JobStatus::Warnings,
            'E' => JobStatus::ErrorTerminated,
            'f' => JobStatus::FatalError,
            'A' => JobStatus::Canceled,
            _ => return None,
        })
    }

    // A final status may only be replaced by a more severe one.
    fn priority(self) -> u8 {
        match self {
            JobStatus::Created | JobStatus::Running => 0,
            JobStatus::Terminated => 1,
            JobStatus::Warnings => 2,
            JobStatus::Canceled => 3,
            JobStatus::ErrorTerminated => 4,
            JobStatus::FatalError => 5,
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(self, JobStatus::Terminated | JobStatus::Warnings)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            JobStatus::Created => "Created",
            JobStatus::Running => "Running",
            JobStatus::Terminated => "OK",
            JobStatus::Warnings => "OK -- with warnings",
            JobStatus::ErrorTerminated => "Error",
            JobStatus::FatalError => "Fatal Error",
            JobStatus::Canceled => "Canceled",
        };
        f.write_str(text)
    }
}

/// Severity of a job message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Abort,
    Fatal,
    Error,
    Warning,
    Info,
    Saved,
    NotSaved,
    Skipped,
    Restored,
}

#[derive(Debug, Clone)]
pub struct JobMessage {
    pub kind: MsgType,
    pub text: String,
    pub time: DateTime<Utc>,
}

/// Snapshot of the job counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobCounters {
    /// Files sent (backup) or created (restore); also the last file index
    pub job_files: u32,
    /// Bytes sent after compression (backup) or written (restore)
    pub job_bytes: u64,
    /// Bytes read from disk (backup) or from the wire (restore)
    pub read_bytes: u64,
    pub num_files_examined: u32,
    pub files_skipped: u32,
    pub job_errors: u32,
    pub last_fname: String,
}

pub struct Jcr {
    pub job_id: u32,
    pub job_name: String,
    counters: Mutex<JobCounters>,
    status: Mutex<JobStatus>,
    messages: Mutex<Vec<JobMessage>>,
    cancel: CancellationToken,
    start_time: DateTime<Utc>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Jcr {
    pub fn new(job_id: u32, job_name: &str) -> Self {
        Self::with_cancel(job_id, job_name, CancellationToken::new())
    }

    pub fn with_cancel(job_id: u32, job_name: &str, cancel: CancellationToken) -> Self {
        Self {
            job_id,
            job_name: job_name.to_string(),
            counters: Mutex::new(JobCounters::default()),
            status: Mutex::new(JobStatus::Created),
            messages: Mutex::new(Vec::new()),
            cancel,
            start_time: Utc::now(),
        }
    }

    /// Count one more file and return its file index.
    pub fn next_file_index(&self, fname: &str) -> i32 {
        let mut c = lock(&self.counters);
        c.job_files += 1;
        c.num_files_examined += 1;
        c.last_fname.clear();
        c.last_fname.push_str(fname);
        c.job_files as i32
    }

    pub fn add_job_bytes(&self, n: u64) {
        lock(&self.counters).job_bytes += n;
    }

    pub fn add_read_bytes(&self, n: u64) {
        lock(&self.counters).read_bytes += n;
    }

    pub fn inc_files(&self) {
        lock(&self.counters).job_files += 1;
    }

    pub fn file_examined(&self, fname: &str) {
        let mut c = lock(&self.counters);
        c.num_files_examined += 1;
        c.last_fname.clear();
        c.last_fname.push_str(fname);
    }

    pub fn inc_skipped(&self) {
        lock(&self.counters).files_skipped += 1;
    }

    pub fn inc_errors(&self) {
        lock(&self.counters).job_errors += 1;
    }

    pub fn counters(&self) -> JobCounters {
        lock(&self.counters).clone()
    }

    pub fn status(&self) -> JobStatus {
        *lock(&self.status)
    }

    /// Set the job status unless a more severe final status is already set.
    pub fn set_status(&self, status: JobStatus) {
        let mut current = lock(&self.status);
        if matches!(status, JobStatus::Running | JobStatus::Created)
            || status.priority() >= current.priority()
        {
            *current = status;
        }
    }

    /// Mark the job finished: canceled, or terminated with or without warnings.
    pub fn finish(&self) -> JobStatus {
        if self.is_canceled() {
            self.set_status(JobStatus::Canceled);
        } else if self.counters().job_errors > 0 {
            self.set_status(JobStatus::Warnings);
        } else {
            self.set_status(JobStatus::Terminated);
        }
        self.status()
    }

    /// Record a job message. Errors bump the error count; fatal messages
    /// also mark the job as error-terminated.
    pub fn jmsg(&self, kind: MsgType, text: impl Into<String>) {
        let text = text.into();
        match kind {
            MsgType::Abort | MsgType::Fatal => {
                error!(target: "job", job = self.job_id, "Fatal error: {}", text);
                self.inc_errors();
                self.set_status(JobStatus::ErrorTerminated);
            }
            MsgType::Error => {
                error!(target: "job", job = self.job_id, "{}", text);
                self.inc_errors();
            }
            MsgType::Warning => warn!(target: "job", job = self.job_id, "{}", text),
            MsgType::Info | MsgType::Restored => {
                info!(target: "job", job = self.job_id, "{}", text)
            }
            MsgType::Saved | MsgType::NotSaved | MsgType::Skipped => {
                debug!(target: "job", job = self.job_id, "{}", text)
            }
        }
        lock(&self.messages).push(JobMessage {
            kind,
            text,
            time: Utc::now(),
        });
    }

    pub fn messages(&self) -> Vec<JobMessage> {
        lock(&self.messages).clone()
    }

    /// Messages of one kind, text only.
    pub fn messages_of(&self, kind: MsgType) -> Vec<String> {
        lock(&self.messages)
            .iter()
            .filter(|m| m.kind == kind)
            .map(|m| m.text.clone())
            .collect()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_index_is_sequential() {
        let jcr = Jcr::new(1, "backup");
        assert_eq!(jcr.next_file_index("/a"), 1);
        assert_eq!(jcr.next_file_index("/b"), 2);
        let c = jcr.counters();
        assert_eq!(c.job_files, 2);
        assert_eq!(c.last_fname, "/b");
    }

    #[test]
    fn test_status_severity_is_kept() {
        let jcr = Jcr::new(1, "backup");
        jcr.set_status(JobStatus::Running);
        jcr.set_status(JobStatus::ErrorTerminated);
        jcr.set_status(JobStatus::Terminated);
        assert_eq!(jcr.status(), JobStatus::ErrorTerminated);
    }

    #[test]
    fn test_fatal_message_sets_status() {
        let jcr = Jcr::new(1, "restore");
        jcr.jmsg(MsgType::Fatal, "Record header scan error");
        assert_eq!(jcr.status(), JobStatus::ErrorTerminated);
        assert_eq!(jcr.counters().job_errors, 1);
        assert_eq!(jcr.messages_of(MsgType::Fatal).len(), 1);
    }

    #[test]
    fn test_finish() {
        let jcr = Jcr::new(1, "backup");
        assert_eq!(jcr.finish(), JobStatus::Terminated);

        let jcr = Jcr::new(2, "backup");
        jcr.jmsg(MsgType::Error, "Read error");
        assert_eq!(jcr.finish(), JobStatus::Warnings);

        let jcr = Jcr::new(3, "backup");
        jcr.cancel();
        assert_eq!(jcr.finish(), JobStatus::Canceled);
        assert_eq!(jcr.status().code(), 'A');
    }
}
