//! End-of-job summary: counters, elapsed time and transfer rate.

use crate::jcr::{Jcr, JobStatus};
use std::fmt;
use std::time::Duration;

/// Snapshot of a finished (or running) job for reporting.
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub job_id: u32,
    pub job_name: String,
    pub status: JobStatus,
    pub files: u32,
    pub examined: u32,
    pub skipped: u32,
    pub job_bytes: u64,
    pub read_bytes: u64,
    pub errors: u32,
    pub elapsed: Duration,
}

impl JobSummary {
    pub fn from_jcr(jcr: &Jcr) -> Self {
        let c = jcr.counters();
        let elapsed = (chrono::Utc::now() - jcr.start_time())
            .to_std()
            .unwrap_or_default();
        Self {
            job_id: jcr.job_id,
            job_name: jcr.job_name.clone(),
            status: jcr.status(),
            files: c.job_files,
            examined: c.num_files_examined,
            skipped: c.files_skipped,
            job_bytes: c.job_bytes,
            read_bytes: c.read_bytes,
            errors: c.job_errors,
            elapsed,
        }
    }

    /// Average rate over `job_bytes`.
    pub fn bytes_per_second(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.job_bytes as f64 / secs) as u64
        } else {
            0
        }
    }

    /// Sent bytes relative to read bytes, as a percentage saved.
    pub fn compression_percent(&self) -> f64 {
        if self.read_bytes == 0 || self.job_bytes >= self.read_bytes {
            0.0
        } else {
            (1.0 - self.job_bytes as f64 / self.read_bytes as f64) * 100.0
        }
    }
}

impl fmt::Display for JobSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Job:                    {} ({})", self.job_name, self.job_id)?;
        writeln!(f, "  Files:                  {}", self.files)?;
        writeln!(f, "  Files examined:         {}", self.examined)?;
        writeln!(f, "  Files skipped:          {}", self.skipped)?;
        writeln!(
            f,
            "  Bytes read:             {} ({})",
            self.read_bytes,
            format_bytes(self.read_bytes)
        )?;
        writeln!(
            f,
            "  Bytes written:          {} ({})",
            self.job_bytes,
            format_bytes(self.job_bytes)
        )?;
        writeln!(f, "  Compression:            {:.1}%", self.compression_percent())?;
        writeln!(f, "  Rate:                   {}", format_speed(self.bytes_per_second()))?;
        writeln!(f, "  Elapsed:                {}", format_duration(self.elapsed.as_secs()))?;
        writeln!(f, "  Errors:                 {}", self.errors)?;
        write!(f, "  Termination:            {}", self.status)
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
