//! Job orchestration: storage daemon session handshakes around the
//! backup, restore and verify engines, heartbeat lifetime and the end-of-job
//! report to the director.

use crate::config::Config;
use crate::crypto::PkiContext;
use crate::executor::{
    blast_data_to_storage_daemon, do_restore, do_verify, do_verify_volume, make_estimate, Estimate,
    RestoreOptions, RestoreSummary,
};
use crate::fs::{AclHandler, FileSet};
use crate::heartbeat::{HeartbeatMonitor, SharedWriter};
use crate::jcr::{Jcr, JobStatus, MsgType};
use crate::transfer::JobSummary;
use crate::utils::errors::{FdError, Result};
use bnet::{bget_msg, Channel, ChannelReader, Frame, Signal};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const OK_OPEN: &str = "3000 OK open ticket = ";
const OK_DATA: &str = "3000 OK data\n";
const OK_APPEND: &str = "3000 OK append data\n";
const OK_END: &str = "3000 OK end\n";
const OK_CLOSE: &str = "3000 OK close";

/// Where a restore or verify session sits on the volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadSession {
    pub volume: String,
    pub vol_session_id: u32,
    pub vol_session_time: u32,
    pub start_file: u32,
    pub end_file: u32,
    pub start_block: u32,
    pub end_block: u32,
}

impl ReadSession {
    fn command(&self) -> String {
        format!(
            "read open session = {} {} {} {} {} {} {}\n",
            self.volume,
            self.vol_session_id,
            self.vol_session_time,
            self.start_file,
            self.end_file,
            self.start_block,
            self.end_block
        )
    }
}

pub async fn connect_storage(config: &Config) -> Result<Channel> {
    let mut sd = Channel::connect(
        "Storage daemon",
        &config.storage.address,
        config.storage.port,
    )
    .await?;
    sd.set_timeout(config.network_timeout());
    Ok(sd)
}

/// Connect to the director when one is configured. Only the write half is
/// kept; it carries heartbeats, verify output and the end-of-job report.
pub async fn connect_director(config: &Config) -> Result<Option<SharedWriter>> {
    let Some(peer) = &config.director else {
        return Ok(None);
    };
    let mut dir = Channel::connect("Director daemon", &peer.address, peer.port).await?;
    dir.set_timeout(config.network_timeout());
    let (_, writer) = dir.into_parts();
    Ok(Some(Arc::new(Mutex::new(writer))))
}

/// Next reply from the storage daemon as text.
async fn response(sd: &mut Channel, command: &str) -> Result<String> {
    match bget_msg(sd).await? {
        Frame::Data(_) => Ok(sd.msg_str().into_owned()),
        Frame::Signal(sig) => Err(FdError::bad_response(command, "a reply", &sig.name())),
    }
}

fn expect_reply(command: &str, wanted: &str, got: &str) -> Result<()> {
    if got == wanted {
        Ok(())
    } else {
        Err(FdError::bad_response(command, wanted, got))
    }
}

fn parse_after(prefix: &str, reply: &str) -> Option<i64> {
    reply.strip_prefix(prefix)?.trim().parse().ok()
}

pub async fn open_append_session(sd: &mut Channel) -> Result<u32> {
    sd.fsend(format_args!("append open session\n")).await?;
    let reply = response(sd, "append open session").await?;
    parse_after(OK_OPEN, &reply)
        .and_then(|t| u32::try_from(t).ok())
        .ok_or_else(|| FdError::bad_response("append open session", OK_OPEN, &reply))
}

pub async fn start_append_data(sd: &mut Channel, ticket: u32) -> Result<()> {
    sd.fsend(format_args!("append data {}\n", ticket)).await?;
    let reply = response(sd, "append data").await?;
    expect_reply("append data", OK_DATA, &reply)
}

/// End and close an append session. Returns the SD's close status.
pub async fn end_append_session(sd: &mut Channel, ticket: u32) -> Result<i64> {
    sd.fsend(format_args!("append end session {}\n", ticket)).await?;
    let reply = response(sd, "append end session").await?;
    expect_reply("append end session", OK_END, &reply)?;

    sd.fsend(format_args!("append close session {}\n", ticket)).await?;
    let reply = response(sd, "append close session").await?;
    let status = parse_after("3000 OK close Status = ", &reply)
        .ok_or_else(|| FdError::bad_response("append close session", OK_CLOSE, &reply))?;

    // Anything else up to the EOD is informational
    while let Frame::Data(_) = bget_msg(sd).await? {
        debug!("<stored: {}", sd.msg_str().trim_end());
    }
    Ok(status)
}

pub async fn open_read_session(sd: &mut Channel, session: &ReadSession) -> Result<u32> {
    sd.send(session.command().as_bytes()).await?;
    let reply = response(sd, "read open session").await?;
    let ticket = parse_after(OK_OPEN, &reply)
        .and_then(|t| u32::try_from(t).ok())
        .ok_or_else(|| FdError::bad_response("read open session", OK_OPEN, &reply))?;

    sd.fsend(format_args!("read data {}\n", ticket)).await?;
    let reply = response(sd, "read data").await?;
    expect_reply("read data", OK_DATA, &reply)?;
    Ok(ticket)
}

pub async fn close_read_session(sd: &mut Channel, ticket: u32) -> Result<()> {
    sd.fsend(format_args!("read close session {}\n", ticket)).await?;
    let reply = response(sd, "read close session").await?;
    if reply.starts_with(OK_CLOSE) {
        Ok(())
    } else {
        Err(FdError::bad_response("read close session", OK_CLOSE, &reply))
    }
}

pub fn end_job_message(jcr: &Jcr, encrypt: bool) -> String {
    let c = jcr.counters();
    format!(
        "2800 End Job TermCode={} JobFiles={} ReadBytes={} JobBytes={} Errors={} VSS=0 Encrypt={}\n",
        jcr.status().code() as u32,
        c.job_files,
        c.read_bytes,
        c.job_bytes,
        c.job_errors,
        u8::from(encrypt)
    )
}

/// Finish the job status and tell the director, if there is one.
async fn finish_job(jcr: &Jcr, dir: Option<&SharedWriter>, encrypt: bool) -> JobSummary {
    let status = jcr.finish();
    if let Some(dir) = dir {
        let msg = end_job_message(jcr, encrypt);
        if let Err(e) = dir.lock().await.send(msg.as_bytes()).await {
            warn!("Could not send end of job report to director: {}", e);
        }
    }
    let summary = JobSummary::from_jcr(jcr);
    info!(
        "Job {} ({}) finished: {} ({} files, {} bytes)",
        jcr.job_id, jcr.job_name, status, summary.files, summary.job_bytes
    );
    summary
}

/// Fatal errors not already reported by an engine.
fn report_failure(jcr: &Jcr, result: &Result<()>) {
    if let Err(e) = result {
        if jcr.status() != JobStatus::ErrorTerminated {
            jcr.jmsg(MsgType::Fatal, e.to_string());
        }
    }
}

/// The SD read half during a backup: either with the heartbeat monitor or
/// idle when heartbeats are disabled.
enum ReadHalf {
    Idle(ChannelReader),
    Monitored(HeartbeatMonitor),
}

impl ReadHalf {
    async fn reclaim(self) -> Result<(ChannelReader, Option<Vec<u8>>)> {
        match self {
            ReadHalf::Idle(reader) => Ok((reader, None)),
            ReadHalf::Monitored(monitor) => match monitor.stop().await? {
                Some(ret) => Ok((ret.reader, ret.pending)),
                None => Err(FdError::Daemon("heartbeat monitor kept the SD connection".to_string())),
            },
        }
    }
}

/// Run a backup over an already connected storage daemon channel.
pub async fn run_backup(
    jcr: &Jcr,
    config: &Config,
    sd: Channel,
    dir: Option<SharedWriter>,
    fileset: FileSet,
    pki: &PkiContext,
    acl: &dyn AclHandler,
) -> JobSummary {
    info!("Job {} ({}): starting backup", jcr.job_id, jcr.job_name);
    let result = backup_session(jcr, config, sd, dir.clone(), fileset, pki, acl).await;
    report_failure(jcr, &result);
    finish_job(jcr, dir.as_ref(), pki.encrypting()).await
}

async fn backup_session(
    jcr: &Jcr,
    config: &Config,
    mut sd: Channel,
    dir: Option<SharedWriter>,
    fileset: FileSet,
    pki: &PkiContext,
    acl: &dyn AclHandler,
) -> Result<()> {
    let ticket = open_append_session(&mut sd).await?;
    debug!("Append session ticket {}", ticket);
    start_append_data(&mut sd, ticket).await?;

    let (reader, mut writer) = sd.into_parts();
    let interval = config.heartbeat_interval();
    let half = if interval.is_zero() {
        ReadHalf::Idle(reader)
    } else {
        ReadHalf::Monitored(HeartbeatMonitor::start_sd(reader, dir, interval))
    };

    let blast = blast_data_to_storage_daemon(
        jcr,
        &mut writer,
        fileset,
        pki,
        acl,
        config.client.max_network_buffer_size,
    )
    .await;
    let (reader, pending) = half.reclaim().await?;
    blast?;

    let mut sd = Channel::from_parts(reader, writer);
    let reply = match pending {
        Some(bytes) => {
            let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
            String::from_utf8_lossy(&bytes[..end]).into_owned()
        }
        None => response(&mut sd, "append data").await?,
    };
    expect_reply("append data", OK_APPEND, &reply)?;

    let status = end_append_session(&mut sd, ticket).await?;
    debug!("Storage daemon closed session {} with status {}", ticket, status);
    Ok(())
}

/// Run a restore of `session` into `opts.where_`.
#[allow(clippy::too_many_arguments)]
pub async fn run_restore(
    jcr: &Jcr,
    config: &Config,
    mut sd: Channel,
    dir: Option<SharedWriter>,
    session: &ReadSession,
    opts: &RestoreOptions,
    pki: &PkiContext,
    acl: &dyn AclHandler,
) -> (JobSummary, Option<RestoreSummary>) {
    info!("Job {} ({}): starting restore of {}", jcr.job_id, jcr.job_name, session.volume);
    let monitor = start_dir_monitor(config, dir.as_ref());

    let mut restored = None;
    let result: Result<()> = async {
        let ticket = open_read_session(&mut sd, session).await?;
        restored = Some(do_restore(jcr, &mut sd, opts, pki, acl).await?);
        close_read_session(&mut sd, ticket).await
    }
    .await;
    stop_monitor(monitor).await;
    report_failure(jcr, &result);
    (finish_job(jcr, dir.as_ref(), false).await, restored)
}

/// Read `session` back and report its attributes and digests to the director.
pub async fn run_verify_volume(
    jcr: &Jcr,
    config: &Config,
    mut sd: Channel,
    dir: SharedWriter,
    session: &ReadSession,
) -> JobSummary {
    info!("Job {} ({}): verifying {}", jcr.job_id, jcr.job_name, session.volume);
    let monitor = start_dir_monitor(config, Some(&dir));

    let result: Result<()> = async {
        let ticket = open_read_session(&mut sd, session).await?;
        do_verify_volume(jcr, &mut sd, &dir).await?;
        close_read_session(&mut sd, ticket).await
    }
    .await;
    stop_monitor(monitor).await;
    report_failure(jcr, &result);
    finish_job(jcr, Some(&dir), false).await
}

/// Disk verify: the file set is compared by the director, no SD involved.
pub async fn run_verify(jcr: &Jcr, dir: SharedWriter, fileset: FileSet) -> JobSummary {
    info!("Job {} ({}): verifying file set", jcr.job_id, jcr.job_name);
    let result = do_verify(jcr, &dir, fileset).await;
    report_failure(jcr, &result);
    finish_job(jcr, Some(&dir), false).await
}

/// Estimate the file set. The reply goes to the director when connected.
pub async fn run_estimate(
    jcr: &Jcr,
    dir: Option<SharedWriter>,
    fileset: FileSet,
    listing: bool,
) -> (JobSummary, Option<Estimate>) {
    let result: Result<Estimate> = async {
        let estimate = make_estimate(jcr, fileset, listing).await?;
        if let Some(dir) = &dir {
            let mut dir = dir.lock().await;
            dir.send(estimate.reply().as_bytes()).await?;
            dir.signal(Signal::EndOfData).await?;
        }
        Ok(estimate)
    }
    .await;
    let (outcome, estimate) = match result {
        Ok(estimate) => (Ok(()), Some(estimate)),
        Err(e) => (Err(e), None),
    };
    report_failure(jcr, &outcome);
    (finish_job(jcr, None, false).await, estimate)
}

fn start_dir_monitor(config: &Config, dir: Option<&SharedWriter>) -> Option<HeartbeatMonitor> {
    let interval = config.heartbeat_interval();
    match dir {
        Some(dir) if !interval.is_zero() => Some(HeartbeatMonitor::start_dir(dir.clone(), interval)),
        _ => None,
    }
}

async fn stop_monitor(monitor: Option<HeartbeatMonitor>) {
    if let Some(monitor) = monitor {
        if let Err(e) = monitor.stop().await {
            warn!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{FindOptions, NoAcl};
    use bnet::replay::SessionSpool;
    use tempfile::TempDir;
    use tokio::io::duplex;

    async fn expect_command(ch: &mut Channel, wanted: &str) -> anyhow::Result<()> {
        assert!(matches!(ch.recv().await?, Frame::Data(_)));
        assert_eq!(ch.msg_str(), wanted);
        Ok(())
    }

    /// Storage daemon side of one append session.
    async fn fake_append_sd(mut ch: Channel) -> anyhow::Result<SessionSpool> {
        expect_command(&mut ch, "append open session\n").await?;
        ch.fsend(format_args!("3000 OK open ticket = 7\n")).await?;
        expect_command(&mut ch, "append data 7\n").await?;
        ch.send(OK_DATA.as_bytes()).await?;

        let mut spool = SessionSpool::new(7, 1_700_000_000);
        spool.receive(&mut ch).await?;
        ch.send(OK_APPEND.as_bytes()).await?;

        expect_command(&mut ch, "append end session 7\n").await?;
        ch.send(OK_END.as_bytes()).await?;
        expect_command(&mut ch, "append close session 7\n").await?;
        ch.send(b"3000 OK close Status = 84\n").await?;
        ch.signal(Signal::EndOfData).await?;
        Ok(spool)
    }

    #[test]
    fn test_end_job_message() {
        let jcr = Jcr::new(4, "job");
        jcr.next_file_index("/a");
        jcr.add_job_bytes(10);
        jcr.add_read_bytes(12);
        jcr.finish();
        assert_eq!(
            end_job_message(&jcr, true),
            "2800 End Job TermCode=84 JobFiles=1 ReadBytes=12 JobBytes=10 Errors=0 VSS=0 Encrypt=1\n"
        );
    }

    #[test]
    fn test_read_session_command() {
        let session = ReadSession {
            volume: "Vol001".to_string(),
            vol_session_id: 3,
            vol_session_time: 1_700_000_000,
            start_file: 0,
            end_file: 1,
            start_block: 0,
            end_block: 99,
        };
        assert_eq!(
            session.command(),
            "read open session = Vol001 3 1700000000 0 1 0 99\n"
        );
    }

    #[tokio::test]
    async fn test_backup_handshake_with_fake_sd() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        std::fs::write(dir.path().join("f.txt"), b"contents")?;

        let (a, b) = duplex(1024 * 1024);
        let fd_side = Channel::from_stream("Storage daemon", "localhost", 9103, a);
        let sd_side = Channel::from_stream("File daemon", "localhost", 9102, b);
        let sd_task = tokio::spawn(fake_append_sd(sd_side));

        let jcr = Jcr::new(1, "backup-test");
        let fileset = FileSet::new(vec![dir.path().join("f.txt")], FindOptions::default());
        let summary = run_backup(
            &jcr,
            &Config::default(),
            fd_side,
            None,
            fileset,
            &PkiContext::disabled(),
            &NoAcl,
        )
        .await;
        let spool = sd_task.await??;

        assert_eq!(summary.status, JobStatus::Terminated);
        assert_eq!(summary.files, 1);
        assert_eq!(summary.job_bytes, 8);
        let streams: Vec<i32> = spool.records().iter().map(|r| r.stream).collect();
        assert_eq!(streams, vec![1, 2]);
        Ok(())
    }

    #[tokio::test]
    async fn test_bad_ticket_reply_fails_job() -> anyhow::Result<()> {
        let (a, b) = duplex(64 * 1024);
        let fd_side = Channel::from_stream("Storage daemon", "localhost", 9103, a);
        let mut sd_side = Channel::from_stream("File daemon", "localhost", 9102, b);
        let sd_task = tokio::spawn(async move {
            expect_command(&mut sd_side, "append open session\n").await?;
            sd_side.send(b"3999 Failed open\n").await?;
            anyhow::Ok(())
        });

        let jcr = Jcr::new(2, "backup-fail");
        let fileset = FileSet::new(Vec::new(), FindOptions::default());
        let summary = run_backup(
            &jcr,
            &Config::default(),
            fd_side,
            None,
            fileset,
            &PkiContext::disabled(),
            &NoAcl,
        )
        .await;
        sd_task.await??;
        assert_eq!(summary.status, JobStatus::ErrorTerminated);
        assert!(jcr.messages_of(MsgType::Fatal)[0].contains("append open session"));
        Ok(())
    }

    #[tokio::test]
    async fn test_estimate_reply_goes_to_director() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        std::fs::write(dir.path().join("f.txt"), vec![0u8; 1500])?;

        let (a, b) = duplex(64 * 1024);
        let (_, writer) = Channel::from_stream("Director", "localhost", 9101, a).into_parts();
        let mut director = Channel::from_stream("File daemon", "localhost", 9102, b);

        let jcr = Jcr::new(5, "estimate");
        let fileset = FileSet::new(vec![dir.path().join("f.txt")], FindOptions::default());
        let (summary, estimate) =
            run_estimate(&jcr, Some(Arc::new(Mutex::new(writer))), fileset, false).await;

        assert_eq!(summary.status, JobStatus::Terminated);
        assert_eq!(estimate.map(|e| e.bytes), Some(1500));
        assert!(matches!(director.recv().await?, Frame::Data(_)));
        assert_eq!(director.msg_str(), "2000 OK estimate files=1 bytes=1,500\n");
        assert_eq!(director.recv().await?, Frame::Signal(Signal::EndOfData));
        Ok(())
    }
}
