//! Verify jobs. A disk verify walks the file set; a volume verify reads a
//! session back from the storage daemon. Both report attributes and
//! digests to the director instead of saving or writing files.

use super::backup::{digest_for, skip_notice, FIND_QUEUE};
use super::restore::read_record;
use crate::crypto::{digest_file, DigestAlgorithm};
use crate::fs::walker::{spawn_find_files, FileSet, FindEntry};
use crate::jcr::{Jcr, JobStatus, MsgType};
use crate::utils::errors::{FdError, Result};
use bnet::base64::bin_to_base64;
use bnet::{encode_stat, AttributesRecord, Channel, ChannelWriter, FileType, ProtocolError, Signal, StreamType};
use std::os::unix::ffi::OsStrExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Verify options sent with each attributes line of a disk verify.
pub const DISK_VERIFY_OPTS: &str = "V";

const VOLUME_VERIFY_OPTS: &str = "pinsug5";

/// Director line for one attributes record:
/// `"<n> <stream> <opts> <fname>\0<stat>\0<link>\0"`.
pub fn attributes_line(job_files: u32, stream: i32, opts: &str, rec: &AttributesRecord) -> Vec<u8> {
    let mut line = format!("{} {} {} ", job_files, stream, opts).into_bytes();
    line.extend_from_slice(&rec.fname);
    line.push(0);
    line.extend_from_slice(rec.attribs.as_bytes());
    line.push(0);
    line.extend_from_slice(&rec.link);
    line.push(0);
    line
}

/// Director line for one digest: `"<n> <stream> <base64> *<ALG>-<n>*"`.
pub fn digest_line(job_files: u32, stream: StreamType, digest: &[u8]) -> Option<String> {
    let algorithm = DigestAlgorithm::from_stream(stream)?;
    Some(format!(
        "{} {} {} *{}-{}*",
        job_files,
        stream.code(),
        bin_to_base64(digest),
        algorithm.name(),
        job_files
    ))
}

/// Disk verify: walk `fileset` and send every file's attributes to the
/// director, followed by its digest when the options name one. Ends with
/// an EOD to the director.
pub async fn do_verify(jcr: &Jcr, dir: &Mutex<ChannelWriter>, fileset: FileSet) -> Result<()> {
    jcr.set_status(JobStatus::Running);
    info!(
        "Job {}: verifying file set ({} roots)",
        jcr.job_id,
        fileset.include.len()
    );

    let digest = digest_for(fileset.options.flags);
    let cancel = jcr.cancel_token();
    let (mut entries, finder) = spawn_find_files(fileset, FIND_QUEUE);

    let result: Result<()> = async {
        loop {
            let entry = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                entry = entries.recv() => match entry {
                    Some(entry) => entry,
                    None => break,
                },
            };
            verify_file(jcr, dir, digest, entry).await?;
        }
        dir.lock().await.signal(Signal::EndOfData).await?;
        Ok(())
    }
    .await;

    drop(entries);
    if let Err(e) = finder.await {
        jcr.jmsg(MsgType::Error, format!("File enumeration failed: {}", e));
    }
    if let Err(e) = &result {
        jcr.jmsg(MsgType::Fatal, e.to_string());
    }
    if jcr.is_canceled() {
        jcr.set_status(JobStatus::Canceled);
    }
    result
}

async fn verify_file(
    jcr: &Jcr,
    dir: &Mutex<ChannelWriter>,
    digest: Option<DigestAlgorithm>,
    entry: FindEntry,
) -> Result<()> {
    if entry.file_type == FileType::DirBegin {
        return Ok(());
    }
    let fname = entry.fname.to_string_lossy().into_owned();
    if let Some((kind, text)) = skip_notice(&entry) {
        jcr.file_examined(&fname);
        jcr.inc_skipped();
        jcr.jmsg(kind, text);
        return Ok(());
    }

    let job_files = jcr.next_file_index(&fname) as u32;
    let rec = AttributesRecord {
        file_index: job_files as i32,
        file_type: entry.file_type.code(),
        fname: entry.fname.as_os_str().as_bytes().to_vec(),
        attribs: encode_stat(&entry.stat, None),
        link: match entry.file_type {
            FileType::Lnk | FileType::LnkSaved => entry.link.as_os_str().as_bytes().to_vec(),
            _ => Vec::new(),
        },
        attribs_ex: String::new(),
        data_stream: 0,
    };
    debug!("Verify {} as file {}", fname, job_files);
    let line = attributes_line(job_files, StreamType::UnixAttributes.code(), DISK_VERIFY_OPTS, &rec);
    dir.lock().await.send(&line).await?;

    let Some(algorithm) = digest else {
        return Ok(());
    };
    if entry.file_type != FileType::Reg {
        return Ok(());
    }
    let path = entry.fname.clone();
    let digested = tokio::task::spawn_blocking(move || digest_file(&path, algorithm))
        .await
        .map_err(|e| FdError::Daemon(format!("digest task failed: {}", e)))?;
    match digested {
        Ok(value) => {
            jcr.add_job_bytes(entry.stat.size.max(0) as u64);
            if let Some(line) = digest_line(job_files, algorithm.stream(), &value) {
                dir.lock().await.send(line.as_bytes()).await?;
            }
        }
        Err(e) => jcr.jmsg(
            MsgType::Warning,
            format!("  Error reading file {}: ERR={}", fname, e),
        ),
    }
    Ok(())
}

pub async fn do_verify_volume(jcr: &Jcr, sd: &mut Channel, dir: &Mutex<ChannelWriter>) -> Result<()> {
    jcr.set_status(JobStatus::Running);
    info!("Job {}: verifying volume data", jcr.job_id);

    let result = verify_records(jcr, sd, dir).await;
    if let Err(e) = &result {
        jcr.jmsg(MsgType::Fatal, e.to_string());
    }
    if jcr.is_canceled() {
        jcr.set_status(JobStatus::Canceled);
    }
    result
}

async fn verify_records(jcr: &Jcr, sd: &mut Channel, dir: &Mutex<ChannelWriter>) -> Result<()> {
    let cancel = jcr.cancel_token();
    let mut job_files = 0u32;
    loop {
        let hdr = tokio::select! {
            _ = cancel.cancelled() => break,
            hdr = read_record(sd) => hdr?,
        };
        let Some(hdr) = hdr else {
            break;
        };
        let data = sd.msg();

        match StreamType::from_code(hdr.stream) {
            Some(s) if s.is_attributes() => {
                let rec = AttributesRecord::decode(data)?;
                if rec.file_index != hdr.file_index {
                    return Err(ProtocolError::FileIndexMismatch {
                        header: hdr.file_index,
                        record: rec.file_index,
                    }
                    .into());
                }
                let fname = rec.fname_lossy();
                job_files = jcr.next_file_index(&fname) as u32;
                debug!("Verify attributes of {}", fname);
                dir.lock()
                    .await
                    .send(&attributes_line(job_files, hdr.stream, VOLUME_VERIFY_OPTS, &rec))
                    .await?;
            }
            Some(s) if s.digest_len().is_some() => {
                if s.digest_len() != Some(data.len()) {
                    jcr.jmsg(
                        MsgType::Warning,
                        format!("{} digest of file {} has {} bytes", s, hdr.file_index, data.len()),
                    );
                    continue;
                }
                if let Some(line) = digest_line(job_files, s, data) {
                    dir.lock().await.send(line.as_bytes()).await?;
                }
            }
            Some(s) if s.is_data_family() => jcr.add_read_bytes(data.len() as u64),
            _ => debug!("Verify ignores stream {} of file {}", hdr.stream, hdr.file_index),
        }
    }
    Ok(())
}
