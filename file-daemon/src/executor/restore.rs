//! Restore: rebuild files from the records the storage daemon reads back.
//!
//! Every record arrives as a `rechdr` line followed by one data record. The
//! engine keeps the file being extracted open across records and finalizes
//! it (cipher flush, attributes, signature check) when the next file's
//! attributes arrive or the session ends.

use crate::crypto::{digest_file, CipherContext, CryptoError, PkiContext, SessionKey, SignedDigest};
use crate::fs::acl::{AclHandler, AclKind};
use crate::fs::create::{create_file, output_path, CreateStatus, ReplaceMode};
use crate::fs::metadata::set_attributes;
use crate::fs::win32::Win32Decomposer;
use crate::jcr::{Jcr, JobStatus, MsgType};
use crate::transfer::{compress, sparse};
use crate::utils::errors::{FdError, Result};
use bnet::{
    bget_msg, AttributesRecord, Channel, FileType, Frame, ProtocolError, RecordHeader, Signal,
    Stat, StreamOrder, StreamType,
};
use chrono::{Local, TimeZone};
use std::ffi::OsStr;
use std::io::SeekFrom;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Prefix for restored paths, empty to restore in place
    pub where_: PathBuf,
    pub replace: ReplaceMode,
    /// Record size used by the backup
    pub buf_size: usize,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            where_: PathBuf::new(),
            replace: ReplaceMode::Always,
            buf_size: bnet::channel::MAX_NETWORK_BUFFER_SIZE,
        }
    }
}

/// Streams this platform cannot restore, reported once at the end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Unsupported {
    pub data: u32,
    pub attributes: u32,
    pub resource_forks: u32,
    pub finder_info: u32,
    pub acl: u32,
    pub program_names: u32,
    pub program_data: u32,
    pub crypto: u32,
    pub plugin: u32,
}

impl Unsupported {
    fn report(&self, jcr: &Jcr) {
        if self.data > 0 || self.attributes > 0 {
            jcr.jmsg(
                MsgType::Info,
                format!(
                    "{} non-supported data streams and {} non-supported attrib streams ignored.",
                    self.data, self.attributes
                ),
            );
        }
        let others = [
            (self.resource_forks, "resource fork"),
            (self.finder_info, "Finder Info"),
            (self.acl, "acl"),
            (self.program_names, "program name"),
            (self.program_data, "program data"),
            (self.crypto, "crypto"),
            (self.plugin, "plugin"),
        ];
        for (count, what) in others.into_iter().filter(|(n, _)| *n > 0) {
            let plural = if count == 1 { "stream" } else { "streams" };
            jcr.jmsg(
                MsgType::Info,
                format!("{} non-supported {} {} ignored.", count, what, plural),
            );
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RestoreSummary {
    pub files_restored: u32,
    pub signatures_verified: u32,
    pub signature_failures: u32,
    pub unsupported: Unsupported,
}

/// Consume a restore session from `sd` until its closing EOD (or a
/// cancel) and write the files under `opts.where_`.
///
/// Header scan errors, size mismatches and file index mismatches abort the
/// whole restore; everything else only costs the file concerned.
pub async fn do_restore(
    jcr: &Jcr,
    sd: &mut Channel,
    opts: &RestoreOptions,
    pki: &PkiContext,
    acl: &dyn AclHandler,
) -> Result<RestoreSummary> {
    jcr.set_status(JobStatus::Running);
    info!(
        "Job {}: restoring to {}",
        jcr.job_id,
        if opts.where_.as_os_str().is_empty() {
            "original location".to_string()
        } else {
            opts.where_.display().to_string()
        }
    );

    let mut engine = RestoreEngine::new(jcr, opts, pki, acl);
    let result = engine.run(sd).await;

    // Same cleanup on every exit path
    engine.finalize_file().await;
    engine.summary.unsupported.report(jcr);

    if let Err(e) = &result {
        jcr.jmsg(MsgType::Fatal, e.to_string());
    }
    if jcr.is_canceled() {
        jcr.set_status(JobStatus::Canceled);
    }
    result.map(|_| engine.summary)
}

/// Read the next `rechdr` line and the data record it announces. `None`
/// once the storage daemon ends the session.
pub(crate) async fn read_record(sd: &mut Channel) -> Result<Option<RecordHeader>> {
    match bget_msg(sd).await? {
        Frame::Data(_) => {}
        Frame::Signal(Signal::EndOfData) | Frame::Signal(Signal::Terminate) => return Ok(None),
        Frame::Signal(sig) => return Err(ProtocolError::UnexpectedSignal(sig.name()).into()),
    }
    let hdr = RecordHeader::parse(&sd.msg_str())?;

    if let Frame::Signal(sig) = bget_msg(sd).await? {
        return Err(FdError::Fatal(format!(
            "Data record error. Expected data after {}, got signal {}",
            hdr.encode(),
            sig
        )));
    }
    let actual = sd.msg().len();
    if actual != hdr.size as usize {
        return Err(ProtocolError::SizeMismatch {
            declared: hdr.size as usize,
            actual,
        }
        .into());
    }
    Ok(Some(hdr))
}

/// The file currently receiving data.
struct OutputFile {
    file: File,
    path: PathBuf,
    stat: Stat,
    offset: u64,
    sparse: bool,
    win32: Option<Win32Decomposer>,
}

struct RestoreEngine<'a> {
    jcr: &'a Jcr,
    opts: &'a RestoreOptions,
    pki: &'a PkiContext,
    acl: &'a dyn AclHandler,
    order: StreamOrder,
    /// File index of the last attributes record
    file_index: i32,
    /// Output path of the last attributes record when it was created
    ofile: Option<PathBuf>,
    current: Option<OutputFile>,
    /// File index whose records are dropped after an ordering error
    rejected: Option<i32>,
    signature: Option<SignedDigest>,
    decryptor: Option<CipherContext>,
    max_record: usize,
    dbuf: Vec<u8>,
    ebuf: Vec<u8>,
    wbuf: Vec<u8>,
    summary: RestoreSummary,
}

impl<'a> RestoreEngine<'a> {
    fn new(jcr: &'a Jcr, opts: &'a RestoreOptions, pki: &'a PkiContext, acl: &'a dyn AclHandler) -> Self {
        // Encrypted records may carry up to one held-back segment plus tags.
        let segments = opts.buf_size / crate::crypto::session::SEGMENT_LEN + 2;
        let max_record = compress::decompress_buf_size(opts.buf_size)
            + crate::crypto::session::SEGMENT_LEN
            + segments * crate::crypto::session::TAG_LEN;
        Self {
            jcr,
            opts,
            pki,
            acl,
            order: StreamOrder::new(),
            file_index: 0,
            ofile: None,
            current: None,
            rejected: None,
            signature: None,
            decryptor: None,
            max_record,
            dbuf: Vec::with_capacity(max_record),
            ebuf: Vec::new(),
            wbuf: Vec::new(),
            summary: RestoreSummary::default(),
        }
    }

    async fn run(&mut self, sd: &mut Channel) -> Result<()> {
        let cancel = self.jcr.cancel_token();
        loop {
            let hdr = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                hdr = read_record(sd) => hdr?,
            };
            let Some(hdr) = hdr else {
                break;
            };
            self.process(&hdr, sd.msg()).await?;
        }
        Ok(())
    }

    async fn process(&mut self, hdr: &RecordHeader, data: &[u8]) -> Result<()> {
        if let Err(e) = self.order.check(hdr.file_index, hdr.stream) {
            if self.rejected != Some(hdr.file_index) {
                self.jcr.jmsg(MsgType::Error, format!("Stream out of order, record skipped: {}", e));
            }
            if hdr.file_index == self.file_index && self.current.is_some() {
                self.abandon_extract().await;
            }
            self.rejected = Some(hdr.file_index);
            return Ok(());
        }

        let Some(stream) = StreamType::from_code(hdr.stream) else {
            if self.current.is_some() {
                self.finalize_file().await;
            }
            self.ofile = None;
            self.jcr.jmsg(
                MsgType::Error,
                format!("Unknown stream={} ignored. This shouldn't happen!", hdr.stream),
            );
            return Ok(());
        };

        match stream {
            s if s.is_attributes() => self.handle_attributes(hdr, data).await,
            StreamType::EncryptedSessionData => {
                self.handle_session(data).await;
                Ok(())
            }
            s if s.is_data_family() => {
                if self.rejected == Some(hdr.file_index) {
                    return Ok(());
                }
                self.handle_data(hdr, s, data).await;
                Ok(())
            }
            StreamType::MacosForkData | StreamType::EncryptedMacosForkData => {
                self.summary.unsupported.resource_forks += 1;
                Ok(())
            }
            StreamType::HfsplusAttributes => {
                self.summary.unsupported.finder_info += 1;
                Ok(())
            }
            StreamType::UnixAccessAcl | StreamType::UnixDefaultAcl => {
                self.handle_acl(stream, data);
                Ok(())
            }
            StreamType::SignedDigest => {
                self.handle_signature(data);
                Ok(())
            }
            StreamType::Md5Digest
            | StreamType::Sha1Digest
            | StreamType::Sha256Digest
            | StreamType::Sha512Digest => {
                // Accepted, not verified
                debug!("{} digest for file {}: {} bytes", stream, hdr.file_index, data.len());
                Ok(())
            }
            StreamType::ProgramNames => {
                self.summary.unsupported.program_names += 1;
                Ok(())
            }
            StreamType::ProgramData => {
                self.summary.unsupported.program_data += 1;
                Ok(())
            }
            StreamType::PluginName | StreamType::PluginData | StreamType::RestoreObject => {
                self.summary.unsupported.plugin += 1;
                Ok(())
            }
            other => {
                if self.current.is_some() {
                    self.finalize_file().await;
                }
                self.jcr.jmsg(
                    MsgType::Error,
                    format!("Unexpected stream {} for file index {}", other, hdr.file_index),
                );
                Ok(())
            }
        }
    }

    async fn handle_attributes(&mut self, hdr: &RecordHeader, data: &[u8]) -> Result<()> {
        self.finalize_file().await;
        self.ofile = None;
        self.rejected = None;

        let rec = AttributesRecord::decode(data)?;
        if rec.file_index != hdr.file_index {
            return Err(ProtocolError::FileIndexMismatch {
                header: hdr.file_index,
                record: rec.file_index,
            }
            .into());
        }
        self.file_index = rec.file_index;
        // Extended (Win32) attributes cannot be applied here
        if hdr.stream == StreamType::UnixAttributesEx.code() && !rec.attribs_ex.is_empty() {
            self.summary.unsupported.attributes += 1;
        }
        let fname = PathBuf::from(OsStr::from_bytes(&rec.fname));
        let link = PathBuf::from(OsStr::from_bytes(&rec.link));
        self.jcr.next_file_index(&fname.to_string_lossy());

        let (stat, _) = match rec.stat() {
            Ok(st) => st,
            Err(e) => {
                self.jcr.jmsg(MsgType::Error, format!("{}: {}", fname.display(), e));
                return Ok(());
            }
        };
        let Some(file_type) = FileType::from_code(rec.file_type) else {
            self.jcr.jmsg(
                MsgType::Error,
                format!("Unknown file type {} for {}", rec.file_type, fname.display()),
            );
            return Ok(());
        };
        if rec.data_stream != 0 {
            match StreamType::from_code(rec.data_stream) {
                Some(s) if s.is_data_family() => {
                    if s.is_encrypted() && self.pki.decryption_key.is_none() {
                        self.summary.unsupported.crypto += 1;
                        self.rejected = Some(rec.file_index);
                        return Ok(());
                    }
                }
                _ => {
                    self.summary.unsupported.data += 1;
                    self.rejected = Some(rec.file_index);
                    return Ok(());
                }
            }
        }

        let ofile = output_path(&self.opts.where_, &fname);
        debug!("Restoring {} as {}", fname.display(), ofile.display());
        let created = {
            let (ofile, link) = (ofile.clone(), link.clone());
            let (where_, replace) = (self.opts.where_.clone(), self.opts.replace);
            // Opening a FIFO waits for its reader
            tokio::task::spawn_blocking(move || create_file(&ofile, file_type, &stat, &link, &where_, replace))
                .await
                .unwrap_or_else(|e| CreateStatus::Error(format!("File creation task failed: {}", e)))
        };
        match created {
            CreateStatus::Error(msg) => {
                self.jcr.jmsg(MsgType::Error, msg);
            }
            CreateStatus::Skip => {
                self.jcr.inc_skipped();
                self.jcr
                    .jmsg(MsgType::Skipped, format!("     File skipped, exists: {}", ofile.display()));
            }
            CreateStatus::Created => {
                self.jcr.jmsg(MsgType::Restored, ls_line(&stat, &fname, &link, file_type));
                if file_type != FileType::LnkSaved {
                    if let Err(e) = set_attributes(&ofile, &stat, file_type == FileType::Lnk) {
                        self.jcr.jmsg(
                            MsgType::Error,
                            format!("Unable to set attributes on {}: ERR={}", ofile.display(), e),
                        );
                    }
                }
                self.summary.files_restored += 1;
                self.ofile = Some(ofile);
            }
            CreateStatus::Extract(file) => {
                self.jcr.jmsg(MsgType::Restored, ls_line(&stat, &fname, &link, file_type));
                self.current = Some(OutputFile {
                    file: File::from_std(file),
                    path: ofile.clone(),
                    stat,
                    offset: 0,
                    sparse: false,
                    win32: None,
                });
                self.ofile = Some(ofile);
            }
        }
        Ok(())
    }

    async fn handle_session(&mut self, data: &[u8]) {
        if self.current.is_none() {
            return;
        }
        if self.decryptor.is_some() {
            self.jcr.jmsg(MsgType::Error, "Unexpected cryptographic session data stream.");
            self.abandon_extract().await;
            return;
        }
        let Some(key) = &self.pki.decryption_key else {
            self.jcr.jmsg(
                MsgType::Error,
                "Missing private key required to decrypt encrypted backup data.",
            );
            self.abandon_extract().await;
            return;
        };
        match SessionKey::decode(data, key) {
            Ok(session) => self.decryptor = Some(session.decryptor()),
            Err(CryptoError::RecipientMismatch) => {
                self.jcr.jmsg(
                    MsgType::Error,
                    "Failed to decrypt the session key: no recipient matches this client.",
                );
                self.abandon_extract().await;
            }
            Err(e) => {
                self.jcr
                    .jmsg(MsgType::Error, format!("Failed to decrypt the session key: {}", e));
                self.abandon_extract().await;
            }
        }
    }

    async fn handle_data(&mut self, hdr: &RecordHeader, stream: StreamType, data: &[u8]) {
        if self.current.is_none() || hdr.file_index != self.file_index {
            debug!(
                "Dropping {} record of file {} ({} bytes), extracting file {}: {}",
                stream,
                hdr.file_index,
                data.len(),
                self.file_index,
                self.current.is_some()
            );
            return;
        }
        self.jcr.add_read_bytes(data.len() as u64);

        let mut payload = data;
        let mut seek_to = None;
        if stream.is_sparse() {
            match sparse::split_offset(payload) {
                Some((offset, rest)) => {
                    seek_to = Some(offset);
                    payload = rest;
                }
                None => {
                    self.fail_file("Sparse record without offset").await;
                    return;
                }
            }
        }

        if stream.is_gzip() {
            if let Err(e) = compress::decompress_into(payload, self.max_record, &mut self.dbuf) {
                let text = format!("{}", e);
                self.fail_file(&text).await;
                return;
            }
            payload = &self.dbuf;
        }

        if stream.is_encrypted() {
            if self.decryptor.is_none() {
                self.fail_file("Missing cryptographic session for encrypted data").await;
                return;
            }
            let Some(cipher) = self.decryptor.as_mut() else {
                return;
            };
            self.ebuf.clear();
            if let Err(e) = cipher.update(payload, &mut self.ebuf) {
                let text = format!("Decryption error: {}", e);
                self.fail_file(&text).await;
                return;
            }
            if self.ebuf.is_empty() {
                return;
            }
            payload = &self.ebuf;
        }

        let Some(out) = self.current.as_mut() else {
            return;
        };
        out.sparse |= stream.is_sparse();
        let res = write_payload(out, stream.is_win32(), seek_to, payload, &mut self.wbuf).await;
        match res {
            Ok(n) => self.jcr.add_job_bytes(n as u64),
            Err(e) => {
                let text = format!("Write error: {}", e);
                self.fail_file(&text).await;
            }
        }
    }

    fn handle_acl(&mut self, stream: StreamType, data: &[u8]) {
        let (Some(kind), Some(path)) = (AclKind::from_stream(stream), self.ofile.as_ref()) else {
            return;
        };
        if let Err(e) = self.acl.apply(path, kind, data) {
            if e.kind() == std::io::ErrorKind::Unsupported {
                self.summary.unsupported.acl += 1;
            } else {
                self.jcr.jmsg(
                    MsgType::Warning,
                    format!("Cannot set {} on {}: ERR={}", stream, path.display(), e),
                );
            }
        }
    }

    fn handle_signature(&mut self, data: &[u8]) {
        if self.current.is_none() || self.pki.trusted_signers.is_empty() {
            return;
        }
        match SignedDigest::decode(data) {
            Ok(sig) => self.signature = Some(sig),
            Err(e) => self
                .jcr
                .jmsg(MsgType::Error, format!("Failed to decode message signature: {}", e)),
        }
    }

    /// Report a per-file error and stop extracting that file.
    async fn fail_file(&mut self, reason: &str) {
        let name = self
            .current
            .as_ref()
            .map(|o| o.path.display().to_string())
            .unwrap_or_default();
        self.jcr.jmsg(MsgType::Error, format!("{} on file {}", reason, name));
        self.abandon_extract().await;
    }

    async fn abandon_extract(&mut self) {
        if let Some(mut out) = self.current.take() {
            if let Err(e) = out.file.flush().await {
                self.jcr.jmsg(
                    MsgType::Error,
                    format!("Error closing {}: ERR={}", out.path.display(), e),
                );
            }
        }
        self.decryptor = None;
        self.signature = None;
        self.rejected = Some(self.file_index);
    }

    /// Close the file being extracted: flush the cipher, set attributes and
    /// check a pending signature.
    async fn finalize_file(&mut self) {
        let Some(mut out) = self.current.take() else {
            self.decryptor = None;
            self.signature = None;
            return;
        };

        if let Some(mut cipher) = self.decryptor.take() {
            self.ebuf.clear();
            match cipher.finalize(&mut self.ebuf) {
                Ok(()) if !self.ebuf.is_empty() => {
                    let win32 = out.win32.is_some();
                    match write_payload(&mut out, win32, None, &self.ebuf, &mut self.wbuf).await {
                        Ok(n) => self.jcr.add_job_bytes(n as u64),
                        Err(e) => self.jcr.jmsg(
                            MsgType::Error,
                            format!("Write error on {}: ERR={}", out.path.display(), e),
                        ),
                    }
                }
                Ok(()) => {}
                Err(e) => self.jcr.jmsg(
                    MsgType::Error,
                    format!("Decryption error on {}: {}", out.path.display(), e),
                ),
            }
        }

        if out.win32.as_ref().is_some_and(|w| !w.is_complete()) {
            self.jcr.jmsg(
                MsgType::Error,
                format!("Incomplete Win32 stream for {}", out.path.display()),
            );
        }
        if out.sparse {
            let size = out.stat.size.max(0) as u64;
            if out.offset < size {
                if let Err(e) = out.file.set_len(size).await {
                    self.jcr.jmsg(
                        MsgType::Error,
                        format!("Cannot extend {}: ERR={}", out.path.display(), e),
                    );
                }
            }
        }
        if let Err(e) = out.file.flush().await {
            self.jcr.jmsg(
                MsgType::Error,
                format!("Error closing {}: ERR={}", out.path.display(), e),
            );
        }
        let OutputFile { file, path, stat, .. } = out;
        drop(file);

        if let Err(e) = set_attributes(&path, &stat, false) {
            self.jcr.jmsg(
                MsgType::Error,
                format!("Unable to set attributes on {}: ERR={}", path.display(), e),
            );
        }
        self.summary.files_restored += 1;

        if let Some(sig) = self.signature.take() {
            self.verify_signature(&path, sig).await;
        }
    }

    async fn verify_signature(&mut self, path: &Path, sig: SignedDigest) {
        let mut last_err = CryptoError::NoSigner;
        for key in &self.pki.trusted_signers {
            let Some(algorithm) = sig.algorithm_for(key) else {
                continue;
            };
            let file = path.to_path_buf();
            let digest = match tokio::task::spawn_blocking(move || digest_file(&file, algorithm)).await {
                Ok(Ok(d)) => d,
                Ok(Err(e)) => {
                    last_err = CryptoError::Cipher(e.to_string());
                    continue;
                }
                Err(e) => {
                    last_err = CryptoError::Cipher(e.to_string());
                    continue;
                }
            };
            match sig.verify(key, &digest) {
                Ok(()) => {
                    debug!("Signature of {} verified", path.display());
                    self.summary.signatures_verified += 1;
                    return;
                }
                Err(e) => last_err = e,
            }
        }
        self.summary.signature_failures += 1;
        self.jcr.jmsg(
            MsgType::Error,
            format!(
                "Signature validation failed for file {}: ERR={}",
                path.display(),
                last_err
            ),
        );
    }
}

/// Write decoded bytes to the output, seeking first for sparse records.
/// Returns the number of bytes written to the file.
async fn write_payload(
    out: &mut OutputFile,
    win32: bool,
    seek_to: Option<u64>,
    payload: &[u8],
    scratch: &mut Vec<u8>,
) -> std::io::Result<usize> {
    if let Some(offset) = seek_to {
        if offset != out.offset {
            out.file.seek(SeekFrom::Start(offset)).await?;
            out.offset = offset;
        }
    }
    let bytes: &[u8] = if win32 {
        scratch.clear();
        out.win32
            .get_or_insert_with(Win32Decomposer::new)
            .write(payload, scratch)?;
        &scratch[..]
    } else {
        payload
    };
    out.file.write_all(bytes).await?;
    out.offset += bytes.len() as u64;
    Ok(bytes.len())
}

/// One `ls -l` style line for the restore listing.
pub(crate) fn ls_line(st: &Stat, fname: &Path, link: &Path, file_type: FileType) -> String {
    let kind = match st.file_kind() {
        bnet::attribs::S_IFDIR => 'd',
        bnet::attribs::S_IFLNK => 'l',
        bnet::attribs::S_IFIFO => 'p',
        bnet::attribs::S_IFCHR => 'c',
        bnet::attribs::S_IFBLK => 'b',
        bnet::attribs::S_IFSOCK => 's',
        _ => '-',
    };
    let mut mode = String::with_capacity(10);
    mode.push(kind);
    for shift in [6, 3, 0] {
        let bits = (st.mode >> shift) & 0o7;
        mode.push(if bits & 4 != 0 { 'r' } else { '-' });
        mode.push(if bits & 2 != 0 { 'w' } else { '-' });
        mode.push(if bits & 1 != 0 { 'x' } else { '-' });
    }
    let when = Local
        .timestamp_opt(st.mtime, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "????-??-?? ??:??:??".to_string());
    let mut line = format!(
        "{} {:>2} {:<8} {:<8} {:>8}  {}  {}",
        mode,
        st.nlink,
        st.uid,
        st.gid,
        st.size,
        when,
        fname.display()
    );
    match file_type {
        FileType::Lnk => line.push_str(&format!(" -> {}", link.display())),
        FileType::LnkSaved => line.push_str(&format!(" ==> {}", link.display())),
        _ => {}
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::acl::NoAcl;
    use bnet::replay::SessionSpool;
    use bnet::{encode_stat, Channel};
    use tempfile::TempDir;
    use tokio::io::duplex;

    fn attrs(fi: i32, fname: &str, size: i64, data_stream: i32) -> Vec<u8> {
        let st = Stat {
            mode: bnet::attribs::S_IFREG | 0o644,
            nlink: 1,
            size,
            mtime: 1_600_000_000,
            atime: 1_600_000_000,
            ..Stat::default()
        };
        AttributesRecord {
            file_index: fi,
            file_type: if size == 0 { FileType::RegE.code() } else { FileType::Reg.code() },
            fname: fname.as_bytes().to_vec(),
            attribs: encode_stat(&st, None),
            link: Vec::new(),
            attribs_ex: String::new(),
            data_stream,
        }
        .encode()
    }

    async fn restore_with(
        jcr: &Jcr,
        spool: SessionSpool,
        where_: &Path,
        pki: &PkiContext,
    ) -> anyhow::Result<Result<RestoreSummary>> {
        let (a, b) = duplex(1024 * 1024);
        let mut fd = Channel::from_stream("storage daemon", "localhost", 9103, a);
        let sd = Channel::from_stream("file daemon", "localhost", 9102, b);
        let (_, mut writer) = sd.into_parts();
        let sender = tokio::spawn(async move { spool.replay(&mut writer).await });

        let opts = RestoreOptions {
            where_: where_.to_path_buf(),
            replace: ReplaceMode::Always,
            buf_size: 4096,
        };
        let result = do_restore(jcr, &mut fd, &opts, pki, &NoAcl).await;
        sender.await??;
        Ok(result)
    }

    async fn restore(spool: SessionSpool, where_: &Path) -> anyhow::Result<(Jcr, Result<RestoreSummary>)> {
        let jcr = Jcr::new(2, "restore-test");
        let result = restore_with(&jcr, spool, where_, &PkiContext::disabled()).await?;
        Ok((jcr, result))
    }

    #[tokio::test]
    async fn test_restores_plain_file() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut spool = SessionSpool::new(1, 1);
        spool.push(1, 1, attrs(1, "/data/a.txt", 11, 2));
        spool.push(1, 2, b"hello ".to_vec());
        spool.push(1, 2, b"world".to_vec());
        spool.push(1, 3, vec![0u8; 16]);

        let (jcr, result) = restore(spool, dir.path()).await?;
        let summary = result?;
        assert_eq!(summary.files_restored, 1);
        let out = dir.path().join("data/a.txt");
        assert_eq!(std::fs::read(&out)?, b"hello world");
        assert_eq!(crate::fs::metadata::lstat(&out)?.mtime, 1_600_000_000);
        let c = jcr.counters();
        assert_eq!(c.job_files, 1);
        assert_eq!(c.job_bytes, 11);
        Ok(())
    }

    #[tokio::test]
    async fn test_orphan_data_is_skipped_and_session_continues() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut spool = SessionSpool::new(1, 1);
        // data for file 1 without its attributes
        spool.push(1, 2, b"orphan".to_vec());
        spool.push(1, 2, b"more orphan".to_vec());
        spool.push(2, 1, attrs(2, "/b.txt", 2, 2));
        spool.push(2, 2, b"ok".to_vec());

        let (jcr, result) = restore(spool, dir.path()).await?;
        let summary = result?;
        assert_eq!(summary.files_restored, 1);
        assert_eq!(std::fs::read(dir.path().join("b.txt"))?, b"ok");
        assert_eq!(jcr.messages_of(MsgType::Error).len(), 1);
        assert_ne!(jcr.status(), JobStatus::ErrorTerminated);
        Ok(())
    }

    #[tokio::test]
    async fn test_file_index_mismatch_is_fatal() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut spool = SessionSpool::new(1, 1);
        spool.push(1, 1, attrs(7, "/x", 0, 0));

        let (jcr, result) = restore(spool, dir.path()).await?;
        assert!(matches!(
            result,
            Err(FdError::Protocol(ProtocolError::FileIndexMismatch { header: 1, record: 7 }))
        ));
        assert_eq!(jcr.status(), JobStatus::ErrorTerminated);
        Ok(())
    }

    #[tokio::test]
    async fn test_unsupported_streams_are_counted() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut spool = SessionSpool::new(1, 1);
        spool.push(1, 1, attrs(1, "/f", 1, 2));
        spool.push(1, 2, b"x".to_vec());
        spool.push(1, StreamType::MacosForkData.code(), b"rsrc".to_vec());
        spool.push(1, StreamType::ProgramNames.code(), b"prog".to_vec());
        spool.push(2, 1, attrs(2, "/g", 1, 2));
        spool.push(2, StreamType::MacosForkData.code(), b"rsrc".to_vec());

        let (jcr, result) = restore(spool, dir.path()).await?;
        let summary = result?;
        assert_eq!(summary.unsupported.resource_forks, 2);
        assert_eq!(summary.unsupported.program_names, 1);
        let info = jcr.messages_of(MsgType::Info);
        assert!(info.contains(&"2 non-supported resource fork streams ignored.".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_bad_gzip_record_costs_only_that_file() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut spool = SessionSpool::new(1, 1);
        spool.push(1, 1, attrs(1, "/z.txt", 10, StreamType::GzipData.code()));
        spool.push(1, StreamType::GzipData.code(), b"definitely not zlib".to_vec());
        spool.push(1, StreamType::GzipData.code(), b"nor this".to_vec());
        spool.push(2, 1, attrs(2, "/ok.txt", 2, 2));
        spool.push(2, 2, b"ok".to_vec());

        let (jcr, result) = restore(spool, dir.path()).await?;
        let summary = result?;
        assert_eq!(summary.files_restored, 1);
        assert_eq!(std::fs::read(dir.path().join("ok.txt"))?, b"ok");
        let errors = jcr.messages_of(MsgType::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].ends_with("z.txt"));
        assert_eq!(jcr.finish(), JobStatus::Warnings);
        Ok(())
    }

    #[tokio::test]
    async fn test_bad_session_key_costs_only_that_file() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let pki = PkiContext::disabled()
            .with_encryption(x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng));
        let encrypted = StreamType::EncryptedFileData.code();
        let mut spool = SessionSpool::new(1, 1);
        spool.push(1, 1, attrs(1, "/secret", 4, encrypted));
        spool.push(1, StreamType::EncryptedSessionData.code(), b"garbage key".to_vec());
        spool.push(1, encrypted, b"xxxx".to_vec());
        spool.push(2, 1, attrs(2, "/plain", 2, 2));
        spool.push(2, 2, b"ok".to_vec());

        let jcr = Jcr::new(2, "restore-test");
        let summary = restore_with(&jcr, spool, dir.path(), &pki).await??;
        assert_eq!(summary.files_restored, 1);
        assert_eq!(std::fs::read(dir.path().join("plain"))?, b"ok");
        let errors = jcr.messages_of(MsgType::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Failed to decrypt the session key"));
        assert_ne!(jcr.status(), JobStatus::ErrorTerminated);
        Ok(())
    }

    #[tokio::test]
    async fn test_canceled_restore_stops_cleanly() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut spool = SessionSpool::new(1, 1);
        spool.push(1, 1, attrs(1, "/a", 1, 2));
        spool.push(1, 2, b"a".to_vec());

        let jcr = Jcr::new(2, "restore-test");
        jcr.cancel();
        let summary = restore_with(&jcr, spool, dir.path(), &PkiContext::disabled()).await??;
        assert_eq!(summary.files_restored, 0);
        assert!(!dir.path().join("a").exists());
        assert_eq!(jcr.status(), JobStatus::Canceled);
        assert_eq!(jcr.finish(), JobStatus::Canceled);
        Ok(())
    }

    #[tokio::test]
    async fn test_fifo_data_goes_to_its_reader() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let fifo = dir.path().join("pipe");
        let st = Stat {
            mode: bnet::attribs::S_IFIFO | 0o600,
            nlink: 1,
            ..Stat::default()
        };
        let mut spool = SessionSpool::new(1, 1);
        let rec = AttributesRecord {
            file_index: 1,
            file_type: FileType::Fifo.code(),
            fname: b"/pipe".to_vec(),
            attribs: encode_stat(&st, None),
            link: Vec::new(),
            attribs_ex: String::new(),
            data_stream: 2,
        };
        spool.push(1, 1, rec.encode());
        spool.push(1, 2, b"piped".to_vec());

        let reader = {
            let fifo = fifo.clone();
            std::thread::spawn(move || {
                while std::fs::symlink_metadata(&fifo).is_err() {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                std::fs::read(&fifo)
            })
        };
        let (_, result) = restore(spool, dir.path()).await?;
        assert_eq!(result?.files_restored, 1);
        let received = reader.join().map_err(|_| anyhow::anyhow!("reader panicked"))??;
        assert_eq!(received, b"piped");
        Ok(())
    }

    #[test]
    fn test_ls_line() {
        let st = Stat {
            mode: bnet::attribs::S_IFLNK | 0o777,
            nlink: 1,
            ..Stat::default()
        };
        let line = ls_line(&st, Path::new("/a"), Path::new("b"), FileType::Lnk);
        assert!(line.starts_with("lrwxrwxrwx"));
        assert!(line.ends_with("/a -> b"));
    }
}
