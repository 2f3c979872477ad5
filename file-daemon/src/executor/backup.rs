//! Backup: send every enumerated file to the storage daemon as a sequence
//! of streams (attributes, optional session key, data, ACLs, digests).

use crate::crypto::{CipherContext, DigestAlgorithm, FileDigest, PkiContext, SessionKey, SignedDigest};
use crate::fs::acl::{AclHandler, AclKind};
use crate::fs::walker::{spawn_find_files, FileSet, FindEntry, FindOptions, FoFlags};
use crate::fs::win32;
use crate::jcr::{Jcr, JobStatus, MsgType};
use crate::transfer::{compress, sparse};
use crate::utils::errors::{FdError, Result};
use bnet::stream::{select_data_stream, DataStreamOptions};
use bnet::{encode_stat, AttributesRecord, ChannelWriter, FileType, Signal, StreamHeader, StreamType};
use std::collections::HashMap;
use std::os::unix::ffi::OsStrExt;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

/// Entries queued between the enumerator and the sender.
pub(crate) const FIND_QUEUE: usize = 256;

/// Send the whole file set to the storage daemon, then a final EOD.
///
/// A failed send is fatal for the job; per-file problems are reported and
/// counted and the next file is sent.
pub async fn blast_data_to_storage_daemon(
    jcr: &Jcr,
    sd: &mut ChannelWriter,
    fileset: FileSet,
    pki: &PkiContext,
    acl: &dyn AclHandler,
    buf_size: usize,
) -> Result<()> {
    jcr.set_status(JobStatus::Running);
    info!(
        "Job {}: sending file set ({} roots) to {}",
        jcr.job_id,
        fileset.include.len(),
        sd.state().who()
    );

    let mut engine = BackupEngine::new(jcr, pki, acl, &fileset.options, buf_size);
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
            engine.save_file(sd, entry).await?;
        }
        // End of session data
        sd.signal(Signal::EndOfData).await?;
        Ok(())
    }
    .await;

    drop(entries);
    match finder.await {
        Ok(n) => debug!("Enumerator finished after {} entries", n),
        Err(e) => jcr.jmsg(MsgType::Error, format!("File enumeration failed: {}", e)),
    }

    if let Err(e) = &result {
        let text = match e {
            FdError::Network(err) => format!("Network send error to SD. ERR={}", err),
            other => other.to_string(),
        };
        jcr.jmsg(MsgType::Fatal, text);
    }
    if jcr.is_canceled() {
        jcr.set_status(JobStatus::Canceled);
    }
    result
}

struct BackupEngine<'a> {
    jcr: &'a Jcr,
    pki: &'a PkiContext,
    acl: &'a dyn AclHandler,
    flags: FoFlags,
    gzip_level: u32,
    buf_size: usize,
    /// Same for every file of the job
    data_stream: StreamType,
    digest: Option<DigestAlgorithm>,
    /// (dev, ino) of multiply linked files to their file index
    link_fis: HashMap<(u64, u64), i32>,
    rbuf: Vec<u8>,
}

impl<'a> BackupEngine<'a> {
    fn new(
        jcr: &'a Jcr,
        pki: &'a PkiContext,
        acl: &'a dyn AclHandler,
        options: &FindOptions,
        buf_size: usize,
    ) -> Self {
        let flags = options.flags;
        let data_stream = select_data_stream(DataStreamOptions {
            sparse: flags.contains(FoFlags::SPARSE),
            gzip: flags.contains(FoFlags::GZIP),
            encrypt: pki.encrypting(),
            win32: flags.contains(FoFlags::WIN32),
        });
        let digest = digest_for(flags);
        debug!("Data stream for this job: {}", data_stream);
        Self {
            jcr,
            pki,
            acl,
            flags,
            gzip_level: options.gzip_level,
            buf_size,
            data_stream,
            digest,
            link_fis: HashMap::new(),
            rbuf: vec![0u8; buf_size],
        }
    }

    async fn save_file(&mut self, sd: &mut ChannelWriter, entry: FindEntry) -> Result<()> {
        let fname = entry.fname.to_string_lossy().into_owned();
        if entry.file_type == FileType::DirBegin {
            return Ok(());
        }
        if let Some((kind, text)) = skip_notice(&entry) {
            self.jcr.file_examined(&fname);
            self.jcr.inc_skipped();
            self.jcr.jmsg(kind, text);
            return Ok(());
        }

        let st = entry.stat;
        let file_index = self.jcr.next_file_index(&fname);
        debug!("Saving {} as file index {} ({:?})", fname, file_index, entry.file_type);

        let link_fi = if entry.file_type == FileType::LnkSaved {
            self.link_fis.get(&(st.dev, st.ino)).copied()
        } else {
            if st.nlink > 1 && !st.is_dir() {
                self.link_fis.insert((st.dev, st.ino), file_index);
            }
            None
        };

        let has_data = match entry.file_type {
            FileType::Reg => st.size > 0,
            FileType::Raw | FileType::Fifo => true,
            _ => false,
        };

        let record = AttributesRecord {
            file_index,
            file_type: entry.file_type.code(),
            fname: entry.fname.as_os_str().as_bytes().to_vec(),
            attribs: encode_stat(&st, link_fi),
            link: if entry.file_type.has_link() {
                entry.link.as_os_str().as_bytes().to_vec()
            } else {
                Vec::new()
            },
            attribs_ex: String::new(),
            data_stream: if has_data { self.data_stream.code() } else { 0 },
        };
        send_stream(sd, file_index, StreamType::UnixAttributes, &[&record.encode()]).await?;

        let mut digests = None;
        if has_data {
            digests = self.send_data(sd, file_index, &entry).await?;
        }

        if self.flags.contains(FoFlags::ACL) && entry.file_type != FileType::Lnk {
            self.send_acls(sd, file_index, &entry).await?;
        }

        if let Some((digest, signing)) = digests {
            if let (Some(signing), Some(key)) = (signing, &self.pki.signer) {
                let algorithm = signing.algorithm();
                let mut sig = SignedDigest::new();
                sig.add_signer(key, algorithm, &signing.finalize());
                send_stream(sd, file_index, StreamType::SignedDigest, &[&sig.encode()]).await?;
            }
            if let Some(digest) = digest {
                let stream = digest.algorithm().stream();
                send_stream(sd, file_index, stream, &[&digest.finalize()]).await?;
            }
        }
        Ok(())
    }

    /// Send the content of one file. Returns the running digests when the
    /// file could be opened.
    async fn send_data(
        &mut self,
        sd: &mut ChannelWriter,
        file_index: i32,
        entry: &FindEntry,
    ) -> Result<Option<(Option<FileDigest>, Option<FileDigest>)>> {
        let fname = entry.fname.display();
        let mut file = match File::open(&entry.fname).await {
            Ok(f) => f,
            Err(e) => {
                self.jcr
                    .jmsg(MsgType::Error, format!("     Cannot open {}: ERR={}.", fname, e));
                return Ok(None);
            }
        };

        let mut digest = self.digest.map(DigestAlgorithm::hasher);
        let mut signing = (self.pki.signing() && entry.file_type == FileType::Reg)
            .then(|| DigestAlgorithm::Sha256.hasher());

        let mut cipher = None;
        if self.data_stream.is_encrypted() {
            let session = SessionKey::generate();
            let blob = match session.encode(&self.pki.recipients) {
                Ok(blob) => blob,
                Err(e) => {
                    self.jcr.jmsg(
                        MsgType::Error,
                        format!("     Cannot create session key for {}: ERR={}", fname, e),
                    );
                    return Ok(None);
                }
            };
            send_stream(sd, file_index, StreamType::EncryptedSessionData, &[&blob]).await?;
            cipher = Some(session.encryptor());
        }

        let mut pipeline = DataPipeline {
            sparse: self.data_stream.is_sparse(),
            gzip_level: self.data_stream.is_gzip().then_some(self.gzip_level),
            cipher,
            ebuf: Vec::new(),
            cbuf: Vec::new(),
            out: Vec::with_capacity(self.buf_size + sparse::SPARSE_FADDR_SIZE),
        };

        sd.send(StreamHeader::new(file_index, self.data_stream).encode().as_bytes())
            .await?;

        let file_size = entry.stat.size.max(0) as u64;
        let win32 = self.data_stream.is_win32();
        if win32 {
            let hdr = win32::data_stream_header(file_size);
            let sent = pipeline.push(sd, &hdr, 0).await?;
            self.jcr.add_job_bytes(sent);
        }

        let mut offset: u64 = 0;
        loop {
            if self.jcr.is_canceled() {
                break;
            }
            let want = if win32 {
                (file_size - offset).min(self.buf_size as u64) as usize
            } else {
                self.buf_size
            };
            if want == 0 {
                break;
            }
            let n = match read_full(&mut file, &mut self.rbuf[..want]).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    self.jcr.jmsg(
                        MsgType::Error,
                        format!("     Read error on file {}. ERR={}", fname, e),
                    );
                    break;
                }
            };
            self.jcr.add_read_bytes(n as u64);
            let chunk = &self.rbuf[..n];
            if let Some(d) = digest.as_mut() {
                d.update(chunk);
            }
            if let Some(d) = signing.as_mut() {
                d.update(chunk);
            }
            if pipeline.sparse && sparse::is_hole(chunk, self.buf_size, offset, file_size) {
                offset += n as u64;
                continue;
            }
            let sent = pipeline.push(sd, chunk, offset).await?;
            self.jcr.add_job_bytes(sent);
            offset += n as u64;
        }
        drop(file);

        let sent = pipeline.finish(sd).await?;
        self.jcr.add_job_bytes(sent);
        sd.signal(Signal::EndOfData).await?;
        Ok(Some((digest, signing)))
    }

    async fn send_acls(&self, sd: &mut ChannelWriter, file_index: i32, entry: &FindEntry) -> Result<()> {
        let mut kinds = vec![AclKind::Access];
        if entry.stat.is_dir() {
            kinds.push(AclKind::Default);
        }
        for kind in kinds {
            match self.acl.capture(&entry.fname, kind) {
                Ok(Some(data)) => send_stream(sd, file_index, kind.stream(), &[&data]).await?,
                Ok(None) => {}
                Err(e) => self.jcr.jmsg(
                    MsgType::Warning,
                    format!("     Cannot read {} of {}: ERR={}", kind.stream(), entry.fname.display(), e),
                ),
            }
        }
        Ok(())
    }
}

/// Digest named by the file set options; the first one set wins.
pub(crate) fn digest_for(flags: FoFlags) -> Option<DigestAlgorithm> {
    if flags.contains(FoFlags::MD5) {
        Some(DigestAlgorithm::Md5)
    } else if flags.contains(FoFlags::SHA1) {
        Some(DigestAlgorithm::Sha1)
    } else if flags.contains(FoFlags::SHA256) {
        Some(DigestAlgorithm::Sha256)
    } else if flags.contains(FoFlags::SHA512) {
        Some(DigestAlgorithm::Sha512)
    } else {
        None
    }
}

/// The job message for an entry that is reported instead of saved, or
/// `None` when the entry is saved.
pub(crate) fn skip_notice(entry: &FindEntry) -> Option<(MsgType, String)> {
    let fname = entry.fname.display();
    let err = entry.err.as_deref().unwrap_or("");
    match entry.file_type {
        FileType::LnkSaved
        | FileType::RegE
        | FileType::Reg
        | FileType::Lnk
        | FileType::DirEnd
        | FileType::Spec
        | FileType::Raw
        | FileType::Fifo => None,
        FileType::NoAccess => Some((MsgType::Error, format!("     Could not access {}: ERR={}", fname, err))),
        FileType::NoFollow => Some((
            MsgType::Error,
            format!("     Could not follow link {}: ERR={}", fname, err),
        )),
        FileType::NoStat => Some((MsgType::Error, format!("     Could not stat {}: ERR={}", fname, err))),
        FileType::NoOpen => Some((
            MsgType::Error,
            format!("     Could not open directory {}: ERR={}", fname, err),
        )),
        FileType::NoChg | FileType::DirNoChg => {
            Some((MsgType::Skipped, format!("     Unchanged file skipped: {}", fname)))
        }
        FileType::IsArch => Some((MsgType::Skipped, format!("     Archive file not saved: {}", fname))),
        FileType::NoRecurse => Some((
            MsgType::Info,
            format!("     Recursion turned off. Directory skipped: {}", fname),
        )),
        FileType::NoFsChg => Some((
            MsgType::Info,
            format!("     {} is a different filesystem. Will not descend into it.", fname),
        )),
        FileType::InvalidFs => Some((
            MsgType::Info,
            format!("     Disallowed filesystem. Will not descend into {}", fname),
        )),
        other => Some((
            MsgType::Error,
            format!("     Unknown file type {}; not saved: {}", other.code(), fname),
        )),
    }
}

/// Per-file chain from read buffer to wire: encrypt, compress, then the
/// sparse offset prefix.
struct DataPipeline {
    sparse: bool,
    gzip_level: Option<u32>,
    cipher: Option<CipherContext>,
    ebuf: Vec<u8>,
    cbuf: Vec<u8>,
    out: Vec<u8>,
}

impl DataPipeline {
    /// Send `data` read at `offset`. Returns the payload bytes sent.
    async fn push(&mut self, sd: &mut ChannelWriter, data: &[u8], offset: u64) -> Result<u64> {
        match self.cipher.as_mut() {
            Some(cipher) => {
                self.ebuf.clear();
                cipher.update(data, &mut self.ebuf)?;
                if self.ebuf.is_empty() {
                    return Ok(0);
                }
                let payload = std::mem::take(&mut self.ebuf);
                let sent = self.send(sd, &payload, offset).await;
                self.ebuf = payload;
                sent
            }
            None => self.send(sd, data, offset).await,
        }
    }

    /// Flush what the cipher still holds.
    async fn finish(&mut self, sd: &mut ChannelWriter) -> Result<u64> {
        let Some(mut cipher) = self.cipher.take() else {
            return Ok(0);
        };
        self.ebuf.clear();
        cipher.finalize(&mut self.ebuf)?;
        if self.ebuf.is_empty() {
            return Ok(0);
        }
        let payload = std::mem::take(&mut self.ebuf);
        self.send(sd, &payload, 0).await
    }

    async fn send(&mut self, sd: &mut ChannelWriter, payload: &[u8], offset: u64) -> Result<u64> {
        self.out.clear();
        if self.sparse {
            sparse::put_offset(&mut self.out, offset);
        }
        let body = match self.gzip_level {
            Some(level) => {
                compress::compress_into(payload, level, &mut self.cbuf)?;
                &self.cbuf[..]
            }
            None => payload,
        };
        self.out.extend_from_slice(body);
        let sent = body.len() as u64;
        sd.send(&self.out).await?;
        Ok(sent)
    }
}

/// Send a complete stream: header, data records, EOD.
pub(crate) async fn send_stream(
    sd: &mut ChannelWriter,
    file_index: i32,
    stream: StreamType,
    records: &[&[u8]],
) -> Result<()> {
    sd.send(StreamHeader::new(file_index, stream).encode().as_bytes())
        .await?;
    for rec in records {
        sd.send(rec).await?;
    }
    sd.signal(Signal::EndOfData).await?;
    Ok(())
}

async fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
