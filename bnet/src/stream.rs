//! Stream grammar: stream and file type codes, headers, and the adjacency rule
//! for data records.

use crate::error::ProtocolError;
use std::fmt;

/// Stream type codes. Values are fixed by the on-wire and on-volume format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StreamType {
    UnixAttributes = 1,
    FileData = 2,
    Md5Digest = 3,
    GzipData = 4,
    /// Unix attributes followed by an extended (Win32) attribute field.
    UnixAttributesEx = 5,
    SparseData = 6,
    SparseGzipData = 7,
    ProgramNames = 8,
    ProgramData = 9,
    Sha1Digest = 10,
    /// BackupRead-style stream blob.
    Win32Data = 11,
    Win32GzipData = 12,
    MacosForkData = 13,
    HfsplusAttributes = 14,
    UnixAccessAcl = 15,
    UnixDefaultAcl = 16,
    Sha256Digest = 17,
    Sha512Digest = 18,
    SignedDigest = 19,
    EncryptedFileData = 20,
    EncryptedWin32Data = 21,
    EncryptedSessionData = 22,
    EncryptedFileGzipData = 23,
    EncryptedWin32GzipData = 24,
    EncryptedMacosForkData = 25,
    PluginName = 26,
    PluginData = 27,
    RestoreObject = 28,
}

const ALL_STREAMS: [StreamType; 28] = [
    StreamType::UnixAttributes,
    StreamType::FileData,
    StreamType::Md5Digest,
    StreamType::GzipData,
    StreamType::UnixAttributesEx,
    StreamType::SparseData,
    StreamType::SparseGzipData,
    StreamType::ProgramNames,
    StreamType::ProgramData,
    StreamType::Sha1Digest,
    StreamType::Win32Data,
    StreamType::Win32GzipData,
    StreamType::MacosForkData,
    StreamType::HfsplusAttributes,
    StreamType::UnixAccessAcl,
    StreamType::UnixDefaultAcl,
    StreamType::Sha256Digest,
    StreamType::Sha512Digest,
    StreamType::SignedDigest,
    StreamType::EncryptedFileData,
    StreamType::EncryptedWin32Data,
    StreamType::EncryptedSessionData,
    StreamType::EncryptedFileGzipData,
    StreamType::EncryptedWin32GzipData,
    StreamType::EncryptedMacosForkData,
    StreamType::PluginName,
    StreamType::PluginData,
    StreamType::RestoreObject,
];

impl StreamType {
    pub fn from_code(code: i32) -> Option<Self> {
        ALL_STREAMS.iter().copied().find(|s| s.code() == code)
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_attributes(self) -> bool {
        matches!(self, StreamType::UnixAttributes | StreamType::UnixAttributesEx)
    }

    /// Streams carrying a file's main content in any encoding.
    pub fn is_data_family(self) -> bool {
        matches!(
            self,
            StreamType::FileData
                | StreamType::SparseData
                | StreamType::GzipData
                | StreamType::SparseGzipData
                | StreamType::Win32Data
                | StreamType::Win32GzipData
                | StreamType::EncryptedFileData
                | StreamType::EncryptedWin32Data
                | StreamType::EncryptedFileGzipData
                | StreamType::EncryptedWin32GzipData
        )
    }

    pub fn is_fork_data(self) -> bool {
        matches!(
            self,
            StreamType::MacosForkData | StreamType::EncryptedMacosForkData
        )
    }

    pub fn is_sparse(self) -> bool {
        matches!(self, StreamType::SparseData | StreamType::SparseGzipData)
    }

    pub fn is_gzip(self) -> bool {
        matches!(
            self,
            StreamType::GzipData
                | StreamType::SparseGzipData
                | StreamType::Win32GzipData
                | StreamType::EncryptedFileGzipData
                | StreamType::EncryptedWin32GzipData
        )
    }

    pub fn is_encrypted(self) -> bool {
        matches!(
            self,
            StreamType::EncryptedFileData
                | StreamType::EncryptedWin32Data
                | StreamType::EncryptedFileGzipData
                | StreamType::EncryptedWin32GzipData
                | StreamType::EncryptedMacosForkData
        )
    }

    /// Content is a BackupRead blob that must be decomposed on restore.
    pub fn is_win32(self) -> bool {
        matches!(
            self,
            StreamType::Win32Data
                | StreamType::Win32GzipData
                | StreamType::EncryptedWin32Data
                | StreamType::EncryptedWin32GzipData
        )
    }

    /// Plain digest streams and their binary length.
    pub fn digest_len(self) -> Option<usize> {
        match self {
            StreamType::Md5Digest => Some(16),
            StreamType::Sha1Digest => Some(20),
            StreamType::Sha256Digest => Some(32),
            StreamType::Sha512Digest => Some(64),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StreamType::UnixAttributes => "UNIX-ATTR",
            StreamType::FileData => "DATA",
            StreamType::Md5Digest => "MD5",
            StreamType::GzipData => "GZIP",
            StreamType::UnixAttributesEx => "UNIX-ATTR-EX",
            StreamType::SparseData => "SPARSE-DATA",
            StreamType::SparseGzipData => "SPARSE-GZIP",
            StreamType::ProgramNames => "PROG-NAMES",
            StreamType::ProgramData => "PROG-DATA",
            StreamType::Sha1Digest => "SHA1",
            StreamType::Win32Data => "WIN32-DATA",
            StreamType::Win32GzipData => "WIN32-GZIP",
            StreamType::MacosForkData => "MACOS-RSRC",
            StreamType::HfsplusAttributes => "HFSPLUS-ATTR",
            StreamType::UnixAccessAcl => "ACL-ACCESS",
            StreamType::UnixDefaultAcl => "ACL-DEFAULT",
            StreamType::Sha256Digest => "SHA256",
            StreamType::Sha512Digest => "SHA512",
            StreamType::SignedDigest => "SIGNED-DIGEST",
            StreamType::EncryptedFileData => "ENCRYPTED-FILE",
            StreamType::EncryptedWin32Data => "ENCRYPTED-WIN32-DATA",
            StreamType::EncryptedSessionData => "ENCRYPTED-SESSION-DATA",
            StreamType::EncryptedFileGzipData => "ENCRYPTED-GZIP",
            StreamType::EncryptedWin32GzipData => "ENCRYPTED-WIN32-GZIP",
            StreamType::EncryptedMacosForkData => "ENCRYPTED-MACOS-RSRC",
            StreamType::PluginName => "PLUGIN-NAME",
            StreamType::PluginData => "PLUGIN-DATA",
            StreamType::RestoreObject => "RESTORE-OBJECT",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Printable name for a raw stream code, known or not.
pub fn stream_name(code: i32) -> String {
    match StreamType::from_code(code) {
        Some(s) => s.name().to_string(),
        None => format!("unknown-{}", code),
    }
}

/// Options that decide which data stream a file is sent with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataStreamOptions {
    pub sparse: bool,
    pub gzip: bool,
    pub encrypt: bool,
    pub win32: bool,
}

/// Pick the data stream type for a file. Computed once per file and used both
/// in the attributes record and the data stream header.
pub fn select_data_stream(opts: DataStreamOptions) -> StreamType {
    // Sparse offsets cannot be recovered through the cipher or a BackupRead blob.
    let sparse = opts.sparse && !opts.encrypt && !opts.win32;
    let base = match (opts.gzip, opts.win32, sparse) {
        (true, true, _) => StreamType::Win32GzipData,
        (true, false, true) => StreamType::SparseGzipData,
        (true, false, false) => StreamType::GzipData,
        (false, true, _) => StreamType::Win32Data,
        (false, false, true) => StreamType::SparseData,
        (false, false, false) => StreamType::FileData,
    };
    if !opts.encrypt {
        return base;
    }
    match base {
        StreamType::Win32GzipData => StreamType::EncryptedWin32GzipData,
        StreamType::GzipData => StreamType::EncryptedFileGzipData,
        StreamType::Win32Data => StreamType::EncryptedWin32Data,
        _ => StreamType::EncryptedFileData,
    }
}

/// File type codes from the enumeration pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum FileType {
    /// Hard link to a file already saved in this job
    LnkSaved = 1,
    /// Regular file, empty
    RegE = 2,
    /// Regular file
    Reg = 3,
    /// Soft link
    Lnk = 4,
    /// Directory, sent after its contents
    DirEnd = 5,
    /// Special file: character or block device, socket
    Spec = 6,
    NoAccess = 7,
    NoFollow = 8,
    NoStat = 9,
    /// Unchanged since the last save
    NoChg = 10,
    DirNoChg = 11,
    /// Archive not saved
    IsArch = 12,
    NoRecurse = 13,
    NoFsChg = 14,
    NoOpen = 15,
    /// Raw block device
    Raw = 16,
    Fifo = 17,
    /// Directory, sent before its contents
    DirBegin = 18,
    InvalidFs = 19,
    InvalidDt = 20,
    Reparse = 21,
    Plugin = 22,
    Deleted = 23,
    Base = 24,
    RestoreFirst = 25,
    Junction = 26,
    PluginConfig = 27,
    PluginConfigFilled = 28,
}

const ALL_FILE_TYPES: [FileType; 28] = [
    FileType::LnkSaved,
    FileType::RegE,
    FileType::Reg,
    FileType::Lnk,
    FileType::DirEnd,
    FileType::Spec,
    FileType::NoAccess,
    FileType::NoFollow,
    FileType::NoStat,
    FileType::NoChg,
    FileType::DirNoChg,
    FileType::IsArch,
    FileType::NoRecurse,
    FileType::NoFsChg,
    FileType::NoOpen,
    FileType::Raw,
    FileType::Fifo,
    FileType::DirBegin,
    FileType::InvalidFs,
    FileType::InvalidDt,
    FileType::Reparse,
    FileType::Plugin,
    FileType::Deleted,
    FileType::Base,
    FileType::RestoreFirst,
    FileType::Junction,
    FileType::PluginConfig,
    FileType::PluginConfigFilled,
];

impl FileType {
    pub fn from_code(code: i32) -> Option<Self> {
        ALL_FILE_TYPES.iter().copied().find(|t| t.code() == code)
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    /// Attribute records of this type carry a link name.
    pub fn has_link(self) -> bool {
        matches!(
            self,
            FileType::Lnk | FileType::LnkSaved | FileType::DirEnd | FileType::DirBegin
        )
    }

    pub fn is_dir(self) -> bool {
        matches!(
            self,
            FileType::DirEnd | FileType::DirBegin | FileType::DirNoChg | FileType::Junction
        )
    }
}

/// Stream header sent by the file daemon: `"<file_index> <stream> <info>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub file_index: i32,
    pub stream: i32,
    /// Unused by the receiver.
    pub info: i64,
}

impl StreamHeader {
    pub fn new(file_index: i32, stream: StreamType) -> Self {
        Self {
            file_index,
            stream: stream.code(),
            info: 0,
        }
    }

    pub fn encode(&self) -> String {
        format!("{} {} {}", self.file_index, self.stream, self.info)
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let err = || ProtocolError::HeaderScan(text.trim_end().to_string());
        let mut fields = text.split_whitespace();
        let file_index = fields.next().and_then(|f| f.parse().ok()).ok_or_else(err)?;
        let stream = fields.next().and_then(|f| f.parse().ok()).ok_or_else(err)?;
        let info = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        Ok(Self {
            file_index,
            stream,
            info,
        })
    }
}

/// Record header sent by the storage daemon ahead of each data record on
/// restore: `"rechdr <VolSessionId> <VolSessionTime> <FileIndex> <Stream> <size>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub vol_session_id: u32,
    pub vol_session_time: u32,
    pub file_index: i32,
    pub stream: i32,
    pub size: u32,
}

impl RecordHeader {
    pub fn encode(&self) -> String {
        format!(
            "rechdr {} {} {} {} {}",
            self.vol_session_id, self.vol_session_time, self.file_index, self.stream, self.size
        )
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let err = || ProtocolError::HeaderScan(text.trim_end().to_string());
        let mut fields = text.split_whitespace();
        if fields.next() != Some("rechdr") {
            return Err(err());
        }
        let mut next = || fields.next().ok_or_else(err);
        let vol_session_id = next()?.parse().map_err(|_| err())?;
        let vol_session_time = next()?.parse().map_err(|_| err())?;
        let file_index = next()?.parse().map_err(|_| err())?;
        let stream = next()?.parse().map_err(|_| err())?;
        let size = next()?.parse().map_err(|_| err())?;
        Ok(Self {
            vol_session_id,
            vol_session_time,
            file_index,
            stream,
            size,
        })
    }
}

/// Tracks the previous stream to enforce the data-record adjacency rule.
///
/// A data-family record must directly follow, for the same file index, an
/// attributes stream, an encrypted session stream, or a record of the same
/// data stream type.
#[derive(Debug, Default, Clone)]
pub struct StreamOrder {
    prev: Option<(i32, i32)>,
}

impl StreamOrder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check `stream` for `file_index` and make it the new predecessor.
    pub fn check(&mut self, file_index: i32, stream: i32) -> Result<(), ProtocolError> {
        let prev = self.prev.replace((file_index, stream));
        let is_data = StreamType::from_code(stream).is_some_and(|s| s.is_data_family());
        if !is_data {
            return Ok(());
        }
        let allowed = match prev {
            Some((prev_fi, prev_stream)) if prev_fi == file_index => {
                prev_stream == stream
                    || StreamType::from_code(prev_stream).is_some_and(|p| {
                        p.is_attributes() || p == StreamType::EncryptedSessionData
                    })
            }
            _ => false,
        };
        if allowed {
            Ok(())
        } else {
            Err(ProtocolError::Adjacency {
                file_index,
                stream,
                previous: match prev {
                    Some((fi, s)) => format!("{} of file {}", stream_name(s), fi),
                    None => "none".to_string(),
                },
            })
        }
    }

    pub fn previous_stream(&self) -> Option<i32> {
        self.prev.map(|(_, s)| s)
    }

    pub fn reset(&mut self) {
        self.prev = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_codes_are_fixed() {
        assert_eq!(StreamType::UnixAttributes.code(), 1);
        assert_eq!(StreamType::FileData.code(), 2);
        assert_eq!(StreamType::Md5Digest.code(), 3);
        assert_eq!(StreamType::GzipData.code(), 4);
        assert_eq!(StreamType::UnixAttributesEx.code(), 5);
        assert_eq!(StreamType::SparseData.code(), 6);
        assert_eq!(StreamType::SparseGzipData.code(), 7);
        assert_eq!(StreamType::ProgramNames.code(), 8);
        assert_eq!(StreamType::ProgramData.code(), 9);
        assert_eq!(StreamType::Sha1Digest.code(), 10);
        assert_eq!(StreamType::Win32Data.code(), 11);
        assert_eq!(StreamType::Win32GzipData.code(), 12);
        assert_eq!(StreamType::EncryptedSessionData.code(), 22);
        assert_eq!(StreamType::RestoreObject.code(), 28);
        for code in 1..=28 {
            assert_eq!(StreamType::from_code(code).map(|s| s.code()), Some(code));
        }
        assert_eq!(StreamType::from_code(0), None);
        assert_eq!(StreamType::from_code(29), None);
    }

    #[test]
    fn test_file_type_codes() {
        assert_eq!(FileType::LnkSaved.code(), 1);
        assert_eq!(FileType::Reg.code(), 3);
        assert_eq!(FileType::DirEnd.code(), 5);
        assert_eq!(FileType::Fifo.code(), 17);
        for code in 1..=28 {
            assert_eq!(FileType::from_code(code).map(|t| t.code()), Some(code));
        }
    }

    #[test]
    fn test_select_data_stream() {
        let opts = |sparse, gzip, encrypt, win32| DataStreamOptions {
            sparse,
            gzip,
            encrypt,
            win32,
        };
        assert_eq!(select_data_stream(opts(false, false, false, false)), StreamType::FileData);
        assert_eq!(select_data_stream(opts(true, false, false, false)), StreamType::SparseData);
        assert_eq!(select_data_stream(opts(false, true, false, false)), StreamType::GzipData);
        assert_eq!(select_data_stream(opts(true, true, false, false)), StreamType::SparseGzipData);
        assert_eq!(select_data_stream(opts(true, false, false, true)), StreamType::Win32Data);
        assert_eq!(select_data_stream(opts(false, true, false, true)), StreamType::Win32GzipData);
        assert_eq!(
            select_data_stream(opts(true, false, true, false)),
            StreamType::EncryptedFileData
        );
        assert_eq!(
            select_data_stream(opts(true, true, true, false)),
            StreamType::EncryptedFileGzipData
        );
        assert_eq!(
            select_data_stream(opts(false, true, true, true)),
            StreamType::EncryptedWin32GzipData
        );
    }

    #[test]
    fn test_flags_agree_with_selection() {
        let s = StreamType::SparseGzipData;
        assert!(s.is_sparse() && s.is_gzip() && !s.is_encrypted() && s.is_data_family());
        let e = StreamType::EncryptedWin32GzipData;
        assert!(e.is_win32() && e.is_gzip() && e.is_encrypted() && !e.is_sparse());
        assert!(!StreamType::EncryptedSessionData.is_data_family());
        assert_eq!(StreamType::Sha512Digest.digest_len(), Some(64));
    }

    #[test]
    fn test_stream_header() {
        let hdr = StreamHeader::new(12, StreamType::GzipData);
        assert_eq!(hdr.encode(), "12 4 0");
        assert_eq!(StreamHeader::parse("12 4 0").unwrap(), hdr);
        assert_eq!(StreamHeader::parse("12 4").unwrap(), hdr);
        assert!(StreamHeader::parse("twelve 4 0").is_err());
        assert!(StreamHeader::parse("").is_err());
    }

    #[test]
    fn test_record_header() {
        let hdr = RecordHeader {
            vol_session_id: 1,
            vol_session_time: 1_700_000_000,
            file_index: 5,
            stream: 2,
            size: 65536,
        };
        let text = hdr.encode();
        assert_eq!(text, "rechdr 1 1700000000 5 2 65536");
        assert_eq!(RecordHeader::parse(&text).unwrap(), hdr);
        assert!(RecordHeader::parse("rechdr 1 2 3 4").is_err());
        assert!(RecordHeader::parse("header 1 2 3 4 5").is_err());
    }

    #[test]
    fn test_adjacency_accepts_valid_sequence() {
        let mut order = StreamOrder::new();
        order.check(1, StreamType::UnixAttributes.code()).unwrap();
        order.check(1, StreamType::FileData.code()).unwrap();
        order.check(1, StreamType::FileData.code()).unwrap();
        order.check(1, StreamType::Md5Digest.code()).unwrap();
        order.check(2, StreamType::UnixAttributes.code()).unwrap();
        order.check(2, StreamType::EncryptedSessionData.code()).unwrap();
        order.check(2, StreamType::EncryptedFileGzipData.code()).unwrap();
    }

    #[test]
    fn test_adjacency_rejects_orphan_data() {
        let mut order = StreamOrder::new();
        assert!(order.check(1, StreamType::FileData.code()).is_err());

        let mut order = StreamOrder::new();
        order.check(1, StreamType::UnixAttributes.code()).unwrap();
        assert!(order.check(2, StreamType::FileData.code()).is_err());

        let mut order = StreamOrder::new();
        order.check(1, StreamType::UnixAttributes.code()).unwrap();
        order.check(1, StreamType::FileData.code()).unwrap();
        assert!(order.check(1, StreamType::GzipData.code()).is_err());
    }
}
