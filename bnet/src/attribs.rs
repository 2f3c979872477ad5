//! Attribute records: packed stat fields plus the NUL-separated record layout.

use crate::base64::{from_base64, to_base64};
use crate::error::ProtocolError;

/// The portable subset of `struct stat` carried in an attributes stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: i64,
    pub blksize: i64,
    pub blocks: i64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

/// File type bits from `st_mode`.
pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFIFO: u32 = 0o010000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFSOCK: u32 = 0o140000;

impl Stat {
    pub fn file_kind(&self) -> u32 {
        self.mode & S_IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.file_kind() == S_IFDIR
    }

    pub fn is_reg(&self) -> bool {
        self.file_kind() == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.file_kind() == S_IFLNK
    }

    pub fn is_fifo(&self) -> bool {
        self.file_kind() == S_IFIFO
    }

    /// Character or block device.
    pub fn is_device(&self) -> bool {
        matches!(self.file_kind(), S_IFCHR | S_IFBLK)
    }

    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// Pack a stat into 13 space-separated fields, plus `LinkFI` when the file
/// is a hard link to an earlier file index.
pub fn encode_stat(st: &Stat, link_fi: Option<i32>) -> String {
    let fields: [i64; 13] = [
        st.dev as i64,
        st.ino as i64,
        st.mode as i64,
        st.nlink as i64,
        st.uid as i64,
        st.gid as i64,
        st.rdev as i64,
        st.size,
        st.blksize,
        st.blocks,
        st.atime,
        st.mtime,
        st.ctime,
    ];
    let mut out = String::with_capacity(13 * 6);
    for (i, value) in fields.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        to_base64(*value, &mut out);
    }
    if let Some(fi) = link_fi {
        out.push(' ');
        to_base64(fi as i64, &mut out);
    }
    out
}

/// Inverse of [`encode_stat`]. Returns the stat and the optional `LinkFI`.
pub fn decode_stat(text: &str) -> Result<(Stat, Option<i32>), ProtocolError> {
    let mut values = Vec::with_capacity(14);
    for field in text.split(' ') {
        let v = from_base64(field).ok_or_else(|| ProtocolError::BadStat(text.to_string()))?;
        values.push(v);
    }
    if values.len() < 13 {
        return Err(ProtocolError::BadStat(text.to_string()));
    }
    let st = Stat {
        dev: values[0] as u64,
        ino: values[1] as u64,
        mode: values[2] as u32,
        nlink: values[3] as u64,
        uid: values[4] as u32,
        gid: values[5] as u32,
        rdev: values[6] as u64,
        size: values[7],
        blksize: values[8],
        blocks: values[9],
        atime: values[10],
        mtime: values[11],
        ctime: values[12],
    };
    let link_fi = values.get(13).map(|v| *v as i32);
    Ok((st, link_fi))
}

/// One attributes-stream payload.
///
/// Wire layout: `"<fi> <type> <fname>\0<stat>\0<link>\0<attribs_ex>\0<data_stream>\0"`.
/// Names are kept as raw bytes so non-UTF-8 paths survive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributesRecord {
    pub file_index: i32,
    pub file_type: i32,
    pub fname: Vec<u8>,
    /// Packed stat (see [`encode_stat`]).
    pub attribs: String,
    pub link: Vec<u8>,
    pub attribs_ex: String,
    /// Data stream the file's content will be sent with, 0 when none.
    pub data_stream: i32,
}

impl AttributesRecord {
    pub fn encode(&self) -> Vec<u8> {
        let head = format!("{} {} ", self.file_index, self.file_type);
        let tail = format!("{}\0", self.data_stream);
        let mut out = Vec::with_capacity(
            head.len()
                + self.fname.len()
                + self.attribs.len()
                + self.link.len()
                + self.attribs_ex.len()
                + tail.len()
                + 4,
        );
        out.extend_from_slice(head.as_bytes());
        out.extend_from_slice(&self.fname);
        out.push(0);
        out.extend_from_slice(self.attribs.as_bytes());
        out.push(0);
        out.extend_from_slice(&self.link);
        out.push(0);
        out.extend_from_slice(self.attribs_ex.as_bytes());
        out.push(0);
        out.extend_from_slice(tail.as_bytes());
        out
    }

    /// Parse a record. The trailing extended-attributes and data-stream
    /// fields are optional for records written by older peers.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let scan_err = || ProtocolError::AttributesScan(String::from_utf8_lossy(buf).into_owned());

        let (fi_text, rest) = split_once(buf, b' ').ok_or_else(scan_err)?;
        let (type_text, rest) = split_once(rest, b' ').ok_or_else(scan_err)?;
        let file_index = parse_int(fi_text).ok_or_else(scan_err)?;
        let file_type = parse_int(type_text).ok_or_else(scan_err)?;

        let mut fields = rest.split(|b| *b == 0);
        let fname = fields.next().ok_or_else(scan_err)?.to_vec();
        let attribs = fields
            .next()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .ok_or_else(scan_err)?;
        let link = fields.next().unwrap_or_default().to_vec();
        let attribs_ex = fields
            .next()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .unwrap_or_default();
        let data_stream = match fields.next() {
            Some(f) if !f.is_empty() => parse_int(f).ok_or_else(scan_err)?,
            _ => 0,
        };

        Ok(Self {
            file_index,
            file_type,
            fname,
            attribs,
            link,
            attribs_ex,
            data_stream,
        })
    }

    pub fn fname_lossy(&self) -> String {
        String::from_utf8_lossy(&self.fname).into_owned()
    }

    pub fn link_lossy(&self) -> String {
        String::from_utf8_lossy(&self.link).into_owned()
    }

    pub fn stat(&self) -> Result<(Stat, Option<i32>), ProtocolError> {
        decode_stat(&self.attribs)
    }
}

fn split_once(buf: &[u8], sep: u8) -> Option<(&[u8], &[u8])> {
    let pos = buf.iter().position(|b| *b == sep)?;
    Some((&buf[..pos], &buf[pos + 1..]))
}

fn parse_int(field: &[u8]) -> Option<i32> {
    std::str::from_utf8(field).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stat() -> Stat {
        Stat {
            dev: 2049,
            ino: 1_234_567,
            mode: S_IFREG | 0o644,
            nlink: 1,
            uid: 1000,
            gid: 100,
            rdev: 0,
            size: 10_485_760,
            blksize: 4096,
            blocks: 20480,
            atime: 1_700_000_000,
            mtime: 1_699_999_000,
            ctime: 1_699_999_500,
        }
    }

    #[test]
    fn test_stat_roundtrip() {
        let st = sample_stat();
        let text = encode_stat(&st, None);
        assert_eq!(text.split(' ').count(), 13);
        assert_eq!(decode_stat(&text).unwrap(), (st, None));
    }

    #[test]
    fn test_stat_roundtrip_extreme_fields() {
        let st = Stat {
            dev: u64::MAX,
            ino: u64::MAX - 7,
            mode: u32::MAX,
            nlink: 0,
            uid: u32::MAX,
            gid: 0,
            rdev: 1 << 63,
            size: i64::MAX,
            blksize: 0,
            blocks: -1,
            atime: i64::MIN,
            mtime: -86_400,
            ctime: 0,
        };
        assert_eq!(decode_stat(&encode_stat(&st, Some(42))).unwrap(), (st, Some(42)));
    }

    #[test]
    fn test_decode_stat_rejects_short_input() {
        assert!(decode_stat("A B C").is_err());
        assert!(decode_stat("").is_err());
    }

    #[test]
    fn test_attributes_record_layout() {
        let rec = AttributesRecord {
            file_index: 3,
            file_type: 4,
            fname: b"/etc/localtime".to_vec(),
            attribs: "A B".to_string(),
            link: b"/usr/share/zoneinfo/UTC".to_vec(),
            attribs_ex: String::new(),
            data_stream: 0,
        };
        let wire = rec.encode();
        assert_eq!(
            wire,
            b"3 4 /etc/localtime\0A B\0/usr/share/zoneinfo/UTC\0\00\0".to_vec()
        );
        assert_eq!(AttributesRecord::decode(&wire).unwrap(), rec);
    }

    #[test]
    fn test_attributes_record_without_trailing_fields() {
        let rec = AttributesRecord::decode(b"7 3 /tmp/a\0A B C\0").unwrap();
        assert_eq!(rec.file_index, 7);
        assert_eq!(rec.file_type, 3);
        assert_eq!(rec.fname, b"/tmp/a");
        assert!(rec.link.is_empty());
        assert_eq!(rec.data_stream, 0);
    }

    #[test]
    fn test_attributes_record_scan_errors() {
        assert!(AttributesRecord::decode(b"garbage").is_err());
        assert!(AttributesRecord::decode(b"x 3 /tmp/a\0A\0").is_err());
        assert!(AttributesRecord::decode(b"1 3 /tmp/a").is_err());
    }
}
