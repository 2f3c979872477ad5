//! BackupRead-style stream blobs.
//!
//! A blob is a sequence of `WIN32_STREAM_ID` records: a 20-byte little-endian
//! header (id, attributes, size, name length), the stream name, then `size`
//! bytes of content. Only the main data stream is written back on this
//! platform; every other stream in the blob is skipped.

use std::io::{self, Write};

pub const STREAM_ID_HEADER_LEN: usize = 20;
pub const BACKUP_DATA: u32 = 1;

/// Header for a blob carrying `size` bytes of main data with no name.
pub fn data_stream_header(size: u64) -> [u8; STREAM_ID_HEADER_LEN] {
    let mut hdr = [0u8; STREAM_ID_HEADER_LEN];
    hdr[0..4].copy_from_slice(&BACKUP_DATA.to_le_bytes());
    hdr[8..16].copy_from_slice(&size.to_le_bytes());
    hdr
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Header,
    Name { remaining: u64, data: u64, keep: bool },
    Content { remaining: u64, keep: bool },
}

/// Incremental decomposer. Blob bytes may arrive split at any point,
/// including inside a header.
#[derive(Debug)]
pub struct Win32Decomposer {
    state: State,
    header: Vec<u8>,
}

impl Default for Win32Decomposer {
    fn default() -> Self {
        Self::new()
    }
}

impl Win32Decomposer {
    pub fn new() -> Self {
        Self {
            state: State::Header,
            header: Vec::with_capacity(STREAM_ID_HEADER_LEN),
        }
    }

    /// Feed `buf`, writing main-data bytes to `out`. Returns the number of
    /// bytes written.
    pub fn write<W: Write>(&mut self, mut buf: &[u8], out: &mut W) -> io::Result<usize> {
        let mut written = 0;
        while !buf.is_empty() {
            match self.state {
                State::Header => {
                    let take = (STREAM_ID_HEADER_LEN - self.header.len()).min(buf.len());
                    self.header.extend_from_slice(&buf[..take]);
                    buf = &buf[take..];
                    if self.header.len() == STREAM_ID_HEADER_LEN {
                        let id = u32::from_le_bytes(le_array(&self.header[0..4]));
                        let size = u64::from_le_bytes(le_array(&self.header[8..16]));
                        let name_len = u32::from_le_bytes(le_array(&self.header[16..20]));
                        self.header.clear();
                        self.state = State::Name {
                            remaining: name_len as u64,
                            data: size,
                            keep: id == BACKUP_DATA,
                        };
                        self.settle();
                    }
                }
                State::Name { remaining, data, keep } => {
                    let take = remaining.min(buf.len() as u64) as usize;
                    buf = &buf[take..];
                    self.state = State::Name {
                        remaining: remaining - take as u64,
                        data,
                        keep,
                    };
                    self.settle();
                }
                State::Content { remaining, keep } => {
                    let take = remaining.min(buf.len() as u64) as usize;
                    if keep {
                        out.write_all(&buf[..take])?;
                        written += take;
                    }
                    buf = &buf[take..];
                    self.state = State::Content {
                        remaining: remaining - take as u64,
                        keep,
                    };
                    self.settle();
                }
            }
        }
        Ok(written)
    }

    /// True when the blob ended on a record boundary.
    pub fn is_complete(&self) -> bool {
        self.state == State::Header && self.header.is_empty()
    }

    fn settle(&mut self) {
        loop {
            self.state = match self.state {
                State::Name {
                    remaining: 0,
                    data,
                    keep,
                } => State::Content {
                    remaining: data,
                    keep,
                },
                State::Content { remaining: 0, .. } => State::Header,
                _ => return,
            };
        }
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}
