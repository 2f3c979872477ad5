//! Error types for the record channel and the stream grammar.

use std::io;
use thiserror::Error;

/// Channel faults. Every variant leaves the channel in a sticky error state.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The peer closed the connection before a record started.
    #[error("connection closed by peer")]
    HardEof,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("network {op} timed out after {secs}s")]
    TimedOut { op: &'static str, secs: u64 },

    #[error("packet size {size} too big (max {max})")]
    PacketTooBig { size: usize, max: usize },

    /// The peer closed the connection in the middle of a record.
    #[error("short read: wanted {wanted} bytes, connection closed")]
    ShortRead { wanted: usize },

    /// The channel already failed or was terminated.
    #[error("channel {who} is stopped")]
    Stopped { who: String },
}

impl ChannelError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ChannelError::TimedOut { .. })
    }
}

/// Grammar violations found while decoding stream records.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("record header scan error: {0}")]
    HeaderScan(String),

    #[error("actual data size {actual} not same as header {declared}")]
    SizeMismatch { declared: usize, actual: usize },

    #[error("record header file index {header} not equal record index {record}")]
    FileIndexMismatch { header: i32, record: i32 },

    #[error("error scanning attributes: {0}")]
    AttributesScan(String),

    #[error("bad encoded stat: {0}")]
    BadStat(String),

    #[error("unexpected {stream} stream for file index {file_index} (previous stream {previous})")]
    Adjacency {
        file_index: i32,
        stream: i32,
        previous: String,
    },

    #[error("expected data record, got {0}")]
    UnexpectedSignal(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}
