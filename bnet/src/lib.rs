//! Record channel and stream grammar shared by the file daemon and its peers.
//!
//! A record is a 4-byte big-endian signed length followed by that many
//! payload bytes. A length of zero or below carries no payload: zero is a
//! soft end-of-file and negative values are out-of-band [`Signal`]s.
//!
//! On top of the records sits the stream grammar: a text header naming the
//! file index and stream type, one or more data records, then an EOD signal.

pub mod attribs;
pub mod base64;
pub mod bget;
pub mod channel;
pub mod error;
pub mod replay;
pub mod signal;
pub mod stream;

pub use attribs::{decode_stat, encode_stat, AttributesRecord, Stat};
pub use bget::bget_msg;
pub use channel::{Channel, ChannelReader, ChannelWriter, Frame, SocketState, WaitStatus};
pub use error::{ChannelError, ProtocolError};
pub use signal::Signal;
pub use stream::{FileType, RecordHeader, StreamHeader, StreamOrder, StreamType};
