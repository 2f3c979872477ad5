//! Storage-side view of a session: spool what a file daemon sends during a
//! backup and play it back with record headers for a restore or verify.

use crate::bget::bget_msg;
use crate::channel::{Channel, ChannelWriter, Frame};
use crate::error::{ChannelError, ProtocolError};
use crate::signal::Signal;
use crate::stream::{RecordHeader, StreamHeader};
use bytes::Bytes;
use tracing::debug;

/// One data record of a stream, as stored on the volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub file_index: i32,
    pub stream: i32,
    pub data: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct SessionSpool {
    pub vol_session_id: u32,
    pub vol_session_time: u32,
    records: Vec<SessionRecord>,
}

impl SessionSpool {
    pub fn new(vol_session_id: u32, vol_session_time: u32) -> Self {
        Self {
            vol_session_id,
            vol_session_time,
            records: Vec::new(),
        }
    }

    /// Read a backup session off `ch` until the EOD that stands in place of a
    /// stream header. Returns the number of streams received.
    pub async fn receive(&mut self, ch: &mut Channel) -> Result<usize, ProtocolError> {
        let mut streams = 0;
        loop {
            match bget_msg(ch).await? {
                Frame::Data(_) => {}
                Frame::Signal(Signal::EndOfData) => break,
                Frame::Signal(sig) => return Err(ProtocolError::UnexpectedSignal(sig.name())),
            }
            let hdr = StreamHeader::parse(&ch.msg_str())?;
            streams += 1;
            loop {
                match bget_msg(ch).await? {
                    Frame::Data(_) => self.records.push(SessionRecord {
                        file_index: hdr.file_index,
                        stream: hdr.stream,
                        data: Bytes::copy_from_slice(ch.msg()),
                    }),
                    Frame::Signal(Signal::EndOfData) => break,
                    Frame::Signal(sig) => {
                        return Err(ProtocolError::UnexpectedSignal(sig.name()))
                    }
                }
            }
        }
        debug!(
            "Spooled {} streams, {} records",
            streams,
            self.records.len()
        );
        Ok(streams)
    }

    pub fn push(&mut self, file_index: i32, stream: i32, data: impl Into<Bytes>) {
        self.records.push(SessionRecord {
            file_index,
            stream,
            data: data.into(),
        });
    }

    pub fn records(&self) -> &[SessionRecord] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut Vec<SessionRecord> {
        &mut self.records
    }

    /// Send every record as a `rechdr` line followed by its data, then a final EOD.
    pub async fn replay(&self, out: &mut ChannelWriter) -> Result<(), ChannelError> {
        for rec in &self.records {
            let hdr = RecordHeader {
                vol_session_id: self.vol_session_id,
                vol_session_time: self.vol_session_time,
                file_index: rec.file_index,
                stream: rec.stream,
                size: rec.data.len() as u32,
            };
            out.send(hdr.encode().as_bytes()).await?;
            out.send(&rec.data).await?;
        }
        out.signal(Signal::EndOfData).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_receive_then_replay() -> anyhow::Result<()> {
        let (a, b) = duplex(64 * 1024);
        let mut fd = Channel::from_stream("file daemon", "localhost", 9102, a);
        let mut sd = Channel::from_stream("storage daemon", "localhost", 9103, b);

        fd.send(b"1 1 0").await?;
        fd.send(b"attrs").await?;
        fd.signal(Signal::EndOfData).await?;
        fd.send(b"1 2 0").await?;
        fd.signal(Signal::Heartbeat).await?;
        fd.send(b"chunk-1").await?;
        fd.send(b"chunk-2").await?;
        fd.signal(Signal::EndOfData).await?;
        fd.signal(Signal::EndOfData).await?;

        let mut spool = SessionSpool::new(7, 1_700_000_000);
        assert_eq!(spool.receive(&mut sd).await?, 2);
        assert_eq!(spool.records().len(), 3);
        assert_eq!(spool.records()[2].data, Bytes::from_static(b"chunk-2"));

        spool.replay(sd.writer()).await?;
        fd.recv().await?;
        assert_eq!(fd.msg_str(), "rechdr 7 1700000000 1 1 5");
        fd.recv().await?;
        assert_eq!(fd.msg(), b"attrs");
        for _ in 0..4 {
            fd.recv().await?;
        }
        assert_eq!(fd.msg(), b"chunk-2");
        assert_eq!(fd.recv().await?, Frame::Signal(Signal::EndOfData));
        Ok(())
    }

    #[tokio::test]
    async fn test_bad_header_is_rejected() -> anyhow::Result<()> {
        let (a, b) = duplex(1024);
        let mut fd = Channel::from_stream("file daemon", "localhost", 9102, a);
        let mut sd = Channel::from_stream("storage daemon", "localhost", 9103, b);
        fd.send(b"not a header").await?;
        let mut spool = SessionSpool::new(1, 1);
        assert!(matches!(
            spool.receive(&mut sd).await,
            Err(ProtocolError::HeaderScan(_))
        ));
        Ok(())
    }
}
