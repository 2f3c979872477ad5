//! Length-prefixed record channel over a byte stream.
//!
//! A [`Channel`] owns both directions of one connection. It can be split into
//! a [`ChannelReader`] and a [`ChannelWriter`] that keep sharing one
//! [`SocketState`], so a fault seen by either half stops both. The heartbeat
//! monitor borrows a reader this way while the job keeps writing.

use crate::error::ChannelError;
use crate::signal::Signal;
use bytes::{BufMut, BytesMut};
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Largest record payload accepted in either direction.
pub const MAX_PACKET_SIZE: usize = 10_000_000;

/// Default read size for file data and the initial receive buffer size.
pub const MAX_NETWORK_BUFFER_SIZE: usize = 64 * 1024;

/// Default watchdog for a single blocking read or write.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Result of one successful [`ChannelReader::recv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// A data record of this many bytes. Zero is a soft end-of-file.
    Data(usize),
    /// A negative length, decoded.
    Signal(Signal),
}

impl Frame {
    pub fn is_signal(&self, sig: Signal) -> bool {
        matches!(self, Frame::Signal(s) if *s == sig)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Data(n) => write!(f, "{} data bytes", n),
            Frame::Signal(sig) => write!(f, "signal {}", sig),
        }
    }
}

/// Outcome of [`ChannelReader::wait_data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Input is buffered and a `recv` will not block on the first byte.
    Ready,
    Timeout,
    /// The peer closed the connection.
    Eof,
}

/// State shared by every handle onto one connection.
#[derive(Debug)]
pub struct SocketState {
    who: String,
    host: String,
    port: u16,
    terminated: AtomicBool,
    timed_out: AtomicBool,
    errors: AtomicU32,
    suppress_error_msgs: AtomicBool,
}

impl SocketState {
    pub fn new(who: &str, host: &str, port: u16) -> Self {
        Self {
            who: who.to_string(),
            host: host.to_string(),
            port,
            terminated: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            errors: AtomicU32::new(0),
            suppress_error_msgs: AtomicBool::new(false),
        }
    }

    pub fn who(&self) -> &str {
        &self.who
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub fn set_terminated(&self) {
        self.terminated.store(true, Ordering::Release);
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    pub fn set_timed_out(&self) {
        self.timed_out.store(true, Ordering::Release);
    }

    pub fn error_count(&self) -> u32 {
        self.errors.load(Ordering::Acquire)
    }

    pub fn is_error(&self) -> bool {
        self.error_count() > 0
    }

    /// True once the channel failed or was told to terminate.
    pub fn is_stop(&self) -> bool {
        self.is_error() || self.is_terminated()
    }

    pub fn suppress_error_messages(&self, flag: bool) {
        self.suppress_error_msgs.store(flag, Ordering::Release);
    }

    fn record_error(&self, err: &ChannelError) {
        self.errors.fetch_add(1, Ordering::AcqRel);
        if !self.suppress_error_msgs.load(Ordering::Acquire) {
            warn!("{} ({}:{}): {}", self.who, self.host, self.port, err);
        }
    }

    fn stopped(&self) -> ChannelError {
        ChannelError::Stopped {
            who: self.who.clone(),
        }
    }
}

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Receiving half of a channel.
pub struct ChannelReader {
    inner: BufReader<BoxedRead>,
    state: Arc<SocketState>,
    msg: BytesMut,
    msglen: i32,
    in_msg_no: u64,
    timeout: Duration,
}

impl ChannelReader {
    fn new(read: BoxedRead, state: Arc<SocketState>) -> Self {
        Self {
            inner: BufReader::with_capacity(MAX_NETWORK_BUFFER_SIZE, read),
            state,
            msg: BytesMut::with_capacity(MAX_NETWORK_BUFFER_SIZE),
            msglen: 0,
            in_msg_no: 0,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Receive one record.
    ///
    /// Data records are left in [`msg`](Self::msg). A fault of any kind is
    /// sticky: later calls return [`ChannelError::Stopped`]. A channel that
    /// received TERMINATE refuses to read further as well.
    pub async fn recv(&mut self) -> Result<Frame, ChannelError> {
        if self.state.is_stop() {
            return Err(self.state.stopped());
        }
        self.msg.clear();
        self.msglen = 0;

        let mut prefix = [0u8; 4];
        if let Err(e) = self.read_timed(&mut prefix, true).await {
            return Err(self.fault(e));
        }
        self.in_msg_no += 1;
        let pktsiz = i32::from_be_bytes(prefix);
        self.msglen = pktsiz;

        if pktsiz <= 0 {
            if pktsiz == 0 {
                return Ok(Frame::Data(0));
            }
            return Ok(Frame::Signal(Signal::from_code(pktsiz)));
        }

        let len = pktsiz as usize;
        if len > MAX_PACKET_SIZE {
            // The stream is out of sync after a bogus length.
            self.state.set_terminated();
            return Err(self.fault(ChannelError::PacketTooBig {
                size: len,
                max: MAX_PACKET_SIZE,
            }));
        }

        self.msg.resize(len, 0);
        let mut payload = std::mem::take(&mut self.msg);
        let res = self.read_timed(&mut payload[..], false).await;
        self.msg = payload;
        if let Err(e) = res {
            self.msg.clear();
            return Err(self.fault(e));
        }
        Ok(Frame::Data(len))
    }

    /// Wait up to `dur` for input without consuming it.
    pub async fn wait_data(&mut self, dur: Duration) -> Result<WaitStatus, ChannelError> {
        if self.state.is_stop() {
            return Err(self.state.stopped());
        }
        let polled = match tokio::time::timeout(dur, self.inner.fill_buf()).await {
            Err(_) => return Ok(WaitStatus::Timeout),
            Ok(Ok(buf)) => Ok(buf.is_empty()),
            Ok(Err(e)) => Err(e),
        };
        match polled {
            Ok(true) => Ok(WaitStatus::Eof),
            Ok(false) => Ok(WaitStatus::Ready),
            Err(e) => Err(self.fault(ChannelError::Io(e))),
        }
    }

    /// Payload of the last data record.
    pub fn msg(&self) -> &[u8] {
        &self.msg
    }

    /// Payload of the last data record as text, with any trailing NUL dropped.
    pub fn msg_str(&self) -> Cow<'_, str> {
        let end = self
            .msg
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.msg.len());
        String::from_utf8_lossy(&self.msg[..end])
    }

    /// Raw length field of the last record (negative for signals).
    pub fn msglen(&self) -> i32 {
        self.msglen
    }

    pub fn in_msg_no(&self) -> u64 {
        self.in_msg_no
    }

    pub fn state(&self) -> &Arc<SocketState> {
        &self.state
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn read_timed(&mut self, buf: &mut [u8], at_prefix: bool) -> Result<(), ChannelError> {
        let secs = self.timeout.as_secs();
        let wanted = buf.len();
        match tokio::time::timeout(self.timeout, self.inner.read_exact(buf)).await {
            Err(_) => {
                self.state.set_timed_out();
                Err(ChannelError::TimedOut { op: "read", secs })
            }
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                if at_prefix {
                    Err(ChannelError::HardEof)
                } else {
                    Err(ChannelError::ShortRead { wanted })
                }
            }
            Ok(Err(e)) => Err(ChannelError::Io(e)),
        }
    }

    fn fault(&self, err: ChannelError) -> ChannelError {
        match err {
            // A clean close is reported to the caller but not logged as an error.
            ChannelError::HardEof => {
                self.state.errors.fetch_add(1, Ordering::AcqRel);
                debug!("{}: connection closed by peer", self.state.who());
            }
            _ => self.state.record_error(&err),
        }
        err
    }
}

/// Sending half of a channel.
pub struct ChannelWriter {
    inner: BoxedWrite,
    state: Arc<SocketState>,
    frame: BytesMut,
    out_msg_no: u64,
    timeout: Duration,
}

impl ChannelWriter {
    fn new(write: BoxedWrite, state: Arc<SocketState>) -> Self {
        Self {
            inner: write,
            state,
            frame: BytesMut::with_capacity(MAX_NETWORK_BUFFER_SIZE + 4),
            out_msg_no: 0,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Send one data record. The frame buffer grows to fit `data`.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        if self.state.is_error() {
            return Err(self.state.stopped());
        }
        if data.len() > MAX_PACKET_SIZE {
            let err = ChannelError::PacketTooBig {
                size: data.len(),
                max: MAX_PACKET_SIZE,
            };
            self.state.record_error(&err);
            return Err(err);
        }
        self.frame.clear();
        self.frame.reserve(4 + data.len());
        self.frame.put_i32(data.len() as i32);
        self.frame.extend_from_slice(data);
        self.write_frame().await
    }

    /// Send a signal (a bare negative length).
    pub async fn signal(&mut self, sig: Signal) -> Result<(), ChannelError> {
        if self.state.is_error() {
            return Err(self.state.stopped());
        }
        self.frame.clear();
        self.frame.put_i32(sig.code());
        self.write_frame().await
    }

    /// Format and send a text record.
    pub fn fsend(
        &mut self,
        args: fmt::Arguments<'_>,
    ) -> impl std::future::Future<Output = Result<(), ChannelError>> + Send + '_ {
        let text = fmt::format(args);
        async move { self.send(text.as_bytes()).await }
    }

    pub fn out_msg_no(&self) -> u64 {
        self.out_msg_no
    }

    /// Capacity of the outgoing frame buffer.
    pub fn buffer_capacity(&self) -> usize {
        self.frame.capacity()
    }

    pub fn state(&self) -> &Arc<SocketState> {
        &self.state
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Shut down the write direction.
    pub async fn close(&mut self) -> Result<(), ChannelError> {
        self.inner.shutdown().await?;
        Ok(())
    }

    async fn write_frame(&mut self) -> Result<(), ChannelError> {
        let secs = self.timeout.as_secs();
        let inner = &mut self.inner;
        let frame = &self.frame;
        let res = tokio::time::timeout(self.timeout, async {
            inner.write_all(frame).await?;
            inner.flush().await
        })
        .await;
        let err = match res {
            Ok(Ok(())) => {
                self.out_msg_no += 1;
                return Ok(());
            }
            Ok(Err(e)) => ChannelError::Io(e),
            Err(_) => {
                self.state.set_timed_out();
                ChannelError::TimedOut { op: "write", secs }
            }
        };
        self.state.record_error(&err);
        Err(err)
    }
}

/// Both halves of one connection.
pub struct Channel {
    reader: ChannelReader,
    writer: ChannelWriter,
}

impl Channel {
    /// Wrap any duplex byte stream.
    pub fn from_stream<S>(who: &str, host: &str, port: u16, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        Self::from_halves(who, host, port, read, write)
    }

    pub fn from_halves<R, W>(who: &str, host: &str, port: u16, read: R, write: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let state = Arc::new(SocketState::new(who, host, port));
        Self {
            reader: ChannelReader::new(Box::new(read), state.clone()),
            writer: ChannelWriter::new(Box::new(write), state),
        }
    }

    /// Open a TCP connection to a peer daemon.
    pub async fn connect(who: &str, host: &str, port: u16) -> Result<Self, ChannelError> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        debug!("Connected to {} at {}:{}", who, host, port);
        Ok(Self::from_halves(who, host, port, read, write))
    }

    /// Split into halves that share this channel's state.
    pub fn into_parts(self) -> (ChannelReader, ChannelWriter) {
        (self.reader, self.writer)
    }

    pub fn from_parts(reader: ChannelReader, writer: ChannelWriter) -> Self {
        Self { reader, writer }
    }

    pub fn reader(&mut self) -> &mut ChannelReader {
        &mut self.reader
    }

    pub fn writer(&mut self) -> &mut ChannelWriter {
        &mut self.writer
    }

    pub async fn recv(&mut self) -> Result<Frame, ChannelError> {
        self.reader.recv().await
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        self.writer.send(data).await
    }

    pub async fn signal(&mut self, sig: Signal) -> Result<(), ChannelError> {
        self.writer.signal(sig).await
    }

    pub fn fsend(
        &mut self,
        args: fmt::Arguments<'_>,
    ) -> impl std::future::Future<Output = Result<(), ChannelError>> + Send + '_ {
        self.writer.fsend(args)
    }

    pub fn msg(&self) -> &[u8] {
        self.reader.msg()
    }

    pub fn msg_str(&self) -> Cow<'_, str> {
        self.reader.msg_str()
    }

    pub fn state(&self) -> &Arc<SocketState> {
        self.reader.state()
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.reader.set_timeout(timeout);
        self.writer.set_timeout(timeout);
    }

    pub async fn close(&mut self) -> Result<(), ChannelError> {
        self.writer.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn pair() -> (Channel, Channel) {
        let (a, b) = duplex(1 << 20);
        (
            Channel::from_stream("client", "localhost", 9102, a),
            Channel::from_stream("server", "localhost", 9103, b),
        )
    }

    #[tokio::test]
    async fn test_send_recv_data() -> anyhow::Result<()> {
        let (mut a, mut b) = pair();
        a.send(b"hello world").await?;
        assert_eq!(b.recv().await?, Frame::Data(11));
        assert_eq!(b.msg(), b"hello world");
        assert_eq!(b.reader().msglen(), 11);
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_length_is_soft_eof() -> anyhow::Result<()> {
        let (mut a, mut b) = pair();
        a.send(b"").await?;
        assert_eq!(b.recv().await?, Frame::Data(0));
        assert!(!b.state().is_stop());
        Ok(())
    }

    #[tokio::test]
    async fn test_signal_roundtrip() -> anyhow::Result<()> {
        let (mut a, mut b) = pair();
        a.signal(Signal::EndOfData).await?;
        a.signal(Signal::Unknown(-42)).await?;
        assert_eq!(b.recv().await?, Frame::Signal(Signal::EndOfData));
        assert_eq!(b.reader().msglen(), -1);
        assert_eq!(b.recv().await?, Frame::Signal(Signal::Unknown(-42)));
        Ok(())
    }

    #[tokio::test]
    async fn test_wire_layout() -> anyhow::Result<()> {
        let (a, mut raw) = duplex(1024);
        let mut ch = Channel::from_stream("client", "localhost", 0, a);
        ch.send(b"abc").await?;
        ch.signal(Signal::Heartbeat).await?;
        let mut buf = [0u8; 11];
        raw.read_exact(&mut buf).await?;
        assert_eq!(&buf[..7], &[0, 0, 0, 3, b'a', b'b', b'c']);
        assert_eq!(&buf[7..], &(-6i32).to_be_bytes());
        Ok(())
    }

    #[tokio::test]
    async fn test_send_grows_buffer() -> anyhow::Result<()> {
        let (mut a, mut b) = pair();
        let before = a.writer().buffer_capacity();
        let big = vec![0x5au8; before * 3];
        let reader = tokio::spawn(async move {
            let frame = b.recv().await?;
            anyhow::Ok((frame, b.msg().to_vec()))
        });
        a.send(&big).await?;
        assert!(a.writer().buffer_capacity() >= big.len() + 4);
        let (frame, got) = reader.await??;
        assert_eq!(frame, Frame::Data(big.len()));
        assert_eq!(got, big);
        Ok(())
    }

    #[tokio::test]
    async fn test_oversized_prefix_is_sticky_fault() -> anyhow::Result<()> {
        let (a, mut raw) = duplex(1024);
        let mut ch = Channel::from_stream("client", "localhost", 0, a);
        raw.write_all(&20_000_000i32.to_be_bytes()).await?;
        let err = ch.recv().await.unwrap_err();
        assert!(matches!(err, ChannelError::PacketTooBig { .. }));
        assert!(ch.state().is_error());
        assert!(ch.state().is_terminated());

        // Valid data afterwards is refused.
        raw.write_all(&1i32.to_be_bytes()).await?;
        raw.write_all(b"x").await?;
        assert!(matches!(ch.recv().await, Err(ChannelError::Stopped { .. })));
        assert!(matches!(ch.send(b"x").await, Err(ChannelError::Stopped { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_hard_eof_vs_short_read() -> anyhow::Result<()> {
        let (a, raw) = duplex(1024);
        let mut ch = Channel::from_stream("client", "localhost", 0, a);
        drop(raw);
        assert!(matches!(ch.recv().await, Err(ChannelError::HardEof)));

        let (a, mut raw) = duplex(1024);
        let mut ch = Channel::from_stream("client", "localhost", 0, a);
        raw.write_all(&10i32.to_be_bytes()).await?;
        raw.write_all(b"abc").await?;
        drop(raw);
        assert!(matches!(
            ch.recv().await,
            Err(ChannelError::ShortRead { wanted: 10 })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_read_timeout() -> anyhow::Result<()> {
        let (a, _raw) = duplex(1024);
        let mut ch = Channel::from_stream("client", "localhost", 0, a);
        ch.set_timeout(Duration::from_millis(20));
        let err = ch.recv().await.unwrap_err();
        assert!(err.is_timeout());
        assert!(ch.state().is_timed_out());
        Ok(())
    }

    #[tokio::test]
    async fn test_wait_data() -> anyhow::Result<()> {
        let (mut a, b) = pair();
        let (mut reader, _writer) = b.into_parts();
        assert_eq!(
            reader.wait_data(Duration::from_millis(10)).await?,
            WaitStatus::Timeout
        );
        a.signal(Signal::Heartbeat).await?;
        assert_eq!(
            reader.wait_data(Duration::from_secs(5)).await?,
            WaitStatus::Ready
        );
        // Waiting does not consume the record.
        assert_eq!(reader.recv().await?, Frame::Signal(Signal::Heartbeat));
        Ok(())
    }

    #[tokio::test]
    async fn test_split_halves_share_state() -> anyhow::Result<()> {
        let (a, _b) = pair();
        let (reader, writer) = a.into_parts();
        reader.state().set_terminated();
        assert!(writer.state().is_terminated());
        let ch = Channel::from_parts(reader, writer);
        assert!(ch.state().is_stop());
        Ok(())
    }

    #[tokio::test]
    async fn test_fsend_and_msg_str() -> anyhow::Result<()> {
        let (mut a, mut b) = pair();
        a.fsend(format_args!("append data {}\n", 7)).await?;
        b.recv().await?;
        assert_eq!(b.msg_str(), "append data 7\n");
        Ok(())
    }
}
