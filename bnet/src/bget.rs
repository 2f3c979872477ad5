//! Signal-aware receive loop.
//!
//! Engines that expect application data call [`bget_msg`] instead of
//! [`Channel::recv`]. Keep-alives, polls and status requests are answered
//! here and never reach the caller.

use crate::channel::{Channel, Frame};
use crate::error::ChannelError;
use crate::signal::{Signal, OK_MSG, STATUS_MSG, TERM_MSG};
use tracing::{debug, warn};

/// Receive the next data record or stream-ending signal.
///
/// Returns `Frame::Data` for data, or one of `EndOfData`, `EodPoll` and
/// `Terminate`. Everything else is consumed in the loop.
pub async fn bget_msg(ch: &mut Channel) -> Result<Frame, ChannelError> {
    loop {
        let frame = ch.recv().await?;
        let sig = match frame {
            Frame::Data(_) => return Ok(frame),
            Frame::Signal(sig) => sig,
        };
        match sig {
            Signal::EndOfData => return Ok(frame),
            Signal::EodPoll => {
                reply_poll(ch).await?;
                return Ok(frame);
            }
            Signal::Terminate => {
                ch.state().set_terminated();
                return Ok(frame);
            }
            Signal::Poll => reply_poll(ch).await?,
            Signal::Heartbeat | Signal::HbResponse => {
                debug!("{}: got {}", ch.state().who(), sig);
            }
            Signal::Status => {
                ch.send(STATUS_MSG.as_bytes()).await?;
                ch.signal(Signal::EndOfData).await?;
            }
            other => {
                warn!("{}: unknown signal {} ignored", ch.state().who(), other);
            }
        }
    }
}

async fn reply_poll(ch: &mut Channel) -> Result<(), ChannelError> {
    let reply = if ch.state().is_terminated() {
        TERM_MSG
    } else {
        OK_MSG
    };
    ch.send(reply.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn pair() -> (Channel, Channel) {
        let (a, b) = duplex(64 * 1024);
        (
            Channel::from_stream("director", "localhost", 9101, a),
            Channel::from_stream("client", "localhost", 9102, b),
        )
    }

    #[tokio::test]
    async fn test_heartbeats_are_swallowed() -> anyhow::Result<()> {
        let (mut peer, mut ch) = pair();
        peer.signal(Signal::Heartbeat).await?;
        peer.signal(Signal::HbResponse).await?;
        peer.send(b"payload").await?;
        assert_eq!(bget_msg(&mut ch).await?, Frame::Data(7));
        assert_eq!(ch.msg(), b"payload");
        Ok(())
    }

    #[tokio::test]
    async fn test_eod_returns() -> anyhow::Result<()> {
        let (mut peer, mut ch) = pair();
        peer.signal(Signal::EndOfData).await?;
        assert_eq!(
            bget_msg(&mut ch).await?,
            Frame::Signal(Signal::EndOfData)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_poll_is_answered_and_loop_continues() -> anyhow::Result<()> {
        let (mut peer, mut ch) = pair();
        peer.signal(Signal::Poll).await?;
        peer.send(b"next").await?;
        assert_eq!(bget_msg(&mut ch).await?, Frame::Data(4));
        assert_eq!(peer.recv().await?, Frame::Data(OK_MSG.len()));
        assert_eq!(peer.msg(), OK_MSG.as_bytes());
        Ok(())
    }

    #[tokio::test]
    async fn test_eod_poll_answers_then_returns() -> anyhow::Result<()> {
        let (mut peer, mut ch) = pair();
        peer.signal(Signal::EodPoll).await?;
        assert_eq!(bget_msg(&mut ch).await?, Frame::Signal(Signal::EodPoll));
        peer.recv().await?;
        assert_eq!(peer.msg_str(), "2000 OK\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_eod_poll_after_terminate_replies_terminate() -> anyhow::Result<()> {
        let (mut peer, mut ch) = pair();
        ch.state().set_terminated();
        // Reading is refused once terminated, so answer the poll directly.
        reply_poll(&mut ch).await?;
        peer.recv().await?;
        assert_eq!(peer.msg_str(), "2999 Terminate\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_terminate_marks_channel() -> anyhow::Result<()> {
        let (mut peer, mut ch) = pair();
        peer.signal(Signal::Terminate).await?;
        assert_eq!(
            bget_msg(&mut ch).await?,
            Frame::Signal(Signal::Terminate)
        );
        assert!(ch.state().is_terminated());
        Ok(())
    }

    #[tokio::test]
    async fn test_status_request() -> anyhow::Result<()> {
        let (mut peer, mut ch) = pair();
        peer.signal(Signal::Status).await?;
        peer.signal(Signal::EndOfData).await?;
        assert_eq!(
            bget_msg(&mut ch).await?,
            Frame::Signal(Signal::EndOfData)
        );
        peer.recv().await?;
        assert_eq!(peer.msg_str(), "Status OK\n");
        assert_eq!(peer.recv().await?, Frame::Signal(Signal::EndOfData));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_signal_is_skipped() -> anyhow::Result<()> {
        let (mut peer, mut ch) = pair();
        peer.signal(Signal::Unknown(-77)).await?;
        peer.signal(Signal::Btime).await?;
        peer.send(b"x").await?;
        assert_eq!(bget_msg(&mut ch).await?, Frame::Data(1));
        Ok(())
    }

    #[tokio::test]
    async fn test_hard_eof_propagates() -> anyhow::Result<()> {
        let (peer, mut ch) = pair();
        drop(peer);
        assert!(matches!(
            bget_msg(&mut ch).await,
            Err(ChannelError::HardEof)
        ));
        Ok(())
    }
}
