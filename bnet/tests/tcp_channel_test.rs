//! Record channel over a real TCP connection.

use bnet::{bget_msg, Channel, Frame, Signal};
use tokio::net::TcpListener;

#[tokio::test]
async fn test_connect_and_exchange_records() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let server = tokio::spawn(async move {
        let (stream, peer) = listener.accept().await?;
        let mut ch = Channel::from_stream("file daemon", &peer.ip().to_string(), peer.port(), stream);
        let frame = bget_msg(&mut ch).await?;
        let text = ch.msg_str().into_owned();
        ch.fsend(format_args!("3000 OK open ticket = {}\n", 17)).await?;
        let end = bget_msg(&mut ch).await?;
        anyhow::Ok((frame, text, end))
    });

    let mut ch = Channel::connect("storage daemon", "127.0.0.1", port).await?;
    ch.signal(Signal::Heartbeat).await?;
    ch.fsend(format_args!("append open session\n")).await?;
    assert_eq!(bget_msg(&mut ch).await?, Frame::Data(25));
    assert_eq!(ch.msg_str(), "3000 OK open ticket = 17\n");
    ch.signal(Signal::EndOfData).await?;

    let (frame, text, end) = server.await??;
    assert_eq!(frame, Frame::Data(20));
    assert_eq!(text, "append open session\n");
    assert_eq!(end, Frame::Signal(Signal::EndOfData));
    Ok(())
}

#[tokio::test]
async fn test_peer_close_is_hard_eof() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        drop(stream);
        anyhow::Ok(())
    });

    let mut ch = Channel::connect("storage daemon", "127.0.0.1", port).await?;
    server.await??;
    assert!(ch.recv().await.is_err());
    assert!(ch.state().is_error());
    Ok(())
}
