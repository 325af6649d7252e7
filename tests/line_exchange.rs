//! End-to-end line exchange between an inbox listener and a dialling peer.

use peerline::transport::{ConnectionOptions, ConnectionState, Inbound, InboxListener, PeerConnection};
use peerline::Result;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

async fn next_item(conn: &PeerConnection) -> Inbound {
    timeout(Duration::from_secs(3), conn.recv())
        .await
        .expect("inbound item within timeout")
        .expect("queue open")
}

async fn next_content(conn: &PeerConnection) -> String {
    loop {
        if let Inbound::Content(text) = next_item(conn).await {
            return text;
        }
    }
}

/// An inbox on an ephemeral port plus a channel yielding adopted connections
async fn start_inbox(options: ConnectionOptions) -> (InboxListener, u16, mpsc::UnboundedReceiver<PeerConnection>) {
    let (adopted_tx, adopted_rx) = mpsc::unbounded_channel();
    let inbox = InboxListener::new(move |stream: TcpStream, addr: SocketAddr| -> Result<()> {
        let connection = PeerConnection::new(options.clone());
        let adopted_tx = adopted_tx.clone();
        tokio::spawn(async move {
            connection.adopt(stream, addr).await;
            let _ = adopted_tx.send(connection);
        });
        Ok(())
    });
    let port = inbox.start("127.0.0.1", 0).await.unwrap();
    (inbox, port, adopted_rx)
}

#[tokio::test]
async fn two_parties_exchange_lines_and_observe_disconnect() {
    let options = ConnectionOptions::default();
    let recv_timeout = options.recv_timeout;
    let (inbox, port, mut adopted) = start_inbox(options.clone()).await;

    let client = PeerConnection::new(options);
    assert!(client.connect("127.0.0.1", port).await);
    assert_eq!(next_item(&client).await, Inbound::System(format!("Connected to 127.0.0.1:{port}")));

    let server = timeout(Duration::from_secs(3), adopted.recv()).await.unwrap().unwrap();
    match next_item(&server).await {
        Inbound::System(text) => assert!(text.starts_with("Incoming connection from 127.0.0.1:")),
        other => panic!("unexpected item {other:?}"),
    }

    client.send("hello").await;
    assert_eq!(next_content(&server).await, "hello");
    server.send("world").await;
    assert_eq!(next_content(&client).await, "world");

    client.close().await;
    let closed_at = Instant::now();
    let mut saw_peer_closed = false;
    loop {
        let item = next_item(&server).await;
        saw_peer_closed |= item == Inbound::System("Peer closed the connection.".to_string());
        if item.is_disconnect() {
            break;
        }
    }
    assert!(saw_peer_closed);
    assert!(closed_at.elapsed() <= recv_timeout * 2, "disconnect took {:?}", closed_at.elapsed());
    for _ in 0..50 {
        if server.state() == ConnectionState::Closed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(server.state(), ConnectionState::Closed);

    inbox.stop().await;
}

#[tokio::test]
async fn lines_arrive_in_send_order() {
    let options = ConnectionOptions::default();
    let (inbox, port, mut adopted) = start_inbox(options.clone()).await;

    let client = PeerConnection::new(options);
    assert!(client.connect("127.0.0.1", port).await);
    let server = timeout(Duration::from_secs(3), adopted.recv()).await.unwrap().unwrap();

    for i in 0..50 {
        client.send(&format!("line {i}")).await;
    }
    for i in 0..50 {
        assert_eq!(next_content(&server).await, format!("line {i}"));
    }

    client.close().await;
    server.close().await;
    inbox.stop().await;
}

#[tokio::test]
async fn multi_line_message_is_split_into_frames() {
    let options = ConnectionOptions::default();
    let (inbox, port, mut adopted) = start_inbox(options.clone()).await;

    let client = PeerConnection::new(options);
    assert!(client.connect("127.0.0.1", port).await);
    let server = timeout(Duration::from_secs(3), adopted.recv()).await.unwrap().unwrap();

    client.send("first\nsecond").await;
    assert_eq!(next_content(&server).await, "first");
    assert_eq!(next_content(&server).await, "second");

    client.close().await;
    server.close().await;
    inbox.stop().await;
}
