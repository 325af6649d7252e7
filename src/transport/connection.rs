//! A single line-protocol connection to a peer.
//!
//! The connection owns one TCP socket, runs one background receive loop and
//! exposes everything that happens on it (lines, status changes, failures)
//! through a single FIFO inbound queue. Nothing on this type returns an error;
//! callers observe failures as [`Inbound::Error`] items.

use crate::transport::codec::LineCodec;
use crate::utils::NetworkConfig;
use socket2::SockRef;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

const READ_CHUNK: usize = 4096;

/// One item from a connection's inbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A line sent by the peer
    Content(String),
    /// Status notice (connected, incoming, disconnected)
    System(String),
    /// Failure notice (connect, send or receive errors)
    Error(String),
}

impl Inbound {
    /// Text without the kind prefix
    pub fn text(&self) -> &str {
        match self {
            Self::Content(text) | Self::System(text) | Self::Error(text) => text,
        }
    }

    /// Whether the item was sent by the peer
    pub fn is_content(&self) -> bool {
        matches!(self, Self::Content(_))
    }

    /// Whether this is the terminal notice of a receive loop
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::System(text) if text == DISCONNECTED)
    }
}

impl fmt::Display for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Content(text) => f.write_str(text),
            Self::System(text) => write!(f, "[system] {text}"),
            Self::Error(text) => write!(f, "[error] {text}"),
        }
    }
}

const DISCONNECTED: &str = "Disconnected.";

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected
    Idle,
    /// Outbound connect in progress
    Connecting,
    /// Socket attached and receive loop running
    Open,
    /// Teardown in progress
    Closing,
    /// Socket released
    Closed,
}

/// Timeouts applied to a connection
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Bound on outbound connects
    pub connect_timeout: Duration,
    /// Receive poll interval; bounds how long a stop request can go unnoticed
    pub recv_timeout: Duration,
    /// Bound on a single send
    pub write_timeout: Duration,
    /// Bound when waiting for the receive loop during `close`
    pub join_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from(&NetworkConfig::default())
    }
}

impl From<&NetworkConfig> for ConnectionOptions {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            recv_timeout: config.recv_timeout(),
            write_timeout: config.connect_timeout(),
            join_timeout: config.join_timeout(),
        }
    }
}

/// Per-socket state shared with that socket's receive loop
struct Session {
    generation: u64,
    stop: AtomicBool,
    wake: Notify,
    reader: Mutex<Option<JoinHandle<()>>>,
}

struct Slot {
    state: ConnectionState,
    generation: u64,
    peer: Option<SocketAddr>,
    session: Option<Arc<Session>>,
}

struct Inner {
    options: ConnectionOptions,
    slot: Mutex<Slot>,
    writer: tokio::sync::Mutex<Option<(u64, OwnedWriteHalf)>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, item: Inbound) {
        // The receiver lives in `self`, so this only fails during teardown.
        let _ = self.inbound_tx.send(item);
    }

    /// Tear down the current socket. With `Some(generation)` only that
    /// socket is closed, so a stale receive loop cannot close a newer one.
    /// Returns the closed session, or `None` if there was nothing to close.
    async fn shutdown_session(self: &Arc<Self>, generation: Option<u64>) -> Option<Arc<Session>> {
        let session = {
            let mut slot = self.slot();
            match &slot.session {
                Some(s) if generation.map_or(true, |g| g == s.generation) => {
                    slot.state = ConnectionState::Closing;
                    slot.session.take()
                }
                _ => return None,
            }
        }?;

        session.stop.store(true, Ordering::SeqCst);
        session.wake.notify_one();

        // A send blocked on a full socket holds the writer for up to
        // `write_timeout`; the half is released once that send gives up.
        match tokio::time::timeout(self.options.join_timeout, self.writer.lock()).await {
            Ok(mut writer) => release_writer(&mut writer, session.generation).await,
            Err(_) => {
                log::debug!("Writer busy, closing generation {} in the background", session.generation);
                let inner = self.clone();
                let generation = session.generation;
                tokio::spawn(async move {
                    release_writer(&mut *inner.writer.lock().await, generation).await;
                });
            }
        }

        let mut slot = self.slot();
        if slot.generation == session.generation {
            slot.state = ConnectionState::Closed;
            slot.peer = None;
        }
        Some(session)
    }
}

async fn release_writer(writer: &mut Option<(u64, OwnedWriteHalf)>, generation: u64) {
    if matches!(writer.as_ref(), Some((g, _)) if *g == generation) {
        if let Some((_, mut half)) = writer.take() {
            // Sends FIN; the read half is dropped when the loop exits.
            let _ = half.shutdown().await;
        }
    }
}

/// Handle to one peer connection. Clones share the same socket and queue.
///
/// Dropping handles does not close the socket; call [`PeerConnection::close`].
#[derive(Clone)]
pub struct PeerConnection {
    inner: Arc<Inner>,
}

impl Default for PeerConnection {
    fn default() -> Self {
        Self::new(ConnectionOptions::default())
    }
}

impl PeerConnection {
    /// Create an idle connection
    pub fn new(options: ConnectionOptions) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                options,
                slot: Mutex::new(Slot {
                    state: ConnectionState::Idle,
                    generation: 0,
                    peer: None,
                    session: None,
                }),
                writer: tokio::sync::Mutex::new(None),
                inbound_tx,
                inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            }),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.inner.slot().state
    }

    /// Whether a socket is attached
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Remote address of the attached socket
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.slot().peer
    }

    /// Connect to `host:port`, replacing any current socket.
    ///
    /// Failures are reported through the inbound queue; the return value
    /// only says whether a socket is now attached.
    pub async fn connect(&self, host: &str, port: u16) -> bool {
        self.close().await;
        self.inner.slot().state = ConnectionState::Connecting;

        let attempt =
            tokio::time::timeout(self.inner.options.connect_timeout, TcpStream::connect((host, port))).await;

        let failure = match attempt {
            Ok(Ok(stream)) => match stream.peer_addr() {
                Ok(peer) => {
                    let notice = format!("Connected to {host}:{port}");
                    self.attach(stream, peer, notice).await;
                    return true;
                }
                Err(e) => e.to_string(),
            },
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", self.inner.options.connect_timeout),
        };

        log::debug!("Connect to {}:{} failed: {}", host, port, failure);
        self.inner.push(Inbound::Error(format!("Could not connect: {failure}")));
        let mut slot = self.inner.slot();
        if slot.state == ConnectionState::Connecting {
            slot.state = ConnectionState::Closed;
        }
        false
    }

    /// Take over a socket accepted by the inbox listener.
    pub async fn adopt(&self, stream: TcpStream, addr: SocketAddr) {
        self.close().await;
        let notice = format!("Incoming connection from {}:{}", addr.ip(), addr.port());
        self.attach(stream, addr, notice).await;
    }

    async fn attach(&self, stream: TcpStream, peer: SocketAddr, notice: String) {
        if let Err(e) = SockRef::from(&stream).set_keepalive(true) {
            log::debug!("Could not enable keepalive for {}: {}", peer, e);
        }
        let (read_half, write_half) = stream.into_split();

        let generation = {
            let mut slot = self.inner.slot();
            slot.generation += 1;
            slot.generation
        };
        *self.inner.writer.lock().await = Some((generation, write_half));

        let session = Arc::new(Session {
            generation,
            stop: AtomicBool::new(false),
            wake: Notify::new(),
            reader: Mutex::new(None),
        });
        {
            let mut slot = self.inner.slot();
            slot.session = Some(session.clone());
            slot.state = ConnectionState::Open;
            slot.peer = Some(peer);
        }

        log::info!("{}", notice);
        self.inner.push(Inbound::System(notice));

        let handle = tokio::spawn(receive_loop(self.inner.clone(), session.clone(), read_half));
        *session.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Send one message. Never fails; problems surface as inbound errors.
    pub async fn send(&self, message: &str) {
        let open = {
            let slot = self.inner.slot();
            match (&slot.session, slot.state) {
                (Some(session), ConnectionState::Open) => Some(session.generation),
                _ => None,
            }
        };
        let Some(generation) = open else {
            self.inner.push(Inbound::Error("Not connected.".to_string()));
            return;
        };

        let frame = LineCodec::encode(message);
        let outcome = {
            let mut writer = self.inner.writer.lock().await;
            match writer.as_mut() {
                Some((g, half)) if *g == generation => {
                    match tokio::time::timeout(self.inner.options.write_timeout, half.write_all(&frame)).await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err("timed out".to_string()),
                    }
                }
                _ => Err("connection closed".to_string()),
            }
        };

        match outcome {
            Ok(()) => log::trace!("Sent {} bytes", frame.len()),
            Err(reason) => {
                log::warn!("Send failed: {}", reason);
                self.inner.push(Inbound::Error(format!("send failed: {reason}")));
                self.inner.shutdown_session(Some(generation)).await;
            }
        }
    }

    /// Drain queued inbound items without blocking, in arrival order.
    ///
    /// Returns how many items were delivered. If another task is currently
    /// awaiting [`PeerConnection::recv`], nothing is drained.
    pub fn poll_received<F: FnMut(Inbound)>(&self, mut callback: F) -> usize {
        let Ok(mut rx) = self.inner.inbound_rx.try_lock() else {
            return 0;
        };
        let mut delivered = 0;
        while let Ok(item) = rx.try_recv() {
            callback(item);
            delivered += 1;
        }
        delivered
    }

    /// Wait for the next inbound item
    pub async fn recv(&self) -> Option<Inbound> {
        self.inner.inbound_rx.lock().await.recv().await
    }

    /// Close the socket. Idempotent and safe to call from any task.
    pub async fn close(&self) {
        let Some(session) = self.inner.shutdown_session(None).await else {
            return;
        };
        let handle = session.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if tokio::time::timeout(self.inner.options.join_timeout, handle).await.is_err() {
                log::warn!("Receive loop did not stop within {:?}", self.inner.options.join_timeout);
            }
        }
    }
}

async fn receive_loop(inner: Arc<Inner>, session: Arc<Session>, mut reader: OwnedReadHalf) {
    let mut codec = LineCodec::new();
    let mut buf = vec![0u8; READ_CHUNK];

    while !session.stop.load(Ordering::SeqCst) {
        let read = tokio::select! {
            _ = session.wake.notified() => break,
            read = tokio::time::timeout(inner.options.recv_timeout, reader.read(&mut buf)) => read,
        };

        match read {
            Err(_) => continue,
            Ok(Ok(0)) => {
                inner.push(Inbound::System("Peer closed the connection.".to_string()));
                break;
            }
            Ok(Ok(n)) => {
                for line in codec.feed(&buf[..n]) {
                    log::trace!("Received line ({} bytes)", line.len());
                    inner.push(Inbound::Content(line));
                }
            }
            Ok(Err(e)) => {
                if !session.stop.load(Ordering::SeqCst) {
                    inner.push(Inbound::Error(format!("recv failed: {e}")));
                }
                break;
            }
        }
    }

    if codec.pending() > 0 {
        log::debug!("Discarding {} bytes of unterminated input", codec.pending());
    }
    inner.push(Inbound::System(DISCONNECTED.to_string()));
    inner.shutdown_session(Some(session.generation)).await;
    log::debug!("Receive loop {} finished", session.generation);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn fast_options() -> ConnectionOptions {
        ConnectionOptions {
            connect_timeout: Duration::from_secs(2),
            recv_timeout: Duration::from_millis(100),
            write_timeout: Duration::from_secs(2),
            join_timeout: Duration::from_secs(2),
        }
    }

    async fn next(conn: &PeerConnection) -> Inbound {
        tokio::time::timeout(Duration::from_secs(3), conn.recv())
            .await
            .expect("inbound item within timeout")
            .expect("queue open")
    }

    async fn next_content(conn: &PeerConnection) -> String {
        loop {
            if let Inbound::Content(text) = next(conn).await {
                return text;
            }
        }
    }

    async fn connected_pair() -> (PeerConnection, PeerConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = PeerConnection::new(fast_options());
        let server = PeerConnection::new(fast_options());
        let (accepted, connected) = tokio::join!(listener.accept(), client.connect("127.0.0.1", port));
        assert!(connected);
        let (stream, addr) = accepted.unwrap();
        server.adopt(stream, addr).await;
        (client, server)
    }

    #[test]
    fn test_inbound_display_prefixes() {
        assert_eq!(Inbound::Content("hi".into()).to_string(), "hi");
        assert_eq!(Inbound::System("Disconnected.".into()).to_string(), "[system] Disconnected.");
        assert_eq!(Inbound::Error("Not connected.".into()).to_string(), "[error] Not connected.");
        assert!(Inbound::System("Disconnected.".into()).is_disconnect());
    }

    #[tokio::test]
    async fn test_send_without_connection_enqueues_one_error() {
        let conn = PeerConnection::new(fast_options());
        conn.send("hello").await;

        let mut items = Vec::new();
        assert_eq!(conn.poll_received(|item| items.push(item)), 1);
        assert_eq!(items, vec![Inbound::Error("Not connected.".to_string())]);
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_poll_on_empty_queue_returns_immediately() {
        let conn = PeerConnection::new(fast_options());
        assert_eq!(conn.poll_received(|_| panic!("queue should be empty")), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported_inbound() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let conn = PeerConnection::new(fast_options());
        assert!(!conn.connect("127.0.0.1", port).await);

        match next(&conn).await {
            Inbound::Error(text) => assert!(text.starts_with("Could not connect:")),
            other => panic!("unexpected item {other:?}"),
        }
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_lines_flow_both_ways() {
        let (client, server) = connected_pair().await;
        assert!(matches!(next(&client).await, Inbound::System(t) if t.starts_with("Connected to")));
        assert!(matches!(next(&server).await, Inbound::System(t) if t.starts_with("Incoming connection from")));

        client.send("hello").await;
        assert_eq!(next(&server).await, Inbound::Content("hello".to_string()));

        server.send("hi").await;
        assert_eq!(next(&client).await, Inbound::Content("hi".to_string()));

        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn test_peer_close_is_observed() {
        let (client, server) = connected_pair().await;
        client.close().await;

        let mut saw_peer_closed = false;
        loop {
            let item = next(&server).await;
            if item == Inbound::System("Peer closed the connection.".to_string()) {
                saw_peer_closed = true;
            }
            if item.is_disconnect() {
                break;
            }
        }
        assert!(saw_peer_closed);
        assert_eq!(server.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, _server) = connected_pair().await;
        client.close().await;
        client.close().await;
        assert_eq!(client.state(), ConnectionState::Closed);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut disconnects = 0;
        client.poll_received(|item| {
            if item.is_disconnect() {
                disconnects += 1;
            }
        });
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn test_send_after_close_reports_not_connected() {
        let (client, _server) = connected_pair().await;
        client.close().await;
        client.poll_received(|_| {});

        client.send("late").await;
        let mut items = Vec::new();
        client.poll_received(|item| items.push(item));
        assert!(items.contains(&Inbound::Error("Not connected.".to_string())));
    }

    #[tokio::test]
    async fn test_partial_tail_is_not_delivered() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let conn = PeerConnection::new(fast_options());
        let (accepted, connected) = tokio::join!(listener.accept(), conn.connect("127.0.0.1", port));
        assert!(connected);
        let (mut raw, _) = accepted.unwrap();

        raw.write_all(b"hel").await.unwrap();
        raw.write_all(b"lo\ntail-without-newline").await.unwrap();
        drop(raw);

        assert_eq!(next_content(&conn).await, "hello");
        loop {
            let item = next(&conn).await;
            assert!(!item.is_content(), "partial tail leaked: {item:?}");
            if item.is_disconnect() {
                break;
            }
        }
    }

    /// A connection to a peer that accepts but never reads
    async fn stalled_pair(options: ConnectionOptions) -> (PeerConnection, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let conn = PeerConnection::new(options);
        let (accepted, connected) = tokio::join!(listener.accept(), conn.connect("127.0.0.1", port));
        assert!(connected);
        (conn, accepted.unwrap().0)
    }

    fn oversized_message() -> String {
        "x".repeat(32 << 20)
    }

    #[tokio::test]
    async fn test_write_timeout_reports_and_closes() {
        let options = ConnectionOptions {
            write_timeout: Duration::from_millis(200),
            ..fast_options()
        };
        let (conn, _stalled) = stalled_pair(options).await;
        assert!(matches!(next(&conn).await, Inbound::System(t) if t.starts_with("Connected to")));

        conn.send(&oversized_message()).await;

        assert_eq!(next(&conn).await, Inbound::Error("send failed: timed out".to_string()));
        assert!(next(&conn).await.is_disconnect());
        for _ in 0..50 {
            if conn.state() == ConnectionState::Closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_does_not_wait_for_blocked_send() {
        let options = ConnectionOptions {
            write_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_millis(200),
            ..fast_options()
        };
        let (conn, _stalled) = stalled_pair(options).await;

        let sender = conn.clone();
        let blocked = tokio::spawn(async move { sender.send(&oversized_message()).await });
        tokio::time::sleep(Duration::from_millis(300)).await;

        let started = std::time::Instant::now();
        conn.close().await;
        assert!(started.elapsed() < Duration::from_secs(2), "close took {:?}", started.elapsed());
        assert!(!conn.is_connected());

        blocked.abort();
    }
}
