//! HTTP and WebSocket front end of the relay.

use crate::relay::mailbox::Mailboxes;
use crate::relay::protocol::{
    unix_seconds, ClientFrame, ErrorBody, HealthStatus, MailboxMessage, MessageAccepted, MessageBatch, PeerList,
    RelayRequest, ServerFrame, StatusResponse,
};
use crate::relay::push::{FrameSender, PushHub};
use crate::relay::registry::PeerRegistry;
use crate::utils::{NetworkError, RelayConfig, RelayError, Result};
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Source of the relay's notion of "now"
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = if self.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

/// State shared by every request handler
pub struct RelayState {
    registry: PeerRegistry,
    mailboxes: Mailboxes,
    hub: PushHub,
    clock: Clock,
}

impl RelayState {
    /// Create empty state sized from `config`
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            registry: PeerRegistry::new(config.shard_count, config.peer_ttl()),
            mailboxes: Mailboxes::new(config.shard_count, config.mailbox_capacity),
            hub: PushHub::new(),
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock, e.g. to drive TTL expiry in tests
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Presence registry
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Store-and-forward mailboxes
    pub fn mailboxes(&self) -> &Mailboxes {
        &self.mailboxes
    }

    /// Live push rooms
    pub fn hub(&self) -> &PushHub {
        &self.hub
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Execute one API request and build its JSON response
    ///
    /// # Errors
    ///
    /// Only [`RelayError::Internal`] if the response cannot be encoded.
    pub fn handle(&self, request: RelayRequest) -> std::result::Result<Value, RelayError> {
        match request {
            RelayRequest::Update {
                peer_id,
                name,
                public_ip,
                tcp_port,
            } => {
                self.registry.update_at(&peer_id, name, public_ip, tcp_port, self.now());
                to_json(&status("updated"))
            }
            RelayRequest::List { exclude } => to_json(&PeerList {
                peers: self.registry.list_at(exclude.as_deref(), self.now()),
            }),
            RelayRequest::Remove { peer_id } => {
                if let Some(peer_id) = peer_id {
                    self.registry.remove(&peer_id);
                }
                to_json(&status("removed"))
            }
            RelayRequest::RegisterMessaging { user_id } => {
                self.mailboxes.register(&user_id);
                to_json(&StatusResponse {
                    status: "ok".to_string(),
                    message: Some(format!("Registered for messaging: {user_id}")),
                })
            }
            RelayRequest::SendMessage {
                sender,
                recipient,
                text,
            } => {
                let message = self.send_message(&sender, &recipient, &text);
                to_json(&MessageAccepted {
                    status: "ok".to_string(),
                    message_id: message.id,
                })
            }
            RelayRequest::GetMessages { user_id, since_id } => {
                let messages = self.mailboxes.since(&user_id, since_id);
                to_json(&MessageBatch {
                    status: "ok".to_string(),
                    count: messages.len(),
                    messages,
                })
            }
        }
    }

    /// Store a message and push it to the recipient's live subscribers
    pub fn send_message(&self, sender: &str, recipient: &str, text: &str) -> MailboxMessage {
        let message = self.mailboxes.push_at(sender, recipient, text, self.now());
        let pushed = self.hub.deliver(recipient, &ServerFrame::from(&message));
        log::debug!("Message {} for {} pushed to {} subscribers", message.id, recipient, pushed);
        message
    }

    /// Current health snapshot
    pub fn health(&self) -> HealthStatus {
        HealthStatus {
            status: "ok".to_string(),
            peers: self.registry.len(),
            timestamp: unix_seconds(self.now()),
        }
    }

    fn on_client_frame(&self, text: &str, subscriber: u64, outbound: &FrameSender, registered: &mut Option<String>) {
        let reply = match serde_json::from_str::<ClientFrame>(text) {
            Err(e) => {
                log::debug!("Dropping malformed push frame: {}", e);
                frame_error("Invalid frame")
            }
            Ok(ClientFrame::Ping) => ServerFrame::Pong,
            Ok(ClientFrame::Register { user_id }) => match user_id.filter(|id| !id.is_empty()) {
                Some(user_id) => {
                    if let Some(previous) = registered.replace(user_id.clone()) {
                        self.hub.leave(&previous, subscriber);
                    }
                    self.hub.join(&user_id, subscriber, outbound.clone());
                    log::info!("Push subscriber {} registered as {}", subscriber, user_id);
                    ServerFrame::Registered { user_id }
                }
                None => frame_error("Missing user_id"),
            },
            Ok(ClientFrame::SendMessage { recipient, text }) => {
                let recipient = recipient.filter(|r| !r.is_empty());
                let text = text.filter(|t| !t.is_empty());
                match (registered.as_deref(), recipient, text) {
                    (None, _, _) => frame_error("Not registered"),
                    (Some(_), None, _) => frame_error("Missing recipient"),
                    (Some(_), _, None) => frame_error("Missing text"),
                    (Some(sender), Some(recipient), Some(text)) => {
                        self.send_message(sender, &recipient, &text);
                        ServerFrame::Delivered { recipient }
                    }
                }
            }
        };
        let _ = outbound.send(reply);
    }
}

fn status(status: &str) -> StatusResponse {
    StatusResponse {
        status: status.to_string(),
        message: None,
    }
}

fn frame_error(message: &str) -> ServerFrame {
    ServerFrame::Error {
        message: message.to_string(),
    }
}

fn to_json<T: Serialize>(value: &T) -> std::result::Result<Value, RelayError> {
    serde_json::to_value(value).map_err(|e| RelayError::Internal(e.to_string()))
}

/// Build the relay router over `state`
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api", post(api))
        .route("/health", get(health))
        .route("/ws", get(push_socket))
        .with_state(state)
}

async fn api(State(state): State<Arc<RelayState>>, body: Bytes) -> std::result::Result<Json<Value>, RelayError> {
    let value: Value = serde_json::from_slice(&body).map_err(|_| RelayError::NoJson)?;
    let request = RelayRequest::from_value(&value).map_err(|e| {
        log::debug!("Rejected relay request: {}", e);
        e
    })?;
    log::debug!("Relay action {}", request.action());
    state.handle(request).map(Json)
}

async fn health(State(state): State<Arc<RelayState>>) -> Json<HealthStatus> {
    Json(state.health())
}

async fn index(State(state): State<Arc<RelayState>>) -> Html<String> {
    let now = state.now();
    let peers = state.registry.list_at(None, now);
    let items: String = peers
        .iter()
        .map(|peer| {
            format!(
                "<li>{} ({}:{})</li>",
                escape_html(&peer.name),
                escape_html(peer.public_ip.as_deref().unwrap_or("?")),
                peer.tcp_port.map_or_else(|| "?".to_string(), |port| port.to_string())
            )
        })
        .collect();

    Html(format!(
        "<h1>Peerline Relay</h1>\n<p>Status: Running</p>\n<p>Active Peers: {}</p>\n<p>Time: {}</p>\n\
         <h3>Active Peers:</h3>\n<ul>{}</ul>\n",
        peers.len(),
        now.format("%Y-%m-%d %H:%M:%S UTC"),
        items
    ))
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

async fn push_socket(ws: WebSocketUpgrade, State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_push_socket(socket, state))
}

async fn handle_push_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<ServerFrame>();
    let subscriber = state.hub.next_subscriber_id();

    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(e) => {
                    log::warn!("Could not encode push frame: {}", e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let _ = frame_tx.send(ServerFrame::Status {
        message: "Connected to message relay".to_string(),
    });
    log::debug!("Push subscriber {} connected", subscriber);

    let mut registered: Option<String> = None;
    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            Message::Text(text) => state.on_client_frame(text.as_str(), subscriber, &frame_tx, &mut registered),
            Message::Close(_) => break,
            _ => {}
        }
    }

    if let Some(user_id) = registered {
        state.hub.leave(&user_id, subscriber);
        log::info!("Push subscriber {} ({}) disconnected", subscriber, user_id);
    }
    writer.abort();
}

/// A bound relay that has not started serving yet
pub struct RelayServer {
    state: Arc<RelayState>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl RelayServer {
    /// Bind `bind_host:port` from `config`
    ///
    /// # Errors
    ///
    /// Fails if the address does not parse or cannot be bound.
    pub async fn bind(config: &RelayConfig) -> Result<Self> {
        Self::bind_with_state(config, RelayState::new(config)).await
    }

    /// Bind with caller-provided state
    ///
    /// # Errors
    ///
    /// Fails if the address does not parse or cannot be bound.
    pub async fn bind_with_state(config: &RelayConfig, state: RelayState) -> Result<Self> {
        let address = format!("{}:{}", config.bind_host, config.port);
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| NetworkError::BindFailed {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            state: Arc::new(state),
            listener,
            local_addr,
        })
    }

    /// Address actually bound (useful when port=0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared handler state
    pub fn state(&self) -> Arc<RelayState> {
        self.state.clone()
    }

    /// Serve until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Returns the server's I/O error, if any.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        log::info!("Relay listening on {}", self.local_addr);
        axum::serve(self.listener, router(self.state))
            .with_graceful_shutdown(shutdown)
            .await?;
        log::info!("Relay stopped");
        Ok(())
    }

    /// Serve in a background task
    pub fn spawn(self) -> RelayHandle {
        let local_addr = self.local_addr;
        let state = self.state.clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(self.serve_until(async move {
            let _ = shutdown_rx.await;
        }));
        RelayHandle {
            local_addr,
            state,
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// A relay serving in the background
pub struct RelayHandle {
    local_addr: SocketAddr,
    state: Arc<RelayState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl RelayHandle {
    /// Address the relay serves on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Base URL for [`crate::network::RelayClient`]
    pub fn url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Shared handler state
    pub fn state(&self) -> Arc<RelayState> {
        self.state.clone()
    }

    /// Stop accepting and wait up to `grace` for open connections to finish
    pub async fn shutdown(mut self, grace: Duration) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(Err(e))) => log::warn!("Relay exited with error: {}", e),
            Ok(_) => {}
            Err(_) => {
                log::warn!("Relay connections still open after {:?}; aborting", grace);
                self.task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::json;
    use std::sync::Mutex;
    use tower::ServiceExt;

    fn config() -> RelayConfig {
        RelayConfig {
            mailbox_capacity: 3,
            shard_count: 4,
            ..RelayConfig::default()
        }
    }

    async fn post_api(app: &Router, body: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_update_then_list_excludes_caller() {
        let app = router(Arc::new(RelayState::new(&config())));

        let (status, body) = post_api(
            &app,
            r#"{"action":"update","peer_id":"a@1.1.1.1:1","name":"a","public_ip":"1.1.1.1","tcp_port":1}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "updated"}));
        post_api(&app, r#"{"action":"update","peer_id":"b@2.2.2.2:2","public_ip":"2.2.2.2","tcp_port":2}"#).await;

        let (_, body) = post_api(&app, r#"{"action":"list","exclude":"a@1.1.1.1:1"}"#).await;
        let peers = body["peers"].as_array().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0]["peer_id"], "b@2.2.2.2:2");
        assert_eq!(peers[0]["name"], "Unknown");
    }

    #[tokio::test]
    async fn test_list_respects_ttl_with_injected_clock() {
        let now = Arc::new(Mutex::new(Utc::now()));
        let clock_now = now.clone();
        let state = RelayState::new(&config()).with_clock(Arc::new(move || *clock_now.lock().unwrap()));
        let app = router(Arc::new(state));

        post_api(&app, r#"{"action":"update","peer_id":"a"}"#).await;
        *now.lock().unwrap() += chrono::Duration::seconds(31);
        let (_, body) = post_api(&app, r#"{"action":"list"}"#).await;
        assert_eq!(body, json!({"peers": []}));
    }

    #[tokio::test]
    async fn test_client_errors_are_400() {
        let app = router(Arc::new(RelayState::new(&config())));

        let (status, body) = post_api(&app, r#"{"action":"fly"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "Unknown action"}));

        let (status, body) = post_api(&app, r#"{"action":"update"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "Missing peer_id"}));

        let (status, body) = post_api(&app, "not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "No JSON data"}));
    }

    #[tokio::test]
    async fn test_remove_without_peer_id_still_succeeds() {
        let app = router(Arc::new(RelayState::new(&config())));
        let (status, body) = post_api(&app, r#"{"action":"remove"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "removed"}));
    }

    #[tokio::test]
    async fn test_mailbox_flow_and_trim() {
        let app = router(Arc::new(RelayState::new(&config())));

        let (_, body) = post_api(&app, r#"{"action":"register_messaging","user_id":"bob"}"#).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["message"], "Registered for messaging: bob");

        let mut ids = Vec::new();
        for text in ["1", "2", "3", "4"] {
            let request = json!({"action": "send_message", "sender": "ann", "recipient": "bob", "text": text});
            let (_, body) = post_api(&app, &request.to_string()).await;
            ids.push(body["message_id"].as_u64().unwrap());
        }

        let (_, body) = post_api(&app, r#"{"action":"get_messages","user_id":"bob"}"#).await;
        assert_eq!(body["count"], 3);
        let texts: Vec<_> = body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["text"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(texts, vec!["2", "3", "4"]);

        let request = json!({"action": "get_messages", "user_id": "bob", "since_id": ids[2]});
        let (_, body) = post_api(&app, &request.to_string()).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["messages"][0]["id"], ids[3]);
    }

    #[tokio::test]
    async fn test_health_and_index() {
        let state = Arc::new(RelayState::new(&config()));
        state
            .registry()
            .update_at("x", Some("<b>eve</b>".into()), Some("9.9.9.9".into()), Some(7), Utc::now());
        let app = router(state);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let health: HealthStatus = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.peers, 1);

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let page = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(page.contains("Active Peers: 1"));
        assert!(page.contains("&lt;b&gt;eve&lt;/b&gt; (9.9.9.9:7)"));
    }

    #[test]
    fn test_push_frames_for_unregistered_sender() {
        let state = RelayState::new(&config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut registered = None;

        state.on_client_frame(r#"{"type":"send_message","recipient":"bob","text":"hi"}"#, 1, &tx, &mut registered);
        assert_eq!(rx.try_recv().unwrap(), frame_error("Not registered"));

        state.on_client_frame(r#"{"type":"ping"}"#, 1, &tx, &mut registered);
        assert_eq!(rx.try_recv().unwrap(), ServerFrame::Pong);

        state.on_client_frame("garbage", 1, &tx, &mut registered);
        assert_eq!(rx.try_recv().unwrap(), frame_error("Invalid frame"));
    }

    #[test]
    fn test_push_frame_send_reaches_room_and_mailbox() {
        let state = RelayState::new(&config());
        let (ann_tx, mut ann_rx) = mpsc::unbounded_channel();
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        let mut ann = None;
        let mut bob = None;

        state.on_client_frame(r#"{"type":"register","user_id":"ann"}"#, 1, &ann_tx, &mut ann);
        state.on_client_frame(r#"{"type":"register","user_id":"bob"}"#, 2, &bob_tx, &mut bob);
        assert!(matches!(ann_rx.try_recv().unwrap(), ServerFrame::Registered { .. }));
        assert!(matches!(bob_rx.try_recv().unwrap(), ServerFrame::Registered { .. }));

        state.on_client_frame(r#"{"type":"send_message","recipient":"bob","text":"hi"}"#, 1, &ann_tx, &mut ann);
        assert_eq!(
            ann_rx.try_recv().unwrap(),
            ServerFrame::Delivered {
                recipient: "bob".to_string()
            }
        );
        match bob_rx.try_recv().unwrap() {
            ServerFrame::Message { sender, text, .. } => {
                assert_eq!(sender, "ann");
                assert_eq!(text, "hi");
            }
            other => panic!("unexpected frame {other:?}"),
        }
        assert_eq!(state.mailboxes().since("bob", 0).len(), 1);
    }
}
