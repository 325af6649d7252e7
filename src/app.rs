//! Node lifecycle and coordination.
//!
//! A [`Node`] ties the pieces together for a host: it runs the inbox
//! listener, announces itself with the presence beacon, optionally joins
//! global discovery, and wraps every accepted or dialled socket in a
//! [`PeerConnection`]. Everything the connections report is funnelled into
//! one event stream tagged with a connection id.

use crate::{
    network::{GlobalDiscovery, PeerRecord, PresenceBeacon},
    storage::{make_peer_key, ContactStore, InMemoryContactStore, Role},
    transport::{ConnectionOptions, Inbound, InboxListener, PeerConnection},
    utils::{PeerlineConfig, Result},
};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Identifies one connection for the lifetime of a node
pub type ConnectionId = u64;

/// One inbound item, tagged with the connection it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEvent {
    /// Connection that produced the item
    pub connection: ConnectionId,
    /// What happened
    pub item: Inbound,
}

impl fmt::Display for NodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[#{}] {}", self.connection, self.item)
    }
}

/// Node statistics
#[derive(Debug, Clone)]
pub struct NodeStats {
    /// Announced display name
    pub name: String,
    /// Bound inbox port, once started
    pub tcp_port: Option<u16>,
    /// Open connections
    pub connections: usize,
    /// Active LAN peers
    pub lan_peers: usize,
    /// Active relay peers
    pub global_peers: usize,
}

struct Tracked {
    connection: PeerConnection,
    history_key: String,
}

/// State reachable from the acceptor and the per-connection pumps
struct Shared {
    options: ConnectionOptions,
    next_id: AtomicU64,
    connections: Mutex<HashMap<ConnectionId, Tracked>>,
    events: mpsc::UnboundedSender<NodeEvent>,
    store: Arc<dyn ContactStore>,
    beacon: Arc<PresenceBeacon>,
}

impl Shared {
    fn connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, Tracked>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn allocate(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn forward(&self, connection: ConnectionId, item: Inbound) {
        // The receiver outlives every pump unless the node is being dropped.
        let _ = self.events.send(NodeEvent { connection, item });
    }

    fn track(self: &Arc<Self>, id: ConnectionId, connection: PeerConnection, history_key: String) {
        self.connections().insert(
            id,
            Tracked {
                connection: connection.clone(),
                history_key: history_key.clone(),
            },
        );
        tokio::spawn(pump(self.clone(), id, connection, history_key));
    }

    /// Best-effort name for an inbound address, from the LAN table
    fn name_for(&self, addr: SocketAddr) -> String {
        let ip = addr.ip().to_string();
        self.beacon
            .get_active_peers()
            .into_iter()
            .find(|peer| peer.address == ip)
            .map_or_else(|| "Unknown".to_string(), |peer| peer.name)
    }

    async fn adopt(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let id = self.allocate();
        let connection = PeerConnection::new(self.options.clone());
        let history_key = make_peer_key(&self.name_for(addr), &addr.ip().to_string(), addr.port());
        connection.adopt(stream, addr).await;
        self.track(id, connection, history_key);
    }
}

/// Move one connection's inbound items into the node event stream
async fn pump(shared: Arc<Shared>, id: ConnectionId, connection: PeerConnection, history_key: String) {
    while let Some(item) = connection.recv().await {
        if let Inbound::Content(text) = &item {
            if let Err(e) = shared.store.append_message(&history_key, Role::Peer, text) {
                log::warn!("Could not store message from {}: {}", history_key, e);
            }
        }
        let finished = item.is_disconnect();
        shared.forward(id, item);
        if finished {
            break;
        }
    }
    shared.connections().remove(&id);
    log::debug!("Connection #{} retired", id);
}

/// A running peer: inbox, beacon, optional global discovery and connections
pub struct Node {
    config: PeerlineConfig,
    shared: Arc<Shared>,
    inbox: InboxListener,
    global: Option<GlobalDiscovery>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<NodeEvent>>,
    tcp_port: Mutex<Option<u16>>,
}

impl Node {
    /// Create a node backed by an in-memory contact store
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or the relay client cannot be built.
    pub fn new(config: PeerlineConfig) -> Result<Self> {
        Self::with_store(config, Arc::new(InMemoryContactStore::new()))
    }

    /// Create a node with a caller-provided contact store
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or the relay client cannot be built.
    pub fn with_store(config: PeerlineConfig, store: Arc<dyn ContactStore>) -> Result<Self> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            options: ConnectionOptions::from(&config.network),
            next_id: AtomicU64::new(0),
            connections: Mutex::new(HashMap::new()),
            events: events_tx,
            store,
            beacon: Arc::new(PresenceBeacon::new(config.beacon.clone())),
        });

        let acceptor_state = shared.clone();
        let inbox = InboxListener::new(move |stream: TcpStream, addr: SocketAddr| -> Result<()> {
            tokio::spawn(acceptor_state.clone().adopt(stream, addr));
            Ok(())
        })
        .with_join_timeout(config.network.join_timeout());

        let global = if config.global.enabled {
            Some(GlobalDiscovery::new(config.global.clone())?.with_join_timeout(config.network.join_timeout()))
        } else {
            None
        };

        Ok(Self {
            config,
            shared,
            inbox,
            global,
            events: tokio::sync::Mutex::new(events_rx),
            tcp_port: Mutex::new(None),
        })
    }

    /// Announced display name
    pub fn name(&self) -> &str {
        &self.config.identity.display_name
    }

    /// Node configuration
    pub fn config(&self) -> &PeerlineConfig {
        &self.config
    }

    /// The contact store
    pub fn store(&self) -> Arc<dyn ContactStore> {
        self.shared.store.clone()
    }

    /// Bound inbox port, once started
    pub fn tcp_port(&self) -> Option<u16> {
        *self.tcp_port.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start the inbox, then the beacon and (if enabled) global discovery.
    ///
    /// Returns the bound inbox port. Discovery failures are logged and leave
    /// that subsystem disabled.
    ///
    /// # Errors
    ///
    /// Fails only if the inbox cannot be bound.
    pub async fn start(&self) -> Result<u16> {
        let network = &self.config.network;
        let port = self.inbox.start(&network.listen_host, network.listen_port).await?;
        *self.tcp_port.lock().unwrap_or_else(|e| e.into_inner()) = Some(port);

        if let Err(e) = self.shared.beacon.start(self.name(), port).await {
            log::warn!("LAN discovery disabled: {}", e);
        }
        if let Some(global) = &self.global {
            if !global.start(self.name(), port).await {
                log::warn!("Global discovery disabled");
            }
        }

        log::info!("Node '{}' listening on port {}", self.name(), port);
        Ok(port)
    }

    /// Dial `host:port`. `name` labels the chat history; it defaults to `host`.
    ///
    /// The connection id is returned either way; on failure the node event
    /// stream carries the `Could not connect` error for it.
    pub async fn connect(&self, host: &str, port: u16, name: Option<&str>) -> (ConnectionId, bool) {
        let id = self.shared.allocate();
        let connection = PeerConnection::new(self.shared.options.clone());

        if !connection.connect(host, port).await {
            connection.poll_received(|item| self.shared.forward(id, item));
            return (id, false);
        }

        let label = name.unwrap_or(host);
        let history_key = make_peer_key(label, host, port);
        if let Err(e) = self.shared.store.upsert_friend(label, host, port) {
            log::warn!("Could not record friend {}: {}", history_key, e);
        }
        self.shared.track(id, connection, history_key);
        (id, true)
    }

    /// Dial a discovered peer
    pub async fn connect_to(&self, peer: &PeerRecord) -> (ConnectionId, bool) {
        self.connect(&peer.address, peer.port, Some(&peer.name)).await
    }

    fn connection(&self, id: ConnectionId) -> Option<(PeerConnection, String)> {
        self.shared
            .connections()
            .get(&id)
            .map(|tracked| (tracked.connection.clone(), tracked.history_key.clone()))
    }

    /// Send a line on one connection. Returns false for an unknown id.
    pub async fn send(&self, id: ConnectionId, text: &str) -> bool {
        let Some((connection, history_key)) = self.connection(id) else {
            return false;
        };
        connection.send(text).await;
        if let Err(e) = self.shared.store.append_message(&history_key, Role::Me, text) {
            log::warn!("Could not store message for {}: {}", history_key, e);
        }
        true
    }

    /// Send a line on every open connection; returns how many got it
    pub async fn broadcast(&self, text: &str) -> usize {
        let mut sent = 0;
        for id in self.connection_ids() {
            if self.send(id, text).await {
                sent += 1;
            }
        }
        sent
    }

    /// Close one connection
    pub async fn disconnect(&self, id: ConnectionId) {
        if let Some((connection, _)) = self.connection(id) {
            connection.close().await;
        }
    }

    /// Ids of the tracked connections, ascending
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.shared.connections().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Remote address of a connection
    pub fn peer_addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.connection(id).and_then(|(connection, _)| connection.peer_addr())
    }

    /// Wait for the next event from any connection
    pub async fn next_event(&self) -> Option<NodeEvent> {
        self.events.lock().await.recv().await
    }

    /// Drain pending events without waiting
    pub fn poll_events<F: FnMut(NodeEvent)>(&self, mut callback: F) -> usize {
        let Ok(mut events) = self.events.try_lock() else {
            return 0;
        };
        let mut delivered = 0;
        while let Ok(event) = events.try_recv() {
            callback(event);
            delivered += 1;
        }
        delivered
    }

    /// Active LAN peers
    pub fn lan_peers(&self) -> Vec<PeerRecord> {
        self.shared.beacon.get_active_peers()
    }

    /// Active relay peers (empty when global discovery is off)
    pub fn global_peers(&self) -> Vec<PeerRecord> {
        self.global.as_ref().map(GlobalDiscovery::get_global_peers).unwrap_or_default()
    }

    /// Current statistics
    pub fn stats(&self) -> NodeStats {
        NodeStats {
            name: self.name().to_string(),
            tcp_port: self.tcp_port(),
            connections: self.shared.connections().len(),
            lan_peers: self.lan_peers().len(),
            global_peers: self.global_peers().len(),
        }
    }

    /// Stop discovery, the inbox and every connection
    pub async fn shutdown(&self) {
        log::info!("Shutting down node '{}'", self.name());

        if let Some(global) = &self.global {
            global.stop().await;
        }
        self.shared.beacon.stop(self.config.network.join_timeout()).await;
        self.inbox.stop().await;

        let connections: Vec<PeerConnection> = self
            .shared
            .connections()
            .values()
            .map(|tracked| tracked.connection.clone())
            .collect();
        for connection in connections {
            connection.close().await;
        }
        *self.tcp_port.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}
