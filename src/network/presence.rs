//! UDP LAN presence beacons.
//!
//! Every instance both broadcasts a small JSON beacon on a shared UDP port and
//! listens on that port, keeping a TTL-filtered table of the peers it hears.
//! Nothing coordinates the instances; discovery is eventual and lossy.
//!
//! Beacons carry a random per-instance token so a receiver can tell its own
//! packets apart from a peer that happens to share its name and port.

use crate::network::peers::{sort_records, PeerRecord, PeerTable};
use crate::utils::{BeaconConfig, NetworkError, PeerlineError, ProtocolError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Largest datagram the receiver will read
const MAX_DATAGRAM: usize = 2048;

/// LAN peers are keyed by the sender's address and announced TCP port
pub type LanPeerKey = (String, u16);

/// Beacon datagram as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconPacket {
    /// Announced display name
    #[serde(default)]
    pub name: String,
    /// Announced TCP port; signed so that out-of-range values can be rejected
    #[serde(default)]
    pub port: i64,
    /// Per-process instance token (absent from older peers)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl BeaconPacket {
    /// Decode a datagram, replacing invalid UTF-8 before parsing
    pub fn decode(data: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(data);
        serde_json::from_str(&text).map_err(|e| {
            ProtocolError::InvalidMessage {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Validated TCP port
    pub fn tcp_port(&self) -> Result<u16> {
        match u16::try_from(self.port) {
            Ok(port) if port > 0 => Ok(port),
            _ => Err(ProtocolError::InvalidField {
                field: "port".to_string(),
                value: self.port.to_string(),
            }
            .into()),
        }
    }
}

/// What this instance announces, used for self-filtering
#[derive(Debug, Clone)]
struct LocalIdentity {
    name: String,
    port: u16,
    instance: String,
}

impl LocalIdentity {
    fn is_self(&self, packet: &BeaconPacket, name: &str, port: u16) -> bool {
        match &packet.instance {
            Some(token) => *token == self.instance,
            // Legacy peers without a token: fall back to name + port.
            None => name == self.name && port == self.port,
        }
    }
}

/// Turn a received datagram into a peer table entry, or `None` if it should
/// be dropped (malformed, bad port, or one of our own beacons).
fn accept_datagram(
    local: &LocalIdentity,
    data: &[u8],
    sender: IpAddr,
    now: DateTime<Utc>,
) -> Option<(LanPeerKey, PeerRecord)> {
    let packet = BeaconPacket::decode(data).ok()?;
    let port = packet.tcp_port().ok()?;
    let name = match packet.name.trim() {
        "" => "Unknown".to_string(),
        trimmed => trimmed.to_string(),
    };

    if local.is_self(&packet, &name, port) {
        return None;
    }

    let address = sender.to_string();
    let record = PeerRecord::new(name, address.clone(), port, now);
    Some(((address, port), record))
}

/// LAN presence beacon: broadcaster plus collector.
pub struct PresenceBeacon {
    config: BeaconConfig,
    instance: String,
    peers: Arc<PeerTable<LanPeerKey>>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PresenceBeacon {
    /// Create a beacon with a fresh instance token
    pub fn new(config: BeaconConfig) -> Self {
        let peers = Arc::new(PeerTable::new(config.peer_ttl()));
        Self {
            config,
            instance: Uuid::new_v4().to_string(),
            peers,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// This instance's beacon token
    pub fn instance_token(&self) -> &str {
        &self.instance
    }

    /// Whether the loops are running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bind the discovery port and start the broadcast and receive loops.
    ///
    /// # Errors
    ///
    /// Returns an error if the discovery port cannot be bound or the
    /// broadcast address is invalid; no loop is started in that case.
    pub async fn start(&self, name: &str, tcp_port: u16) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            log::debug!("Presence beacon already running");
            return Ok(());
        }

        let local = LocalIdentity {
            name: name.to_string(),
            port: tcp_port,
            instance: self.instance.clone(),
        };
        let prepared = serde_json::to_vec(&BeaconPacket {
            name: local.name.clone(),
            port: i64::from(tcp_port),
            instance: Some(local.instance.clone()),
        })
        .map_err(PeerlineError::from)
        .and_then(|payload| self.open_sockets().map(|sockets| (payload, sockets)));

        let (payload, (recv_socket, send_socket, target)) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let broadcaster = tokio::spawn(broadcast_loop(
            send_socket,
            target,
            payload,
            self.config.interval(),
            self.running.clone(),
            self.shutdown.clone(),
        ));
        let receiver = tokio::spawn(receive_loop(
            recv_socket,
            local,
            self.peers.clone(),
            self.config.recv_timeout(),
            self.running.clone(),
            self.shutdown.clone(),
        ));

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(broadcaster);
        tasks.push(receiver);

        log::info!(
            "Presence beacon started for '{}' (tcp {}) on udp {}",
            name,
            tcp_port,
            self.config.port
        );
        Ok(())
    }

    fn open_sockets(&self) -> Result<(UdpSocket, UdpSocket, SocketAddr)> {
        let target: SocketAddr = format!("{}:{}", self.config.broadcast_address, self.config.port)
            .parse()
            .map_err(|_| NetworkError::InvalidAddress {
                address: self.config.broadcast_address.clone(),
            })?;

        let bind_failed = |address: String| {
            move |e: std::io::Error| NetworkError::BindFailed {
                address,
                reason: e.to_string(),
            }
        };

        let recv_socket = bind_shared_udp(self.config.port)
            .map_err(bind_failed(format!("udp 0.0.0.0:{}", self.config.port)))?;
        let send_socket = bind_broadcast_sender().map_err(bind_failed("udp 0.0.0.0:0".to_string()))?;

        Ok((recv_socket, send_socket, target))
    }

    /// Ask both loops to stop and wait for them, bounded by `join_timeout`.
    pub async fn stop(&self, join_timeout: Duration) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();

        let tasks: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            if tokio::time::timeout(join_timeout, task).await.is_err() {
                log::warn!("Presence loop did not stop within {:?}", join_timeout);
            }
        }
        log::info!("Presence beacon stopped");
    }

    /// Current LAN peers, TTL-filtered and sorted by `(name, address, port)`
    pub fn get_active_peers(&self) -> Vec<PeerRecord> {
        let mut peers = self.peers.active();
        sort_records(&mut peers);
        peers
    }
}

impl Drop for PresenceBeacon {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }
}

async fn broadcast_loop(
    socket: UdpSocket,
    target: SocketAddr,
    payload: Vec<u8>,
    interval: Duration,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    let mut ticker = tokio::time::interval(interval);
    while running.load(Ordering::SeqCst) {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = ticker.tick() => {}
        }
        if !running.load(Ordering::SeqCst) {
            break;
        }
        // No route / network down: try again next tick.
        if let Err(e) = socket.send_to(&payload, target).await {
            log::debug!("Beacon send to {} failed: {}", target, e);
        } else {
            log::trace!("Beacon sent to {}", target);
        }
    }
}

async fn receive_loop(
    socket: UdpSocket,
    local: LocalIdentity,
    peers: Arc<PeerTable<LanPeerKey>>,
    recv_timeout: Duration,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    let mut buf = [0u8; MAX_DATAGRAM];
    while running.load(Ordering::SeqCst) {
        let received = tokio::select! {
            _ = shutdown.notified() => break,
            received = tokio::time::timeout(recv_timeout, socket.recv_from(&mut buf)) => received,
        };

        match received {
            Err(_) => continue,
            Ok(Ok((len, from))) => {
                match accept_datagram(&local, &buf[..len], from.ip(), Utc::now()) {
                    Some((key, record)) => {
                        log::trace!("Beacon from {} ({}:{})", record.name, record.address, record.port);
                        peers.upsert(key, record);
                    }
                    None => log::trace!("Dropped datagram from {}", from),
                }
            }
            Ok(Err(e)) => {
                log::warn!("Beacon receive failed, stopping listener: {}", e);
                break;
            }
        }
    }
}

/// Bind a UDP socket on `port` that other local processes may also bind.
fn bind_shared_udp(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if let Err(e) = socket.set_reuse_port(true) {
        log::debug!("SO_REUSEPORT unavailable: {}", e);
    }
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

fn bind_broadcast_sender() -> std::io::Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> LocalIdentity {
        LocalIdentity {
            name: "alice".to_string(),
            port: 5000,
            instance: "token-a".to_string(),
        }
    }

    fn sender() -> IpAddr {
        "192.168.1.20".parse().unwrap()
    }

    #[test]
    fn test_accepts_peer_beacon() {
        let data = br#"{"name":"bob","port":6000,"instance":"token-b"}"#;
        let (key, record) = accept_datagram(&local(), data, sender(), Utc::now()).unwrap();
        assert_eq!(key, ("192.168.1.20".to_string(), 6000));
        assert_eq!(record.name, "bob");
        assert_eq!(record.port, 6000);
    }

    #[test]
    fn test_drops_own_token() {
        let data = br#"{"name":"renamed","port":1,"instance":"token-a"}"#;
        assert!(accept_datagram(&local(), data, sender(), Utc::now()).is_none());
    }

    #[test]
    fn test_same_name_and_port_from_other_instance_is_kept() {
        let data = br#"{"name":"alice","port":5000,"instance":"token-z"}"#;
        assert!(accept_datagram(&local(), data, sender(), Utc::now()).is_some());
    }

    #[test]
    fn test_legacy_packet_uses_name_and_port() {
        let own = br#"{"name":"alice","port":5000}"#;
        assert!(accept_datagram(&local(), own, sender(), Utc::now()).is_none());

        let other = br#"{"name":"alice","port":5001}"#;
        assert!(accept_datagram(&local(), other, sender(), Utc::now()).is_some());
    }

    #[test]
    fn test_rejects_bad_ports_and_garbage() {
        let cases: [&[u8]; 5] = [
            br#"{"name":"bob","port":0}"#,
            br#"{"name":"bob","port":-4}"#,
            br#"{"name":"bob","port":70000}"#,
            br#"{"name":"bob"}"#,
            b"\xff\xfenot json",
        ];
        for data in cases {
            assert!(accept_datagram(&local(), data, sender(), Utc::now()).is_none());
        }
    }

    #[test]
    fn test_blank_name_becomes_unknown() {
        let data = br#"{"name":"   ","port":7000}"#;
        let (_, record) = accept_datagram(&local(), data, sender(), Utc::now()).unwrap();
        assert_eq!(record.name, "Unknown");
    }

    #[test]
    fn test_packet_encoding_includes_token() {
        let packet = BeaconPacket {
            name: "alice".to_string(),
            port: 5000,
            instance: Some("t".to_string()),
        };
        let json = serde_json::to_string(&packet).unwrap();
        assert!(json.contains(r#""instance":"t""#));
    }

    #[tokio::test]
    async fn test_start_and_stop_lifecycle() {
        let config = BeaconConfig {
            port: 45_871,
            broadcast_address: "127.0.0.1".to_string(),
            interval_ms: 50,
            peer_ttl_ms: 5_000,
            recv_timeout_ms: 50,
        };
        let beacon = PresenceBeacon::new(config);
        beacon.start("alice", 5000).await.unwrap();
        assert!(beacon.is_running());
        // A second start is a no-op rather than a second pair of loops.
        beacon.start("alice", 5000).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(beacon.get_active_peers().iter().all(|p| p.name != "alice"));

        beacon.stop(Duration::from_secs(2)).await;
        assert!(!beacon.is_running());
    }

    #[tokio::test]
    async fn test_invalid_broadcast_address_fails_start() {
        let config = BeaconConfig {
            broadcast_address: "not an address".to_string(),
            ..BeaconConfig::default()
        };
        let beacon = PresenceBeacon::new(config);
        assert!(beacon.start("alice", 5000).await.is_err());
        assert!(!beacon.is_running());
    }
}
