//! Internet-scale discovery through a relay.
//!
//! The client detects its public address, announces `name@ip:port` to the
//! relay on a timer and mirrors the relay's peer list into a local TTL table.
//! Relay failures are logged and retried on the next tick; none of them reach
//! the host.

use crate::network::peers::{sort_records, PeerRecord, PeerTable};
use crate::network::relay_client::RelayClient;
use crate::utils::{GlobalConfig, NetworkError, Result};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Callback run after every discovery tick
pub type UpdateCallback = Arc<dyn Fn() + Send + Sync>;

/// Relay identity of a peer
pub fn make_peer_id(name: &str, public_ip: &str, tcp_port: u16) -> String {
    format!("{name}@{public_ip}:{tcp_port}")
}

/// Ask each IP-echo endpoint in order and return the first non-empty answer.
///
/// # Errors
///
/// [`NetworkError::PublicIpUnavailable`] once every endpoint has failed.
pub async fn detect_public_ip(client: &reqwest::Client, endpoints: &[String]) -> Result<String> {
    let mut last_failure = "no endpoints configured".to_string();
    for endpoint in endpoints {
        let answer: reqwest::Result<String> = async {
            let response = client.get(endpoint).send().await?.error_for_status()?;
            response.text().await
        }
        .await;

        match answer {
            Ok(text) if !text.trim().is_empty() => {
                let ip = text.trim().to_string();
                log::info!("Public IP {} (via {})", ip, endpoint);
                return Ok(ip);
            }
            Ok(_) => {
                log::debug!("{} returned an empty answer", endpoint);
                last_failure = format!("{endpoint}: empty answer");
            }
            Err(e) => {
                log::debug!("{} failed: {}", endpoint, e);
                last_failure = format!("{endpoint}: {e}");
            }
        }
    }
    Err(NetworkError::PublicIpUnavailable { reason: last_failure }.into())
}

/// What this node announces
#[derive(Debug, Clone)]
struct Announcement {
    peer_id: String,
    name: String,
    public_ip: String,
    tcp_port: u16,
}

/// One update loop with its stop flag and wakeup, fresh for every `start`
struct Run {
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl Run {
    fn signal(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

/// Relay-backed discovery client
pub struct GlobalDiscovery {
    config: GlobalConfig,
    client: RelayClient,
    peers: Arc<PeerTable<String>>,
    public_ip_override: Option<String>,
    announcement: Mutex<Option<Announcement>>,
    on_update: Option<UpdateCallback>,
    join_timeout: Duration,
    running: AtomicBool,
    run: Mutex<Option<Run>>,
}

impl GlobalDiscovery {
    /// Create a stopped client for `config.relay_url`
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn new(config: GlobalConfig) -> Result<Self> {
        let client = RelayClient::new(&config.relay_url, config.request_timeout())?;
        Ok(Self {
            peers: Arc::new(PeerTable::new(config.peer_ttl())),
            config,
            client,
            public_ip_override: None,
            announcement: Mutex::new(None),
            on_update: None,
            join_timeout: Duration::from_millis(crate::defaults::JOIN_TIMEOUT_MS),
            running: AtomicBool::new(false),
            run: Mutex::new(None),
        })
    }

    /// Run `callback` after every tick
    pub fn on_update<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_update = Some(Arc::new(callback));
        self
    }

    /// Announce `ip` instead of asking the IP-echo endpoints
    pub fn with_public_ip(mut self, ip: impl Into<String>) -> Self {
        self.public_ip_override = Some(ip.into());
        self
    }

    /// Bound on waiting for the loop in `stop`
    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }

    /// The relay client in use
    pub fn client(&self) -> &RelayClient {
        &self.client
    }

    /// Whether the update loop is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Our relay identity, once started
    pub fn peer_id(&self) -> Option<String> {
        self.lock_announcement().as_ref().map(|a| a.peer_id.clone())
    }

    /// Detected (or configured) public address, once started
    pub fn public_ip(&self) -> Option<String> {
        self.lock_announcement().as_ref().map(|a| a.public_ip.clone())
    }

    /// Detect the public IP and start the update loop.
    ///
    /// Returns false, and stays disabled, if no public IP could be found.
    pub async fn start(&self, name: &str, tcp_port: u16) -> bool {
        if self.running.load(Ordering::SeqCst) {
            return true;
        }

        let public_ip = match &self.public_ip_override {
            Some(ip) => ip.clone(),
            None => match detect_public_ip(self.client.http(), &self.config.ip_echo_endpoints).await {
                Ok(ip) => ip,
                Err(e) => {
                    log::warn!("Could not detect public IP, global discovery disabled: {}", e);
                    return false;
                }
            },
        };

        if self.running.swap(true, Ordering::SeqCst) {
            return true;
        }

        let announcement = Announcement {
            peer_id: make_peer_id(name, &public_ip, tcp_port),
            name: name.to_string(),
            public_ip,
            tcp_port,
        };
        *self.lock_announcement() = Some(announcement.clone());

        log::info!(
            "Global discovery started as {} via {}",
            announcement.peer_id,
            self.client.base_url()
        );

        let stop = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let task = tokio::spawn(update_loop(
            self.client.clone(),
            announcement,
            self.peers.clone(),
            self.on_update.clone(),
            self.config.update_interval(),
            stop.clone(),
            wake.clone(),
        ));
        *self.lock_run() = Some(Run { stop, wake, task });
        true
    }

    /// Stop the loop, then ask the relay to forget us (best effort)
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let run = self.lock_run().take();
        if let Some(run) = run {
            run.signal();
            if tokio::time::timeout(self.join_timeout, run.task).await.is_err() {
                log::warn!("Global discovery loop did not stop within {:?}", self.join_timeout);
            }
        }

        let peer_id = self.peer_id();
        if let Some(peer_id) = peer_id {
            if let Err(e) = self.client.remove(&peer_id).await {
                log::debug!("Could not remove {} from relay: {}", peer_id, e);
            }
        }
        log::info!("Global discovery stopped");
    }

    /// Peers learned from the relay, TTL-filtered and sorted
    pub fn get_global_peers(&self) -> Vec<PeerRecord> {
        let mut peers = self.peers.active();
        sort_records(&mut peers);
        peers
    }

    fn lock_run(&self) -> std::sync::MutexGuard<'_, Option<Run>> {
        self.run.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_announcement(&self) -> std::sync::MutexGuard<'_, Option<Announcement>> {
        self.announcement.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for GlobalDiscovery {
    fn drop(&mut self) {
        if let Some(run) = self.lock_run().take() {
            run.signal();
        }
    }
}

async fn update_loop(
    client: RelayClient,
    announcement: Announcement,
    peers: Arc<PeerTable<String>>,
    on_update: Option<UpdateCallback>,
    interval: Duration,
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
) {
    while !stop.load(Ordering::SeqCst) {
        tokio::select! {
            _ = wake.notified() => break,
            _ = tick(&client, &announcement, &peers) => {}
        }
        if let Some(callback) = &on_update {
            callback();
        }
        tokio::select! {
            _ = wake.notified() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    log::debug!("Global discovery loop finished");
}

async fn tick(client: &RelayClient, me: &Announcement, peers: &PeerTable<String>) {
    if let Err(e) = client.update(&me.peer_id, &me.name, &me.public_ip, me.tcp_port).await {
        log::warn!("Failed to update presence: {}", e);
    }

    match client.list(Some(&me.peer_id)).await {
        Ok(entries) => {
            let received_at = Utc::now();
            let mut merged = 0;
            for entry in entries.iter().filter(|entry| entry.peer_id != me.peer_id) {
                match entry.to_peer_record(received_at) {
                    Some(record) => {
                        peers.upsert(entry.peer_id.clone(), record);
                        merged += 1;
                    }
                    None => log::debug!("Skipping relay entry {} without an address", entry.peer_id),
                }
            }
            log::debug!("Merged {} global peers", merged);
        }
        Err(e) => log::warn!("Failed to fetch peers: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::PeerlineError;
    use axum::{routing::get, Router};

    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn echo_server(answer: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/", get(move || async move { answer }));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}/")
    }

    #[test]
    fn test_peer_id_format() {
        assert_eq!(make_peer_id("ann", "203.0.113.5", 4000), "ann@203.0.113.5:4000");
    }

    #[tokio::test]
    async fn test_detection_falls_through_to_first_good_answer() {
        let client = reqwest::Client::new();
        let endpoints = vec![
            format!("http://127.0.0.1:{}/", closed_port()),
            echo_server("  \n").await,
            echo_server("203.0.113.5\n").await,
        ];
        let ip = detect_public_ip(&client, &endpoints).await.unwrap();
        assert_eq!(ip, "203.0.113.5");
    }

    #[tokio::test]
    async fn test_detection_failure_disables_client() {
        let config = GlobalConfig {
            relay_url: format!("http://127.0.0.1:{}", closed_port()),
            ip_echo_endpoints: vec![format!("http://127.0.0.1:{}/", closed_port())],
            ..GlobalConfig::default()
        };
        let err = detect_public_ip(&reqwest::Client::new(), &config.ip_echo_endpoints)
            .await
            .unwrap_err();
        assert!(matches!(err, PeerlineError::Network(NetworkError::PublicIpUnavailable { .. })));

        let discovery = GlobalDiscovery::new(config).unwrap();
        assert!(!discovery.start("ann", 4000).await);
        assert!(!discovery.is_running());
        assert!(discovery.peer_id().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_not_fatal() {
        let config = GlobalConfig {
            relay_url: format!("http://127.0.0.1:{}", closed_port()),
            update_interval_ms: 50,
            ..GlobalConfig::default()
        };
        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = ticks.clone();
        let discovery = GlobalDiscovery::new(config)
            .unwrap()
            .with_public_ip("127.0.0.1")
            .on_update(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        assert!(discovery.start("ann", 4000).await);
        assert_eq!(discovery.peer_id().as_deref(), Some("ann@127.0.0.1:4000"));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 1);
        assert!(discovery.get_global_peers().is_empty());

        discovery.stop().await;
        assert!(!discovery.is_running());
    }

    #[tokio::test]
    async fn test_restart_resumes_updates() {
        let config = GlobalConfig {
            relay_url: format!("http://127.0.0.1:{}", closed_port()),
            update_interval_ms: 50,
            request_timeout_ms: 200,
            ..GlobalConfig::default()
        };
        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = ticks.clone();
        let discovery = GlobalDiscovery::new(config)
            .unwrap()
            .with_public_ip("127.0.0.1")
            .on_update(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        // Stopped while the first tick is still in flight.
        assert!(discovery.start("ann", 4000).await);
        discovery.stop().await;
        let before = ticks.load(Ordering::SeqCst);

        assert!(discovery.start("ann", 4000).await);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(discovery.is_running());
        assert!(ticks.load(Ordering::SeqCst) > before);

        discovery.stop().await;
    }
}
