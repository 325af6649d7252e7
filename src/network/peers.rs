//! TTL-bounded peer records shared by LAN and global discovery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

/// A discovered peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Display name announced by the peer
    pub name: String,
    /// IP address the peer is reachable on
    pub address: String,
    /// TCP port of the peer's inbox listener
    pub port: u16,
    /// Last time we heard from the peer
    pub last_seen: DateTime<Utc>,
}

impl PeerRecord {
    /// Create a record seen at `last_seen`
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16, last_seen: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            last_seen,
        }
    }

    /// Storage/relay key `name@address:port`
    pub fn peer_key(&self) -> String {
        format!("{}@{}:{}", self.name, self.address, self.port)
    }

    /// Whether the record is older than `ttl` at `now`
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(self.last_seen) > ttl
    }
}

/// Lock-protected map of peer records with lazy TTL purge on read.
///
/// The lock is only held for map mutation; callers never perform I/O under it.
pub struct PeerTable<K> {
    ttl: Duration,
    peers: Mutex<HashMap<K, PeerRecord>>,
}

impl<K> PeerTable<K>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty table
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Configured time-to-live
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or refresh a record
    pub fn upsert(&self, key: K, record: PeerRecord) {
        self.lock().insert(key, record);
    }

    /// Remove a record, returning it if present
    pub fn remove(&self, key: &K) -> Option<PeerRecord> {
        self.lock().remove(key)
    }

    /// Purge expired records and return the rest
    pub fn active(&self) -> Vec<PeerRecord> {
        self.active_at(Utc::now())
    }

    /// Purge records expired at `now` and return the survivors
    pub fn active_at(&self, now: DateTime<Utc>) -> Vec<PeerRecord> {
        let mut peers = self.lock();
        peers.retain(|_, record| !record.is_expired(self.ttl, now));
        peers.values().cloned().collect()
    }

    /// Number of stored records, including ones not yet purged
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the table holds no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every record
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, PeerRecord>> {
        // A poisoned map is still structurally valid.
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Sort records by `(name, address, port)`, names compared case-insensitively.
pub fn sort_records(records: &mut [PeerRecord]) {
    records.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.address.cmp(&b.address))
            .then_with(|| a.port.cmp(&b.port))
    });
}
