//! Presence registry: peers announced through `update`, expired by TTL.

use crate::relay::protocol::{unix_seconds, RelayEntry, UNKNOWN_NAME};
use crate::relay::shard::ShardedMap;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Sharded `peer_id -> RelayEntry` map
pub struct PeerRegistry {
    ttl: Duration,
    entries: ShardedMap<RelayEntry>,
}

impl PeerRegistry {
    /// Create an empty registry
    pub fn new(shard_count: usize, ttl: Duration) -> Self {
        Self {
            ttl,
            entries: ShardedMap::new(shard_count),
        }
    }

    /// Entry lifetime without updates
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or refresh `peer_id`, stamping it with `now`
    pub fn update_at(
        &self,
        peer_id: &str,
        name: Option<String>,
        public_ip: Option<String>,
        tcp_port: Option<u16>,
        now: DateTime<Utc>,
    ) -> RelayEntry {
        let entry = RelayEntry {
            peer_id: peer_id.to_string(),
            name: name.unwrap_or_else(|| UNKNOWN_NAME.to_string()),
            public_ip,
            tcp_port,
            last_seen: unix_seconds(now),
        };
        self.entries
            .with_shard(peer_id, |shard| shard.insert(peer_id.to_string(), entry.clone()));
        entry
    }

    /// Purge entries expired at `now` and return the rest, minus `exclude`,
    /// ordered by `peer_id`
    pub fn list_at(&self, exclude: Option<&str>, now: DateTime<Utc>) -> Vec<RelayEntry> {
        let now = unix_seconds(now);
        let ttl = self.ttl.as_secs_f64();

        let mut active = Vec::new();
        self.entries.for_each_shard(|shard| {
            shard.retain(|_, entry| now - entry.last_seen <= ttl);
            active.extend(
                shard
                    .values()
                    .filter(|entry| Some(entry.peer_id.as_str()) != exclude)
                    .cloned(),
            );
        });
        active.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        active
    }

    /// Drop `peer_id`; returns whether it was present
    pub fn remove(&self, peer_id: &str) -> bool {
        self.entries.with_shard(peer_id, |shard| shard.remove(peer_id).is_some())
    }

    /// Stored entries, including ones not purged yet
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn registry() -> PeerRegistry {
        PeerRegistry::new(4, Duration::from_secs(30))
    }

    #[test]
    fn test_list_excludes_caller() {
        let registry = registry();
        registry.update_at("a", Some("A".into()), Some("1.1.1.1".into()), Some(1), at(0));
        registry.update_at("b", None, Some("2.2.2.2".into()), Some(2), at(0));

        let peers = registry.list_at(Some("a"), at(1));
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].peer_id, "b");
        assert_eq!(peers[0].name, "Unknown");

        assert_eq!(registry.list_at(None, at(1)).len(), 2);
    }

    #[test]
    fn test_expired_entries_are_purged_by_list() {
        let registry = registry();
        registry.update_at("old", None, None, None, at(0));
        registry.update_at("new", None, None, None, at(20));

        assert_eq!(registry.list_at(None, at(30)).len(), 2);
        let peers = registry.list_at(None, at(31));
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].peer_id, "new");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_update_refreshes_and_remove_deletes() {
        let registry = registry();
        registry.update_at("a", None, None, None, at(0));
        registry.update_at("a", Some("renamed".into()), None, None, at(25));
        let peers = registry.list_at(None, at(40));
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name, "renamed");

        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        assert!(registry.is_empty());
    }
}
