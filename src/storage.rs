//! Contact and chat-history storage boundary.
//!
//! The core never persists anything itself; hosts plug in a [`ContactStore`].
//! [`InMemoryContactStore`] is the bundled implementation.

use crate::utils::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Key used for friends and histories: `name@ip:port`
pub fn make_peer_key(name: &str, ip: &str, port: u16) -> String {
    format!("{name}@{ip}:{port}")
}

/// Who wrote a stored message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The local user
    Me,
    /// The remote peer
    Peer,
}

/// Someone we have chatted with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Friend {
    /// Display name
    pub name: String,
    /// Last known address
    pub ip: String,
    /// Last known inbox port
    pub port: u16,
    /// Last time we exchanged messages
    pub last_spoke: DateTime<Utc>,
}

/// One entry of a chat history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Author
    pub role: Role,
    /// Message text
    pub text: String,
    /// When it was stored
    pub ts: DateTime<Utc>,
}

/// Storage for friends and per-peer histories
pub trait ContactStore: Send + Sync {
    /// Add or refresh a friend; returns its peer key
    fn upsert_friend(&self, name: &str, ip: &str, port: u16) -> Result<String>;

    /// Friends, most recently spoken to first
    fn get_friends(&self) -> Result<Vec<Friend>>;

    /// Append to the history under `key`
    fn append_message(&self, key: &str, role: Role, text: &str) -> Result<()>;

    /// The most recent `limit` messages under `key`, oldest first.
    /// A `limit` of 0 returns the whole history.
    fn get_messages(&self, key: &str, limit: usize) -> Result<Vec<StoredMessage>>;
}

#[derive(Default)]
struct Contacts {
    friends: HashMap<String, Friend>,
    messages: HashMap<String, Vec<StoredMessage>>,
}

/// Process-local [`ContactStore`]
#[derive(Default)]
pub struct InMemoryContactStore {
    contacts: Mutex<Contacts>,
}

impl InMemoryContactStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// [`ContactStore::upsert_friend`] with an explicit timestamp
    pub fn upsert_friend_at(&self, name: &str, ip: &str, port: u16, now: DateTime<Utc>) -> String {
        let key = make_peer_key(name, ip, port);
        self.lock().friends.insert(
            key.clone(),
            Friend {
                name: name.to_string(),
                ip: ip.to_string(),
                port,
                last_spoke: now,
            },
        );
        key
    }

    fn lock(&self) -> MutexGuard<'_, Contacts> {
        self.contacts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ContactStore for InMemoryContactStore {
    fn upsert_friend(&self, name: &str, ip: &str, port: u16) -> Result<String> {
        Ok(self.upsert_friend_at(name, ip, port, Utc::now()))
    }

    fn get_friends(&self) -> Result<Vec<Friend>> {
        let mut friends: Vec<Friend> = self.lock().friends.values().cloned().collect();
        friends.sort_by(|a, b| {
            b.last_spoke
                .cmp(&a.last_spoke)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.ip.cmp(&b.ip))
                .then_with(|| a.port.cmp(&b.port))
        });
        Ok(friends)
    }

    fn append_message(&self, key: &str, role: Role, text: &str) -> Result<()> {
        self.lock()
            .messages
            .entry(key.to_string())
            .or_default()
            .push(StoredMessage {
                role,
                text: text.to_string(),
                ts: Utc::now(),
            });
        Ok(())
    }

    fn get_messages(&self, key: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let contacts = self.lock();
        let history = contacts.messages.get(key).map_or(&[][..], Vec::as_slice);
        let start = if limit == 0 {
            0
        } else {
            history.len().saturating_sub(limit)
        };
        Ok(history[start..].to_vec())
    }
}
