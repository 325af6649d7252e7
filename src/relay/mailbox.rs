//! Store-and-forward mailboxes, one bounded queue per recipient.

use crate::relay::protocol::{unix_seconds, MailboxMessage};
use crate::relay::shard::ShardedMap;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sharded `user_id -> mailbox` map with relay-wide message ids
pub struct Mailboxes {
    capacity: usize,
    next_id: AtomicU64,
    boxes: ShardedMap<VecDeque<MailboxMessage>>,
}

impl Mailboxes {
    /// Create an empty set of mailboxes holding at most `capacity` messages each
    pub fn new(shard_count: usize, capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(0),
            boxes: ShardedMap::new(shard_count),
        }
    }

    /// Per-recipient cap
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Ensure `user_id` has a mailbox; returns true if it was created
    pub fn register(&self, user_id: &str) -> bool {
        self.boxes.with_shard(user_id, |shard| {
            if shard.contains_key(user_id) {
                false
            } else {
                shard.insert(user_id.to_string(), VecDeque::new());
                true
            }
        })
    }

    /// Append a message for `recipient`, keeping only the newest `capacity`
    pub fn push_at(&self, sender: &str, recipient: &str, text: &str, now: DateTime<Utc>) -> MailboxMessage {
        self.boxes.with_shard(recipient, |shard| {
            // Ids are taken under the shard lock so each mailbox stays ascending.
            let message = MailboxMessage {
                id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
                sender: sender.to_string(),
                text: text.to_string(),
                timestamp: unix_seconds(now),
            };
            let mailbox = shard.entry(recipient.to_string()).or_default();
            mailbox.push_back(message.clone());
            while mailbox.len() > self.capacity {
                mailbox.pop_front();
            }
            message
        })
    }

    /// Messages for `user_id` with `id > since_id`, ascending.
    ///
    /// Fetching an unknown user returns nothing and leaves no mailbox behind.
    pub fn since(&self, user_id: &str, since_id: u64) -> Vec<MailboxMessage> {
        self.boxes.with_shard(user_id, |shard| {
            shard.get(user_id).map_or_else(Vec::new, |mailbox| {
                mailbox.iter().filter(|message| message.id > since_id).cloned().collect()
            })
        })
    }

    /// Number of mailboxes
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    /// Whether no mailbox exists
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}
