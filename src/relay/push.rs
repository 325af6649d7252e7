//! Live push rooms for WebSocket subscribers.
//!
//! Each socket gets an outbound channel; registering puts that channel in
//! the room named after the user id. Delivery is fire-and-forget: a closed
//! channel is pruned on the next delivery to its room.

use crate::relay::protocol::ServerFrame;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Outbound frame queue of one socket
pub type FrameSender = mpsc::UnboundedSender<ServerFrame>;

/// Rooms of live subscribers keyed by user id
#[derive(Default)]
pub struct PushHub {
    next_subscriber: AtomicU64,
    rooms: Mutex<HashMap<String, Vec<(u64, FrameSender)>>>,
}

impl PushHub {
    /// Create a hub with no rooms
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for a newly opened socket
    pub fn next_subscriber_id(&self) -> u64 {
        self.next_subscriber.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Put `subscriber` in `user_id`'s room (replacing an earlier sender).
    pub fn join(&self, user_id: &str, subscriber: u64, sender: FrameSender) {
        let mut rooms = self.lock();
        let room = rooms.entry(user_id.to_string()).or_default();
        room.retain(|(id, _)| *id != subscriber);
        room.push((subscriber, sender));
    }

    /// Remove `subscriber` from `user_id`'s room
    pub fn leave(&self, user_id: &str, subscriber: u64) {
        let mut rooms = self.lock();
        if let Some(room) = rooms.get_mut(user_id) {
            room.retain(|(id, _)| *id != subscriber);
            if room.is_empty() {
                rooms.remove(user_id);
            }
        }
    }

    /// Send `frame` to everyone in `user_id`'s room; returns how many got it
    pub fn deliver(&self, user_id: &str, frame: &ServerFrame) -> usize {
        let mut rooms = self.lock();
        let Some(room) = rooms.get_mut(user_id) else {
            return 0;
        };
        // Unbounded sends never wait, so holding the lock here does no I/O.
        room.retain(|(_, sender)| sender.send(frame.clone()).is_ok());
        let delivered = room.len();
        if room.is_empty() {
            rooms.remove(user_id);
        }
        delivered
    }

    /// Live subscribers in `user_id`'s room
    pub fn room_size(&self, user_id: &str) -> usize {
        self.lock().get(user_id).map_or(0, Vec::len)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<(u64, FrameSender)>>> {
        self.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }
}
