//! Network layer for peer discovery.
//!
//! This module provides LAN discovery through UDP presence beacons and
//! internet-scale discovery through a relay, both feeding TTL-bounded peer
//! tables.

pub mod global;
pub mod peers;
pub mod presence;
pub mod relay_client;

pub use global::{detect_public_ip, make_peer_id, GlobalDiscovery};
pub use peers::{sort_records, PeerRecord, PeerTable};
pub use presence::{BeaconPacket, PresenceBeacon};
pub use relay_client::RelayClient;
