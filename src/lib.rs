//! # Peerline
//!
//! Serverless peer-to-peer text chat plumbing: LAN discovery, direct
//! line-protocol connections and an optional relay for reaching peers
//! across networks.
//!
//! ## Features
//!
//! - **LAN Discovery**: UDP presence beacons with per-instance tokens
//! - **Direct Connections**: newline-delimited UTF-8 over TCP, one receive loop per socket
//! - **Global Discovery**: public-IP detection and presence polling through a relay
//! - **Relay Server**: presence registry, store-and-forward mailboxes and a WebSocket push channel
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use peerline::{Node, PeerlineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = Node::new(PeerlineConfig::default())?;
//!     let port = node.start().await?;
//!     println!("listening on {port}");
//!     while let Some(event) = node.next_event().await {
//!         println!("{event}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`network`]: presence beacons, global discovery and the relay client
//! - [`transport`]: line codec, peer connections and the inbox listener
//! - [`relay`]: the relay server
//! - [`storage`]: contact and history storage boundary
//! - [`utils`]: configuration and error handling

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod network;
pub mod relay;
pub mod storage;
pub mod transport;
pub mod utils;

// Re-export commonly used types for convenience
pub use app::{ConnectionId, Node, NodeEvent};
pub use network::{GlobalDiscovery, PeerRecord, PresenceBeacon, RelayClient};
pub use relay::{RelayHandle, RelayServer};
pub use storage::{ContactStore, InMemoryContactStore};
pub use transport::{Inbound, InboxListener, PeerConnection};
pub use utils::{PeerlineConfig, PeerlineError, Result};

/// Default configuration values
pub mod defaults {
    /// Shared UDP port for presence beacons
    pub const BEACON_PORT: u16 = 54545;

    /// Default relay HTTP port
    pub const RELAY_PORT: u16 = 5000;

    /// Outbound TCP connect timeout in milliseconds
    pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

    /// Receive poll interval for connection loops in milliseconds
    pub const RECV_TIMEOUT_MS: u64 = 600;

    /// Upper bound when joining background loops, in milliseconds
    pub const JOIN_TIMEOUT_MS: u64 = 2_000;
}
