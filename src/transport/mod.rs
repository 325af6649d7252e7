//! Line-protocol transport between peers.
//!
//! This module provides the newline framing codec, the single-socket peer
//! connection with its inbound queue, and the TCP inbox listener that hands
//! accepted sockets to the application.

pub mod codec;
pub mod connection;
pub mod inbox;

pub use codec::LineCodec;
pub use connection::{ConnectionOptions, ConnectionState, Inbound, PeerConnection};
pub use inbox::{Acceptor, InboxListener};
