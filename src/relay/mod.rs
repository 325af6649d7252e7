//! Relay server for global discovery and store-and-forward messaging.
//!
//! Peers register their public address over `POST /api`, poll the peer
//! list, and may leave messages in per-recipient mailboxes. Live subscribers
//! on `/ws` get pushed messages as they arrive.

pub mod mailbox;
pub mod protocol;
pub mod push;
pub mod registry;
pub mod server;
pub mod shard;

pub use protocol::{ClientFrame, MailboxMessage, RelayEntry, RelayRequest, ServerFrame};
pub use server::{router, RelayHandle, RelayServer, RelayState};
