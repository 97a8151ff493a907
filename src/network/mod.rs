//! Peer-to-peer networking
//!
//! Length-prefixed bincode frames over TCP. Each inbound connection is read on its own
//! thread; replies are dialed back to the sender's announced listening port.

pub mod message;
pub mod node;
pub mod peer_manager;
pub mod server;

pub use message::{Envelope, NodeId, NodeStatus, Package, PROTOCOL_VERSION};
pub use node::{Node, Nodes};
pub use peer_manager::PeerManager;
pub use server::{request_status, send_tx, Outgoing, Server};
