//! Node orchestration layer for PeerLink
//!
//! This module provides the high-level Node API that coordinates:
//! - Transport selection (clear-net, Tor, I2P via peerlink-transport)
//! - The authorized capability handshake
//! - Inbound and outbound connection managers
//! - Message dispatch to listeners and request tracking
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     NodesById                            │
//! ├─────────────────────────────────────────────────────────┤
//! │   Node  (state machine, dispatcher, listeners)          │
//! ├─────────────────────────────────────────────────────────┤
//! │   PeerConnectionsManager                                 │
//! │     Inbound loop  │  Outbound loop                       │
//! ├─────────────────────────────────────────────────────────┤
//! │   Connection  │  Handshake  │  Authorization  │ Throttle │
//! ├─────────────────────────────────────────────────────────┤
//! │   Transport                                              │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use peerlink_core::message::ApplicationMessage;
//! use peerlink_core::node::{Node, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = Node::new("alice", NodeConfig::default());
//!     node.initialize(0).await?;
//!
//!     let peer = "127.0.0.1:9000".parse()?;
//!     node.send(ApplicationMessage::new("chat", b"hello".to_vec()), &peer).await?;
//!
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod close_reason;
pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod inbound;
pub mod listener;
#[allow(clippy::module_inception)]
pub mod node;
pub mod outbound;
pub mod peer_connections;
pub mod registry;
pub mod request_response;
pub mod retry;
pub mod state;

pub use close_reason::{CloseDetails, CloseReason};
pub use config::{ConnectionConfig, NodeConfig};
pub use connection::{Connection, ConnectionStats, Direction};
pub use error::{ConnectionError, NodeError, Reason, Result};
pub use handshake::{
    ConnectionHandshake, ConnectionHandshakeResponder, HandshakeContext, HandshakeMetrics,
    HandshakeOutcome,
};
pub use inbound::InboundConnectionManager;
pub use listener::{ConnectionListener, ListenerId, NodeListener};
pub use node::{Node, NodeStats};
pub use outbound::OutboundConnectionManager;
pub use peer_connections::PeerConnectionsManager;
pub use registry::NodesById;
pub use request_response::{RequestResponseManager, RequestStats};
pub use retry::RetryConfig;
pub use state::NodeState;

use crate::load::NetworkLoad;
use crate::message::Envelope;
use crate::throttle::ThrottleConfig;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Random 128-bit identifier rendered as hex
pub(crate) fn random_id() -> String {
    let mut bytes = [0u8; 16];
    if getrandom::getrandom(&mut bytes).is_err() {
        bytes = rand::random();
    }
    hex::encode(bytes)
}

/// Envelope read from a verified connection, queued for the node dispatcher
pub(crate) struct IncomingMessage {
    pub(crate) connection: Connection,
    pub(crate) envelope: Envelope,
}

/// Shared wiring handed to both connection managers
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub(crate) node_id: Arc<str>,
    pub(crate) handshake: HandshakeContext,
    pub(crate) load: NetworkLoad,
    pub(crate) config: ConnectionConfig,
    pub(crate) throttle: ThrottleConfig,
    pub(crate) dispatch: mpsc::Sender<IncomingMessage>,
    pub(crate) observer: Arc<node::NodeObserver>,
}
