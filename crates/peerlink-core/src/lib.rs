//! # PeerLink Core
//!
//! Transport-agnostic peer-to-peer networking core.
//!
//! This crate provides:
//! - Capability and load value types exchanged in handshakes
//! - Wire envelopes and length-prefixed framing
//! - Proof-of-work message authorization scaled by load
//! - Per-connection throttling
//! - The node: handshakes, inbound/outbound connection managers, message
//!   dispatch and request tracking
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Node                                   │
//! │   (lifecycle, dispatcher, listeners, request tracking)          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                       Connections                                │
//! │   (handshake-verified, authorized, throttled)                   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Envelopes                                │
//! │   (version + authorization token + message, framed)             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod ban_list;
pub mod capability;
pub mod frame;
pub mod load;
pub mod message;
pub mod node;
pub mod throttle;

pub use auth::{
    AuthError, AuthorizationService, AuthorizationToken, ProofOfWork, ProofOfWorkAuthorization,
    ProofOfWorkConfig,
};
pub use ban_list::BanList;
pub use capability::Capability;
pub use frame::{FrameError, MAX_FRAME_LEN};
pub use load::{INITIAL_LOAD, Load, NetworkLoad};
pub use message::{ApplicationMessage, Correlation, Envelope, NetworkMessage, PROTOCOL_VERSION};
pub use node::{
    CloseDetails, CloseReason, Connection, ConnectionError, Direction, Node, NodeConfig,
    NodeError, NodeListener, NodeState, NodesById,
};
pub use peerlink_transport::{Address, TransportType};
pub use throttle::{ConnectionThrottle, ThrottleConfig};
