//! Error types for the node API
//!
//! Two layers of errors exist:
//!
//! - [`ConnectionError`]: a typed fault raised by a single handshake or
//!   connection, tagged with a [`Reason`]. A connection that produced one is
//!   dead and must not be reused.
//! - [`NodeError`]: everything the node API can return, categorised to support
//!   retry logic.
//!
//! # Error Categories
//!
//! - **Transient**: may succeed on retry (timeouts, transport failures, backpressure)
//! - **Permanent**: will not succeed without intervention (bad state, unknown node)
//!
//! # Example
//!
//! ```no_run
//! use peerlink_core::node::NodeError;
//!
//! fn handle_error(err: NodeError) {
//!     if err.is_transient() {
//!         println!("Transient error, may retry: {}", err);
//!     } else {
//!         println!("Permanent error: {}", err);
//!     }
//! }
//! ```

use crate::auth::AuthError;
use crate::frame::FrameError;
use crate::node::state::NodeState;
use peerlink_transport::TransportError;
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

/// Why a handshake or connection failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    /// Peer speaks a different protocol version
    ProtocolVersionMismatch,
    /// Envelope missing or undecodable
    MissingPayload,
    /// Valid envelope carrying the wrong message type
    UnexpectedMessage,
    /// Token did not verify
    AuthorizationFailed,
    /// Peer address is on the ban list
    AddressBanned,
    /// Any other handshake failure
    HandshakeFailed,
    /// Connection already closed
    Closed,
    /// Socket error
    Io,
    /// Operation timed out
    Timeout,
    /// Transport could not provide a socket
    Transport,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reason::ProtocolVersionMismatch => "protocol version mismatch",
            Reason::MissingPayload => "missing payload",
            Reason::UnexpectedMessage => "unexpected message",
            Reason::AuthorizationFailed => "authorization failed",
            Reason::AddressBanned => "address banned",
            Reason::HandshakeFailed => "handshake failed",
            Reason::Closed => "connection closed",
            Reason::Io => "I/O error",
            Reason::Timeout => "timed out",
            Reason::Transport => "transport error",
        };
        f.write_str(name)
    }
}

/// Fault raised by a handshake or an established connection
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{reason}: {details}")]
pub struct ConnectionError {
    /// Failure category
    pub reason: Reason,
    /// Human-readable context
    pub details: Cow<'static, str>,
}

impl ConnectionError {
    /// Create an error with owned or static details
    pub fn new(reason: Reason, details: impl Into<Cow<'static, str>>) -> Self {
        Self {
            reason,
            details: details.into(),
        }
    }

    /// Connection is closed (zero allocation)
    #[must_use]
    pub const fn closed(context: &'static str) -> Self {
        Self {
            reason: Reason::Closed,
            details: Cow::Borrowed(context),
        }
    }

    /// Returns true if the fault came from the peer violating the protocol
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self.reason,
            Reason::ProtocolVersionMismatch
                | Reason::MissingPayload
                | Reason::UnexpectedMessage
                | Reason::AuthorizationFailed
                | Reason::AddressBanned
        )
    }
}

impl From<FrameError> for ConnectionError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => ConnectionError::new(Reason::Io, e.to_string()),
            other => ConnectionError::new(Reason::MissingPayload, other.to_string()),
        }
    }
}

impl From<AuthError> for ConnectionError {
    fn from(err: AuthError) -> Self {
        ConnectionError::new(Reason::HandshakeFailed, err.to_string())
    }
}

impl From<TransportError> for ConnectionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(msg) => ConnectionError::new(Reason::Timeout, msg),
            other => ConnectionError::new(Reason::Transport, other.to_string()),
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        ConnectionError::new(Reason::Io, err.to_string())
    }
}

/// Errors that can occur in node operations
#[derive(Debug, Error, Clone)]
pub enum NodeError {
    // ============ Transport Errors ============
    /// Failed to initialize transport layer
    #[error("Transport initialization failed: {0}")]
    TransportInit(Cow<'static, str>),

    /// Transport operation failed
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    // ============ Connection Errors ============
    /// Handshake or connection fault
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    // ============ State Errors ============
    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Undocumented lifecycle edge
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        /// Current state
        from: NodeState,
        /// Requested state
        to: NodeState,
    },

    /// Startup retries exhausted
    #[error("Startup failed: {0}")]
    StartupFailed(Cow<'static, str>),

    // ============ Operational Errors ============
    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(Cow<'static, str>),

    /// Channel send/receive error
    #[error("Channel error: {0}")]
    Channel(Cow<'static, str>),

    /// Unknown node or connection
    #[error("Not found: {0}")]
    NotFound(Cow<'static, str>),
}

impl NodeError {
    /// Returns true if this error is transient and may succeed on retry
    ///
    /// Transient errors include:
    /// - Timeouts
    /// - Transport failures (bind races, proxy still starting)
    /// - Channel errors (temporary backpressure)
    /// - Connection I/O and timeout faults
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            NodeError::Timeout(_)
            | NodeError::Transport(_)
            | NodeError::TransportInit(_)
            | NodeError::Channel(_) => true,
            NodeError::Connection(e) => matches!(
                e.reason,
                Reason::Io | Reason::Timeout | Reason::Transport | Reason::Closed
            ),
            _ => false,
        }
    }

    /// Returns true if this error is permanent and will not succeed on retry
    ///
    /// Permanent errors include:
    /// - Invalid state and state transitions
    /// - Exhausted startup
    /// - Unknown nodes
    /// - Protocol violations by the peer
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        match self {
            NodeError::InvalidState(_)
            | NodeError::InvalidStateTransition { .. }
            | NodeError::StartupFailed(_)
            | NodeError::NotFound(_) => true,
            NodeError::Connection(e) => e.is_protocol_violation(),
            _ => false,
        }
    }

    /// Create a transport error with static context (zero allocation)
    #[must_use]
    pub const fn transport(context: &'static str) -> Self {
        NodeError::Transport(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        NodeError::Timeout(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        NodeError::InvalidState(Cow::Borrowed(context))
    }

    /// Create a serialization error with static context (zero allocation)
    #[must_use]
    pub const fn serialization(context: &'static str) -> Self {
        NodeError::Serialization(Cow::Borrowed(context))
    }

    /// Create a channel error with static context (zero allocation)
    #[must_use]
    pub const fn channel(context: &'static str) -> Self {
        NodeError::Channel(Cow::Borrowed(context))
    }

    /// The connection fault, if this error wraps one
    pub fn as_connection_error(&self) -> Option<&ConnectionError> {
        match self {
            NodeError::Connection(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for NodeError {
    fn from(err: TransportError) -> Self {
        NodeError::Transport(err.to_string().into())
    }
}

/// Result type for node operations
pub type Result<T> = std::result::Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(NodeError::Timeout(Cow::Borrowed("test")).is_transient());
        assert!(NodeError::Transport(Cow::Borrowed("test")).is_transient());
        assert!(NodeError::TransportInit(Cow::Borrowed("test")).is_transient());
        assert!(NodeError::Channel(Cow::Borrowed("test")).is_transient());
        assert!(NodeError::from(ConnectionError::new(Reason::Io, "reset")).is_transient());
    }

    #[test]
    fn test_permanent_errors() {
        assert!(NodeError::invalid_state("test").is_permanent());
        assert!(
            NodeError::InvalidStateTransition {
                from: NodeState::Running,
                to: NodeState::Starting,
            }
            .is_permanent()
        );
        assert!(NodeError::StartupFailed(Cow::Borrowed("test")).is_permanent());
        assert!(
            NodeError::from(ConnectionError::new(Reason::AddressBanned, "peer")).is_permanent()
        );
    }

    #[test]
    fn test_mutual_exclusivity() {
        let errors = [
            NodeError::timeout("t"),
            NodeError::transport("t"),
            NodeError::invalid_state("t"),
            NodeError::NotFound(Cow::Borrowed("t")),
            NodeError::from(ConnectionError::new(Reason::Timeout, "t")),
            NodeError::from(ConnectionError::new(Reason::AuthorizationFailed, "t")),
        ];
        for err in &errors {
            assert!(!(err.is_transient() && err.is_permanent()), "{err}");
        }
    }

    #[test]
    fn test_error_display() {
        let err = ConnectionError::new(Reason::ProtocolVersionMismatch, "peer sent 7");
        assert_eq!(err.to_string(), "protocol version mismatch: peer sent 7");

        let err = NodeError::InvalidStateTransition {
            from: NodeState::Terminated,
            to: NodeState::Starting,
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition: Terminated -> Starting"
        );
    }

    #[test]
    fn test_conversions() {
        let err: ConnectionError = TransportError::Timeout("dial".to_string()).into();
        assert_eq!(err.reason, Reason::Timeout);

        let err: ConnectionError = TransportError::Closed.into();
        assert_eq!(err.reason, Reason::Transport);

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: ConnectionError = FrameError::Io(io).into();
        assert_eq!(err.reason, Reason::Io);

        let node_err = NodeError::from(ConnectionError::closed("gone"));
        assert_eq!(
            node_err.as_connection_error().map(|e| e.reason),
            Some(Reason::Closed)
        );
    }
}
