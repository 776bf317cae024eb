//! Listener traits for node and connection events

use crate::message::ApplicationMessage;
use crate::node::close_reason::CloseDetails;
use crate::node::connection::Connection;
use crate::node::state::NodeState;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Handle returned when registering a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next(counter: &AtomicU64) -> Self {
        ListenerId(counter.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Receives events from a [`Node`](crate::node::Node).
///
/// Callbacks run on the node's dispatcher task or on short-lived spawned
/// tasks, never on a connection manager loop and never while a connection
/// lock is held. Implementations may call back into the node.
pub trait NodeListener: Send + Sync {
    /// An authorized application message arrived
    fn on_message(&self, _message: &ApplicationMessage, _connection: &Connection) {}

    /// A connection finished its handshake
    fn on_connection(&self, _connection: &Connection) {}

    /// A connection was closed
    fn on_disconnect(&self, _connection: &Connection, _details: &CloseDetails) {}

    /// The node changed lifecycle state
    fn on_state_change(&self, _state: NodeState) {}
}

/// Notified once when a connection closes.
pub trait ConnectionListener: Send + Sync {
    /// Called exactly once per connection, on a spawned task
    fn on_closed(&self, connection: &Connection, details: &CloseDetails);
}
