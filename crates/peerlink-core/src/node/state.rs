//! Node lifecycle state machine

use crate::node::error::{NodeError, Result};
use std::fmt;
use std::sync::Mutex;
use tokio::sync::watch;

/// Node lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Constructed, not started
    New,
    /// `initialize()` in progress
    Starting,
    /// Accepting and opening connections
    Running,
    /// Shutdown in progress
    Stopping,
    /// Shut down; terminal
    Terminated,
}

impl NodeState {
    /// Returns true if `self -> to` is a documented edge
    #[must_use]
    pub const fn can_transition_to(self, to: NodeState) -> bool {
        matches!(
            (self, to),
            (NodeState::New, NodeState::Starting)
                | (NodeState::New, NodeState::Stopping)
                | (NodeState::Starting, NodeState::Running)
                | (NodeState::Starting, NodeState::Stopping)
                | (NodeState::Running, NodeState::Stopping)
                | (NodeState::Stopping, NodeState::Terminated)
        )
    }

    /// Returns true once shutdown has begun
    #[must_use]
    pub const fn is_shutting_down(self) -> bool {
        matches!(self, NodeState::Stopping | NodeState::Terminated)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Current state plus change notification.
///
/// Transitions are validated and applied under one lock so two callers racing
/// on the same edge cannot both succeed.
#[derive(Debug)]
pub(crate) struct StateMachine {
    state: Mutex<NodeState>,
    tx: watch::Sender<NodeState>,
}

impl StateMachine {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(NodeState::New);
        Self {
            state: Mutex::new(NodeState::New),
            tx,
        }
    }

    pub(crate) fn get(&self) -> NodeState {
        *self.lock()
    }

    /// Apply `current -> to` or fail with `InvalidStateTransition`
    pub(crate) fn transition(&self, to: NodeState) -> Result<NodeState> {
        let mut state = self.lock();
        let from = *state;
        if !from.can_transition_to(to) {
            return Err(NodeError::InvalidStateTransition { from, to });
        }
        *state = to;
        self.tx.send_replace(to);
        Ok(from)
    }

    /// Apply the transition only if the current state is `from`
    pub(crate) fn transition_from(&self, from: NodeState, to: NodeState) -> Result<()> {
        let mut state = self.lock();
        if *state != from || !from.can_transition_to(to) {
            return Err(NodeError::InvalidStateTransition { from: *state, to });
        }
        *state = to;
        self.tx.send_replace(to);
        Ok(())
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<NodeState> {
        self.tx.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NodeState> {
        // State is a Copy value; a poisoned lock still holds a valid state
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
