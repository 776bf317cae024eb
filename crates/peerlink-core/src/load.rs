//! Node load: connection count used to scale difficulty and pacing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Snapshot of a node's load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Load {
    /// Number of open connections
    pub num_connections: u32,
}

/// Load assumed before a peer's real load is known
pub const INITIAL_LOAD: Load = Load { num_connections: 0 };

impl Load {
    /// Create a load snapshot
    #[must_use]
    pub const fn new(num_connections: u32) -> Self {
        Self { num_connections }
    }

    /// Load one difficulty step below this one.
    ///
    /// Difficulty scales with `ilog2(n + 1)`, so halving `n + 1` drops it by
    /// exactly one bit.
    #[must_use]
    pub const fn halved(self) -> Self {
        Self::new((self.num_connections.saturating_add(1) / 2).saturating_sub(1))
    }
}

impl fmt::Display for Load {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Load({})", self.num_connections)
    }
}

/// Live connection counter shared by a node's connection managers.
#[derive(Debug, Clone, Default)]
pub struct NetworkLoad {
    connections: Arc<AtomicU32>,
}

impl NetworkLoad {
    /// Create a counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Current load snapshot
    pub fn current(&self) -> Load {
        Load::new(self.connections.load(Ordering::Acquire))
    }

    /// Record a newly verified connection
    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::AcqRel);
    }

    /// Record a closed connection; saturates at zero
    pub fn connection_closed(&self) {
        let _ = self
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}
