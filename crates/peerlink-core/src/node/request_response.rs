//! Outstanding request tracking
//!
//! Application requests carry a request id; responses echo it. The manager
//! records which connection each request left on and when, reports the
//! round trip when its response arrives, and lets the node hold a graceful
//! close until a connection's requests are answered. Entries that never get
//! an answer are pruned once they exceed the configured age, checked at most
//! once per prune interval from the send and receive paths.

use crate::message::ApplicationMessage;
use crate::node::connection::Connection;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Round-trip statistics for answered requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestStats {
    /// Requests answered
    pub answered: u64,
    /// Requests pruned without an answer
    pub expired: u64,
    /// Requests dropped because their connection closed first
    pub abandoned: u64,
    /// Responses that matched no pending request
    pub unmatched: u64,
    /// Mean round trip of answered requests
    pub mean_round_trip: Duration,
}

#[derive(Debug)]
struct PendingRequest {
    connection_id: String,
    sent_at: Instant,
}

/// Tracks requests awaiting a response
#[derive(Debug)]
pub struct RequestResponseManager {
    pending: DashMap<String, PendingRequest>,
    /// Signalled whenever pending entries are removed
    removed: Notify,
    max_age: Duration,
    prune_interval: Duration,
    last_prune: Mutex<Instant>,
    answered: AtomicU64,
    expired: AtomicU64,
    abandoned: AtomicU64,
    unmatched: AtomicU64,
    total_round_trip_us: AtomicU64,
}

impl RequestResponseManager {
    /// Create a manager that forgets requests older than `max_age`
    pub fn new(max_age: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            removed: Notify::new(),
            max_age,
            prune_interval: (max_age / 10).max(Duration::from_millis(100)),
            last_prune: Mutex::new(Instant::now()),
            answered: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            unmatched: AtomicU64::new(0),
            total_round_trip_us: AtomicU64::new(0),
        }
    }

    /// Record a message sent on `connection_id`; only requests are tracked
    pub fn on_sent(&self, message: &ApplicationMessage, connection_id: &str) {
        self.maybe_prune();
        let Some(id) = message.request_id() else {
            return;
        };
        let request = PendingRequest {
            connection_id: connection_id.to_string(),
            sent_at: Instant::now(),
        };
        match self.pending.entry(id.to_string()) {
            Entry::Occupied(mut entry) => {
                tracing::warn!("Request {} sent again before a response arrived", id);
                entry.insert(request);
            }
            Entry::Vacant(entry) => {
                entry.insert(request);
            }
        }
    }

    /// Record an incoming message; returns the round trip for a matched response
    pub fn on_received(&self, message: &ApplicationMessage) -> Option<Duration> {
        self.maybe_prune();
        let id = message.response_id()?;
        match self.pending.remove(id) {
            Some((_, request)) => {
                self.removed.notify_waiters();
                let round_trip = request.sent_at.elapsed();
                self.answered.fetch_add(1, Ordering::Relaxed);
                self.total_round_trip_us
                    .fetch_add(round_trip.as_micros() as u64, Ordering::Relaxed);
                tracing::trace!("Response {} after {:?}", id, round_trip);
                Some(round_trip)
            }
            None => {
                self.unmatched.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Response {} matches no pending request", id);
                None
            }
        }
    }

    /// Drop tracking for a request whose send failed
    pub fn forget(&self, request_id: &str) -> bool {
        let removed = self.pending.remove(request_id).is_some();
        if removed {
            self.removed.notify_waiters();
        }
        removed
    }

    /// Drop every request sent on a closed connection; returns how many
    pub fn forget_connection(&self, connection_id: &str) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, request| request.connection_id != connection_id);
        let removed = before.saturating_sub(self.pending.len());
        if removed > 0 {
            self.abandoned.fetch_add(removed as u64, Ordering::Relaxed);
            self.removed.notify_waiters();
            tracing::debug!(
                "Abandoned {} unanswered request(s) on {}",
                removed,
                connection_id
            );
        }
        removed
    }

    /// Number of requests awaiting a response
    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// Number of requests sent on `connection` awaiting a response
    pub fn num_pending_for(&self, connection: &Connection) -> usize {
        self.pending_on(connection.id())
    }

    /// True if `connection` carries a request that has not been answered
    pub fn has_pending_for(&self, connection: &Connection) -> bool {
        self.num_pending_for(connection) > 0
    }

    /// True if `request_id` is awaiting a response
    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    /// Wait until `connection` has no unanswered requests or `limit` passes.
    ///
    /// Returns true if every request on the connection was resolved.
    pub async fn wait_for_responses(&self, connection: &Connection, limit: Duration) -> bool {
        let drained = async {
            loop {
                // Registered before the check so a removal in between is not missed
                let removed = self.removed.notified();
                if self.pending_on(connection.id()) == 0 {
                    return;
                }
                removed.await;
            }
        };
        tokio::time::timeout(limit, drained).await.is_ok()
    }

    /// Remove entries older than the max age; returns how many were removed
    pub fn prune(&self) -> usize {
        let before = self.pending.len();
        let max_age = self.max_age;
        self.pending
            .retain(|_, request| request.sent_at.elapsed() <= max_age);
        let removed = before.saturating_sub(self.pending.len());
        if removed > 0 {
            self.expired.fetch_add(removed as u64, Ordering::Relaxed);
            self.removed.notify_waiters();
            tracing::debug!("Pruned {} unanswered request(s)", removed);
        }
        removed
    }

    /// Snapshot of request counters
    pub fn stats(&self) -> RequestStats {
        let answered = self.answered.load(Ordering::Relaxed);
        let total = self.total_round_trip_us.load(Ordering::Relaxed);
        RequestStats {
            answered,
            expired: self.expired.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            mean_round_trip: if answered == 0 {
                Duration::ZERO
            } else {
                Duration::from_micros(total / answered)
            },
        }
    }

    fn pending_on(&self, connection_id: &str) -> usize {
        self.pending
            .iter()
            .filter(|entry| entry.value().connection_id == connection_id)
            .count()
    }

    fn maybe_prune(&self) {
        {
            let Ok(mut last) = self.last_prune.try_lock() else {
                return;
            };
            if last.elapsed() < self.prune_interval {
                return;
            }
            *last = Instant::now();
        }
        self.prune();
    }
}

impl Default for RequestResponseManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(5 * 60))
    }
}
