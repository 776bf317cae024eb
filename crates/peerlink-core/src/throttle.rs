//! Per-connection pacing scaled by load.

use crate::load::Load;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Throttle configuration
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Spacing between messages when the relevant node is at full load
    pub base_spacing: Duration,
    /// Connection count treated as full load
    pub max_connections: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            base_spacing: Duration::from_millis(20),
            max_connections: 100,
        }
    }
}

impl ThrottleConfig {
    /// Minimum spacing for a node at `load`
    pub fn spacing(&self, load: Load) -> Duration {
        if self.max_connections == 0 {
            return self.base_spacing;
        }
        let ratio = (f64::from(load.num_connections) / f64::from(self.max_connections)).min(1.0);
        self.base_spacing.mul_f64(ratio)
    }
}

/// Enforces a minimum gap between consecutive sends and between
/// consecutive receives on one connection.
///
/// Sends are paced by the peer's load, receives by our own.
#[derive(Debug)]
pub struct ConnectionThrottle {
    config: ThrottleConfig,
    last_send: Mutex<Option<Instant>>,
    last_receive: Mutex<Option<Instant>>,
}

impl ConnectionThrottle {
    /// Create a throttle with no history
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            last_send: Mutex::new(None),
            last_receive: Mutex::new(None),
        }
    }

    /// Wait until a send is allowed for a peer at `peer_load`
    pub async fn throttle_send(&self, peer_load: Load) {
        Self::pace(&self.last_send, self.config.spacing(peer_load)).await;
    }

    /// Wait until a receive is allowed for our node at `my_load`
    pub async fn throttle_receive(&self, my_load: Load) {
        Self::pace(&self.last_receive, self.config.spacing(my_load)).await;
    }

    async fn pace(last: &Mutex<Option<Instant>>, spacing: Duration) {
        let mut last = last.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + spacing;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}
