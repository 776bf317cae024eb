//! Bounded retry with exponential backoff

use crate::node::error::{NodeError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Retry configuration with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,

    /// Delay after the first failure
    pub initial_backoff: Duration,

    /// Upper bound on any single delay, jitter included
    pub max_backoff: Duration,

    /// Growth factor between consecutive delays
    pub multiplier: f64,

    /// Fraction of each delay randomized in both directions; 0 disables
    pub jitter: f64,

    /// Wall-clock budget across all attempts
    pub max_total_duration: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.2,
            max_total_duration: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Delay before retrying after failed attempt number `attempt` (0-based).
    ///
    /// With jitter `j` the exponential delay `d` becomes a uniform pick from
    /// `[d * (1 - j), d * (1 + j)]`, still capped at `max_backoff`.
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let growth = self.multiplier.max(1.0).powi(exponent);
        let secs = self.initial_backoff.as_secs_f64() * growth;
        let delay = if secs.is_finite() && secs < self.max_backoff.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max_backoff
        };

        let spread = self.jitter.clamp(0.0, 1.0);
        if spread == 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(1.0 - spread..=1.0 + spread);
        delay.mul_f64(factor).min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt or
    /// duration budget is spent.
    ///
    /// # Errors
    /// Returns `StartupFailed` wrapping the last error once the budget is spent,
    /// or the first non-transient error unchanged.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => e,
            };
            attempt += 1;

            let backoff = self.backoff_duration(attempt - 1);
            let out_of_attempts = attempt >= self.max_attempts;
            let out_of_time = started.elapsed() + backoff > self.max_total_duration;
            if out_of_attempts || out_of_time {
                tracing::error!("{} failed after {} attempt(s): {}", what, attempt, err);
                return Err(NodeError::StartupFailed(
                    format!("{what}: {err} (after {attempt} attempts)").into(),
                ));
            }

            tracing::warn!(
                "{} attempt {} failed: {}; retrying in {:?}",
                what,
                attempt,
                err,
                backoff
            );
            tokio::time::sleep(backoff).await;
        }
    }
}
