//! Optimistic retry for read-modify-write operations.
//!
//! Wraps any closure that re-reads a document, mutates it and writes it back
//! with a version check. Only conflict-class failures are retried; every
//! other error returns immediately.

use crate::error::CoreError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Errors that can signal a lost write race.
pub trait Conflicting {
    /// Whether retrying the read-modify-write may succeed.
    fn is_conflict(&self) -> bool;
}

impl Conflicting for CoreError {
    fn is_conflict(&self) -> bool {
        CoreError::is_conflict(self)
    }
}

/// Backoff curve and attempt budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Growth factor between attempts.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Randomize each delay by ±30%.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    10
}

fn default_max_backoff() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            multiplier: default_multiplier(),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let base = (self.initial_backoff_ms as f64 * exp).min(self.max_backoff_ms as f64);
        let millis = if self.jitter {
            base * rand::thread_rng().gen_range(0.7..1.3)
        } else {
            base
        };
        Duration::from_millis(millis as u64)
    }
}

/// Run `f` until it succeeds, fails with a non-conflict error, or the
/// attempt budget is spent. The last conflict is returned on exhaustion.
///
/// # Errors
///
/// Returns the first non-conflict error, or the final conflict.
pub async fn retry_on_conflict<F, Fut, T, E>(policy: &RetryPolicy, op: &str, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Conflicting + std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_conflict() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                debug!(op, attempt, delay_ms = delay.as_millis() as u64, "Write conflict, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_conflict() {
                    warn!(op, attempts = attempt, error = %e, "Write conflict retries exhausted");
                }
                return Err(e);
            }
        }
    }
}
