//! Retry/backoff envelope shared by the worker runtime's per-step retry
//! (§4.4) and the dispatcher's DLQ reprocessing (§4.5).

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub enum BackoffStrategy {
    Fixed { delay_ms: u64 },
    Exponential {
        base_ms: u64,
        multiplier: f64,
        max_delay_ms: u64,
    },
}

impl BackoffStrategy {
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let ms = match *self {
            BackoffStrategy::Fixed { delay_ms } => delay_ms,
            BackoffStrategy::Exponential {
                base_ms,
                multiplier,
                max_delay_ms,
            } => {
                let scaled = base_ms as f64 * multiplier.powi(attempt as i32);
                (scaled as u64).min(max_delay_ms)
            }
        };
        Duration::from_millis(ms)
    }

    /// Adds +/-25% jitter so retrying tasks/DLQ entries don't all wake up on
    /// the same tick.
    pub fn with_jitter(&self, attempt: u32) -> Duration {
        let base = self.calculate_delay(attempt).as_millis() as f64;
        let jitter_factor = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_millis((base * jitter_factor) as u64)
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        // Base 60s exponential backoff, matching the worker runtime's
        // retry-envelope requirement in §4.4 step 7.
        BackoffStrategy::Exponential {
            base_ms: 60_000,
            multiplier: 2.0,
            max_delay_ms: 30 * 60_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffStrategy::default(),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.jitter {
            self.backoff.with_jitter(attempt)
        } else {
            self.backoff.calculate_delay(attempt)
        }
    }

    /// Generic retry wrapper kept for ambient use (connectors, background
    /// sweeps); the task-level retry envelope in §4.4 tracks attempts itself
    /// since it must publish an event per attempt, not only at the end.
    pub async fn execute<F, Fut, T, E>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_retries => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(attempt, %err, delay_ms = delay.as_millis() as u64, "retrying after failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    debug!(attempt, %err, "retries exhausted");
                    return Err(err);
                }
            }
        }
    }
}

/// Recognized transient failures, matching the DLQ reprocessor's lexicon in
/// §4.5.
pub const TRANSIENT_ERROR_LEXICON: &[&str] = &[
    "timeout",
    "connection",
    "network",
    "rate limit",
    "overload",
    "busy",
    "unavailable",
];

pub fn looks_transient(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_ERROR_LEXICON.iter().any(|needle| lower.contains(needle))
}
