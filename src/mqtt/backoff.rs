//! Reconnection backoff with jitter.
//!
//! ```text
//! wait = min(max, min + 2^attempt * uniform(0.8 * base, base))
//! ```
//!
//! The attempt counter saturates at [`MAX_ATTEMPT`] so the exponent stays
//! bounded, and drops back to zero after a successful connect.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

pub const MAX_ATTEMPT: u32 = 20;
const JITTER_LOW: f64 = 0.8;

/// Wait before the next connect attempt.
pub fn compute_wait<R: Rng + ?Sized>(config: &BackoffConfig, attempt: u32, rng: &mut R) -> Duration {
    let attempt = attempt.min(MAX_ATTEMPT);
    let base = config.base_ms as f64;
    let low = JITTER_LOW * base;
    let jitter = if base > low { rng.gen_range(low..=base) } else { base };
    let grown = (1u64 << attempt) as f64 * jitter;
    let wait_ms = (config.min_ms as f64 + grown).min(config.max_ms as f64);
    Duration::from_millis(wait_ms as u64)
}

#[derive(Debug, Clone)]
pub struct BackoffState {
    config: BackoffConfig,
    attempt: u32,
    current_wait: Duration,
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            current_wait: Duration::ZERO,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_wait = Duration::ZERO;
    }

    /// Records a failed attempt and returns how long to sleep before the next one.
    pub fn advance<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        self.current_wait = compute_wait(&self.config, self.attempt, rng);
        self.attempt = (self.attempt + 1).min(MAX_ATTEMPT);
        self.current_wait
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn current_wait(&self) -> Duration {
        self.current_wait
    }
}
