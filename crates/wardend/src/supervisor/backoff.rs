//! Exponential backoff for crash recovery

use rand::Rng;
use std::time::Duration;

/// Backoff policy
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First delay
    pub base: Duration,
    /// Ceiling on the delay
    pub cap: Duration,
    /// Fraction of the delay added as random jitter (0.0 disables)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

/// Per-slot backoff state; doubles on each failure, resets on success
#[derive(Debug, Clone)]
pub struct BackoffState {
    config: BackoffConfig,
    attempt: u32,
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next restart attempt
    pub fn next_backoff(&mut self) -> Duration {
        let exp = self.config.base.saturating_mul(1u32 << self.attempt.min(16));
        let delay = exp.min(self.config.cap);
        self.attempt = self.attempt.saturating_add(1);

        if self.config.jitter <= 0.0 {
            return delay;
        }
        let jitter = delay.mul_f64(rand::thread_rng().gen_range(0.0..self.config.jitter));
        (delay + jitter).min(self.config.cap)
    }

    /// Restart attempts recorded since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
