//! Reconnect delays for the Redis trigger

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

/// Exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt: `initial * multiplier^attempt`, capped
    /// at `max`, then jittered.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.config.multiplier.powi(self.attempt.min(32) as i32);
        let base = (self.config.initial.as_millis() as f64 * exp)
            .min(self.config.max.as_millis() as f64);
        self.attempt = self.attempt.saturating_add(1);

        let spread = base * self.config.jitter.clamp(0.0, 1.0);
        let delay = if spread >= 1.0 {
            base + rand::rng().random_range(-spread..spread)
        } else {
            base
        };
        Duration::from_millis(delay.max(1.0) as u64)
    }

    /// Call after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
