//! Reconnect backoff.

use std::time::Duration;

use rand::Rng;

use hubsync_core::config::StreamConfig;

/// Exponential backoff with symmetric jitter, capped.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomised in both directions.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for BackoffPolicy {
    fn from(config: &StreamConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.backoff_initial_ms),
            max: Duration::from_millis(config.backoff_max_ms),
            multiplier: config.backoff_multiplier,
            jitter: config.backoff_jitter,
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect number `attempt` (0-based), with `unit` in
    /// `[-1, 1]` selecting the jitter.
    pub fn delay(&self, attempt: u32, unit: f64) -> Duration {
        let base = self.initial.as_millis() as f64 * self.multiplier.powi(attempt.min(32) as i32);
        let capped = base.min(self.max.as_millis() as f64);
        let jittered = capped * (1.0 + self.jitter * unit.clamp(-1.0, 1.0));
        Duration::from_millis(jittered.clamp(0.0, self.max.as_millis() as f64).round() as u64)
    }
}

/// Backoff state for one reconnect loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&mut self) -> Duration {
        let unit = rand::thread_rng().gen_range(-1.0..=1.0);
        let delay = self.policy.delay(self.attempt, unit);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Called once a connection has delivered a snapshot.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
