//! Reconnection Policy
//!
//! Exponential backoff with jitter and an attempt budget for stream
//! reconnects. The budget counts consecutive failures; a connection that
//! reaches `Subscribed` resets it.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::WebSocketSettings;

/// Backoff parameters.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect.
    pub initial_delay: Duration,
    /// Delay ceiling.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Fraction of the delay randomized in both directions.
    pub jitter_factor: f64,
    /// Consecutive attempts before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from(&WebSocketSettings::default())
    }
}

impl From<&WebSocketSettings> for ReconnectConfig {
    fn from(settings: &WebSocketSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_delay_initial,
            max_delay: settings.reconnect_delay_max,
            multiplier: settings.reconnect_delay_multiplier,
            jitter_factor: 0.1,
            max_attempts: settings.max_reconnect_attempts,
        }
    }
}

/// Stateful backoff for one stream.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempts: u32,
}

impl ReconnectPolicy {
    /// Fresh policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let current_delay = config.initial_delay;
        Self {
            config,
            current_delay,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.config.max_attempts > 0 && self.attempts >= self.config.max_attempts {
            return None;
        }
        self.attempts += 1;

        let delay = self.jittered(self.current_delay);
        self.current_delay = self
            .current_delay
            .mul_f64(self.config.multiplier.max(1.0))
            .min(self.config.max_delay);
        Some(delay.min(self.config.max_delay))
    }

    /// Forget past failures.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempts = 0;
    }

    /// Consecutive attempts made so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return delay;
        }
        let spread = self.config.jitter_factor.min(1.0);
        let factor = rand::rng().random_range((1.0 - spread)..=(1.0 + spread));
        delay.mul_f64(factor)
    }
}
