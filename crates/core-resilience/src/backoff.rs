//! Reconnect backoff: exponential delay schedule with random jitter
//!
//! Each failed reconnection attempt doubles the base delay until the exponent
//! reaches its cap, after which the delay stays flat. A uniformly distributed
//! jitter is added on top so that many connections failing at the same moment
//! do not retry in lockstep.
//!
//! With the default configuration the jitter-free schedule is
//! `1s, 2s, 4s, 8s, 16s, 16s, ...`.
//!
//! # Example
//!
//! ```
//! use tether_core_resilience::backoff::{BackoffConfig, ReconnectBackoff};
//! use std::time::Duration;
//!
//! let mut backoff = ReconnectBackoff::new(BackoffConfig::default());
//!
//! let first = backoff.next_delay();
//! assert!(first > Duration::from_millis(1000));
//! assert!(first < Duration::from_millis(2000));
//! assert_eq!(backoff.attempts(), 1);
//! ```

use super::error::ResilienceError;
use rand::Rng;
use std::time::Duration;

/// Configuration for the reconnect backoff schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay applied to the first failed attempt (before jitter)
    pub base_delay: Duration,

    /// Largest exponent applied to `base_delay`; the multiplier caps at `2^max_exponent`
    pub max_exponent: u32,

    /// Smallest jitter added to every delay
    pub jitter_min: Duration,

    /// Largest jitter added to every delay
    pub jitter_max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_exponent: 4,
            jitter_min: Duration::from_millis(1),
            jitter_max: Duration::from_millis(999),
        }
    }
}

impl BackoffConfig {
    /// Schedule without jitter, useful for deterministic tests
    pub fn without_jitter(base_delay: Duration, max_exponent: u32) -> Self {
        Self {
            base_delay,
            max_exponent,
            jitter_min: Duration::ZERO,
            jitter_max: Duration::ZERO,
        }
    }

    /// Validate that the configuration describes a usable schedule
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.jitter_min > self.jitter_max {
            return Err(ResilienceError::InvalidConfig(format!(
                "jitter_min ({:?}) exceeds jitter_max ({:?})",
                self.jitter_min, self.jitter_max
            )));
        }
        if self.max_exponent > 20 {
            return Err(ResilienceError::InvalidConfig(format!(
                "max_exponent {} would overflow the delay schedule",
                self.max_exponent
            )));
        }
        Ok(())
    }

    /// Largest delay the schedule can produce, jitter excluded
    pub fn max_base_delay(&self) -> Duration {
        self.base_delay_for(self.max_exponent)
    }

    /// Jitter-free delay for the given exponent (saturated at `max_exponent`)
    pub fn base_delay_for(&self, exponent: u32) -> Duration {
        let exponent = exponent.min(self.max_exponent);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Stateful backoff tracker for a single reconnection loop
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    config: BackoffConfig,
    exponent: u32,
    attempts: u64,
}

impl ReconnectBackoff {
    /// Create a new backoff tracker starting at exponent zero
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            exponent: 0,
            attempts: 0,
        }
    }

    /// Number of delays handed out so far (i.e. failed attempts)
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Current exponent, saturating at `max_exponent`
    pub fn exponent(&self) -> u32 {
        self.exponent
    }

    /// The configuration driving this tracker
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Jitter-free delay the next call to [`next_delay`](Self::next_delay) will be based on
    pub fn peek_base_delay(&self) -> Duration {
        self.config.base_delay_for(self.exponent)
    }

    /// Record a failed attempt and return how long to wait before the next one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.peek_base_delay() + self.jitter();

        self.attempts += 1;
        if self.exponent < self.config.max_exponent {
            self.exponent += 1;
        }

        delay
    }

    /// Start the schedule over (after a successful reconnect)
    pub fn reset(&mut self) {
        self.exponent = 0;
        self.attempts = 0;
    }

    fn jitter(&self) -> Duration {
        let min = self.config.jitter_min.as_millis() as u64;
        let max = self.config.jitter_max.as_millis() as u64;

        if max <= min {
            return Duration::from_millis(min);
        }

        Duration::from_millis(rand::rng().random_range(min..=max))
    }
}
