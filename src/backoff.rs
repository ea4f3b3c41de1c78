//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

/// Delay policy applied between failed publish or processing attempts.
///
/// The delay for attempt `n` (zero-based) is `min(base * 2^n, max)`, scaled
/// by a random factor in `[1 - jitter, 1]` so that workers retrying the same
/// outage do not hit the broker in lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Backoff {
    #[serde(with = "crate::config::duration_secs")]
    pub base: Duration,
    #[serde(with = "crate::config::duration_secs")]
    pub max: Duration,
    /// Fraction of the delay that may be shaved off at random, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Upper bound of the delay before attempt `attempt + 1`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Jittered delay before attempt `attempt + 1`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || ceiling.is_zero() {
            return ceiling;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=1.0);
        ceiling.mul_f64(factor)
    }
}
