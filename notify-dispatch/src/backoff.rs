use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

// Keeps `1 << shift` inside a u32 multiplier.
const SHIFT_LIMIT: u32 = 31;

/// Capped exponential backoff with additive jitter.
///
/// `delay(n) = min(max, base * 2^min(n, max_shift)) + uniform[0, jitter]`
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: Duration,
    max_shift: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: Duration, max_shift: u32) -> Self {
        Self {
            base,
            max,
            jitter,
            max_shift,
        }
    }

    /// The deterministic part of the delay before retry `attempt + 1`.
    pub fn floor(&self, attempt: u32) -> Duration {
        let shift = attempt.min(self.max_shift).min(SHIFT_LIMIT);
        self.base.saturating_mul(1_u32 << shift).min(self.max)
    }

    pub fn delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.random_range(0..=jitter_ms))
        };
        self.floor(attempt).saturating_add(jitter)
    }

    /// Upper bound of any delay this schedule can produce.
    pub fn ceiling(&self) -> Duration {
        self.max.saturating_add(self.jitter)
    }
}

impl From<&BackoffConfig> for Backoff {
    fn from(config: &BackoffConfig) -> Self {
        Self::new(config.base, config.max, config.jitter, config.max_shift)
    }
}
