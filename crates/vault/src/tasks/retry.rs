//! Exponential backoff with jitter.
//!
//! After failed attempt `k` (1-based) the next attempt waits
//! `unit * 2^(k-1)` plus a uniform jitter in `[0, unit * 2^(k-1))`.

use std::time::Duration;

use rand::Rng;

/// Largest exponent applied to the backoff unit.
const MAX_EXPONENT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub unit: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, unit: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            unit,
        }
    }

    /// Whether another attempt follows failed attempt `attempt`.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Deterministic part of the delay after failed attempt `attempt`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
        self.unit.saturating_mul(1u32 << exponent)
    }

    /// Full delay after failed attempt `attempt`, jitter included.
    pub fn delay_after<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        let span = u64::try_from(base.as_micros()).unwrap_or(u64::MAX);
        if span == 0 {
            return base;
        }
        base + Duration::from_micros(rng.gen_range(0..span))
    }
}
