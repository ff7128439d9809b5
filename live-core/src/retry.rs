//! Reconnect backoff policy.
//!
//! Exponential backoff with multiplicative jitter, so that clients dropped by
//! the same server restart do not all come back at the same instant. The
//! first `min_count` attempts use a short fixed delay, which keeps transient
//! blips (such as a dev-mode server restart) nearly invisible.

use std::time::Duration;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay scale for the exponential part.
    pub base_timeout: Duration,
    /// Growth factor per attempt.
    pub exponent: f64,
    /// Upper bound on any delay.
    pub max_timeout: Duration,
    /// Fixed delay for the first `min_count` attempts.
    pub min_timeout: Duration,
    /// How many attempts use `min_timeout`.
    pub min_count: u32,
    /// Width of the jitter band as a fraction (0.5 means ±25%).
    pub fuzz: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_timeout: Duration::from_millis(1000),
            exponent: 2.2,
            max_timeout: Duration::from_millis(5 * 60 * 1000),
            min_timeout: Duration::from_millis(10),
            min_count: 2,
            fuzz: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt number `count` (0-based), with random jitter.
    pub fn timeout(&self, count: u32) -> Duration {
        self.timeout_with_fraction(count, rand::random::<f64>())
    }

    /// Delay before attempt `count` for a given jitter draw in `[0, 1)`.
    ///
    /// Below `min_count` the result is exactly `min_timeout`. Otherwise the
    /// draw is spread uniformly over the part of the band
    /// `[1 - fuzz/2, 1 + fuzz/2]` (times the exponential delay) that lies at
    /// or below `max_timeout`. Saturated delays stay spread over
    /// `[max * (1 - fuzz/2), max]` instead of piling up on `max`.
    pub fn timeout_with_fraction(&self, count: u32, fraction: f64) -> Duration {
        if count < self.min_count {
            return self.min_timeout;
        }
        let unfuzzed_ms = self.unfuzzed_ms(count);
        let max_ms = self.max_timeout.as_secs_f64() * 1000.0;
        let low_ms = unfuzzed_ms * (1.0 - self.fuzz / 2.0);
        let high_ms = (unfuzzed_ms * (1.0 + self.fuzz / 2.0)).min(max_ms);
        let fuzzed_ms = low_ms + fraction.clamp(0.0, 1.0) * (high_ms - low_ms);
        Duration::from_secs_f64(fuzzed_ms.max(0.0) / 1000.0)
    }

    /// Exponential delay before jitter, capped at `max_timeout`.
    pub fn unfuzzed_timeout(&self, count: u32) -> Duration {
        if count < self.min_count {
            return self.min_timeout;
        }
        Duration::from_secs_f64(self.unfuzzed_ms(count) / 1000.0)
    }

    fn unfuzzed_ms(&self, count: u32) -> f64 {
        let base_ms = self.base_timeout.as_secs_f64() * 1000.0;
        let max_ms = self.max_timeout.as_secs_f64() * 1000.0;
        let exponent = i32::try_from(count).unwrap_or(i32::MAX);
        let grown = base_ms * self.exponent.powi(exponent);
        if grown.is_finite() {
            grown.min(max_ms)
        } else {
            max_ms
        }
    }
}
