//! Bounded exponential backoff.
//!
//! The delay before retry `n` (0-based) is `base_delay * 2^n`. Once `n` reaches
//! `max_attempts` there is no further retry.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Delay before retry number `attempt`, or `None` when the budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor))
    }

    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }
}

/// Three attempts starting at one second, the browser client's defaults.
impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(1000))
    }
}
