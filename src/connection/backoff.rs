//! Exponential backoff for reconnect attempts

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: false,
        }
    }

    /// Add up to 25% random jitter to each delay. The cap still holds.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at the maximum.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;

        let shift = attempt.saturating_sub(1).min(32);
        let exp = base_ms.saturating_mul(1u64 << shift);
        let capped = exp.min(max_ms);

        let jitter = if self.jitter {
            rand::random::<u64>() % (capped / 4 + 1)
        } else {
            0
        };
        Duration::from_millis((capped + jitter).min(max_ms))
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(30))
    }
}
