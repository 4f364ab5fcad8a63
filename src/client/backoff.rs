//! Reconnect Policy
//!
//! Capped exponential backoff without jitter: there is exactly one client
//! per bridge, so there is no herd to spread out.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// Doubling stops after this many failures
    pub max_exponent: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
            max_exponent: 6,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(self.max_exponent).min(31);
        self.initial.saturating_mul(factor).min(self.max)
    }
}
