use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay before each reconnect attempt.
///
/// The delay starts at `base_delay_ms` and doubles per consecutive failed
/// attempt up to `max_delay_ms`. Setting both to the same value gives a
/// fixed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    3_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        Self {
            base_delay_ms: ms,
            max_delay_ms: ms,
        }
    }

    /// Delay before attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(32));
        let ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms.max(self.base_delay_ms));
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_doubles_until_cap() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(3));
        assert_eq!(policy.delay(1), Duration::from_secs(6));
        assert_eq!(policy.delay(4), Duration::from_secs(48));
        assert_eq!(policy.delay(5), Duration::from_secs(60));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_fixed_policy_never_grows() {
        let policy = ReconnectPolicy::fixed(Duration::from_millis(250));
        assert_eq!(policy.delay(0), policy.delay(10));
    }

    #[test]
    fn test_max_below_base_uses_base() {
        let policy = ReconnectPolicy {
            base_delay_ms: 500,
            max_delay_ms: 100,
        };
        assert_eq!(policy.delay(3), Duration::from_millis(500));
    }
}
