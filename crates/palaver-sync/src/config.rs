//! Engine configuration and backoff policy.

use std::time::Duration;

/// Configuration for polling cadence and retry behavior.
///
/// # Backoff
///
/// Retry delay follows binary exponential backoff:
/// `base * 2^(failures - 1)`, capped at `backoff_max`. With the defaults:
/// 1s, 2s, 4s, 8s, 16s, then 30s from the sixth failure on.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Fixed interval between update polls while in Steady.
    pub poll_interval: Duration,
    /// Re-fetch `/info` every this many poll ticks, so a backend restart is
    /// noticed without a dedicated timer. 0 disables the periodic re-check.
    pub session_check_every: u32,
    /// Base delay for exponential backoff on failed requests.
    pub backoff_base: Duration,
    /// Cap for the backoff delay.
    pub backoff_max: Duration,
    /// Attempts for a user-triggered history page before giving up.
    pub pagination_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            session_check_every: 12,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            pagination_retries: 3,
        }
    }
}

/// Computes the capped exponential backoff delay for a failure count.
///
/// Zero failures means no delay.
pub fn retry_backoff(failures: u32, config: &SyncConfig) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }

    let base_ms = config.backoff_base.as_millis() as u64;
    let max_ms = config.backoff_max.as_millis() as u64;
    let multiplier = 1u64.checked_shl(failures - 1).unwrap_or(u64::MAX);
    let delay_ms = base_ms.saturating_mul(multiplier).min(max_ms);

    Duration::from_millis(delay_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_secs: u64, max_secs: u64) -> SyncConfig {
        SyncConfig {
            backoff_base: Duration::from_secs(base_secs),
            backoff_max: Duration::from_secs(max_secs),
            ..SyncConfig::default()
        }
    }

    #[test]
    fn backoff_doubles_until_the_cap() {
        let config = config(1, 30);
        assert_eq!(retry_backoff(0, &config), Duration::ZERO);
        assert_eq!(retry_backoff(1, &config), Duration::from_secs(1));
        assert_eq!(retry_backoff(2, &config), Duration::from_secs(2));
        assert_eq!(retry_backoff(3, &config), Duration::from_secs(4));
        assert_eq!(retry_backoff(5, &config), Duration::from_secs(16));
        assert_eq!(retry_backoff(6, &config), Duration::from_secs(30));
        assert_eq!(retry_backoff(60, &config), Duration::from_secs(30));
    }

    #[test]
    fn huge_failure_counts_saturate_instead_of_overflowing() {
        let config = config(2, 300);
        assert_eq!(retry_backoff(u32::MAX, &config), Duration::from_secs(300));
    }

    #[test]
    fn defaults_are_sane() {
        let config = SyncConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert!(config.session_check_every > 0);
        assert!(config.backoff_base < config.backoff_max);
    }
}
