//! Exponential backoff with jitter for failed remote calls.

use rand::Rng;
use std::time::Duration;

use crate::storage::SyncConfig;
use crate::sync::types::SyncError;

/// Retry threshold and backoff bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failures allowed before an action is dead-lettered.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Whether an action that has failed `retry_count` times is out of retries.
    pub fn exhausted(&self, retry_count: u32) -> bool {
        retry_count > self.max_retries
    }

    /// Un-jittered delay before attempt `retry_count + 1`: `base * 2^(retry_count - 1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Delay with equal jitter, in `[delay/2, delay]`. A rate-limit response
    /// with a retry-after hint waits at least that long.
    pub fn jittered_delay(&self, retry_count: u32, error: &SyncError) -> Duration {
        let delay = self.delay_for(retry_count);
        let half = delay / 2;
        let jitter_ms = half.as_millis() as u64;
        let jittered = if jitter_ms == 0 {
            delay
        } else {
            half + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };

        match error {
            SyncError::RateLimited {
                retry_after_secs: Some(secs),
            } => jittered.max(Duration::from_secs(*secs)),
            _ => jittered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        }
    }

    #[test]
    fn delay_doubles_until_capped() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(4), Duration::from_millis(800));
        assert_eq!(p.delay_for(5), Duration::from_millis(1000));
        assert_eq!(p.delay_for(60), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let p = policy();
        for _ in 0..100 {
            let d = p.jittered_delay(3, &SyncError::Timeout);
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(400));
        }
    }

    #[test]
    fn retry_after_is_honored() {
        let p = policy();
        let d = p.jittered_delay(1, &SyncError::RateLimited { retry_after_secs: Some(30) });
        assert!(d >= Duration::from_secs(30));
    }

    #[test]
    fn exhausted_after_threshold() {
        let p = policy();
        assert!(!p.exhausted(3));
        assert!(p.exhausted(4));
    }
}
