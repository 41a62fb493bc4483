//! Configuration types for the resharding coordinator.

use crate::error::{Error, Result};
use std::time::Duration;

/// Main configuration for resharding coordination.
#[derive(Debug, Clone)]
pub struct ReshardingConfig {
    /// Overall deadline for one participant fan-out round.
    pub participant_deadline: Duration,

    /// Timeout for a single participant RPC attempt.
    pub attempt_timeout: Duration,

    /// Backoff between retries of a participant command.
    pub retry: RetryPolicy,

    /// Interval between progress polls while cloning and applying.
    pub poll_interval: Duration,

    /// Maximum recipient lag (ms) at which applying is considered caught up.
    pub apply_lag_threshold_ms: u64,

    /// Maximum time writes may stay blocked before the operation aborts.
    pub critical_section_timeout: Duration,

    /// Consecutive fully timed-out rounds in one phase before aborting.
    pub max_unreachable_rounds: u32,

    /// Interval between background cleanup retries.
    pub cleanup_retry_interval: Duration,

    /// Cleanup attempts per participant before giving up.
    pub cleanup_max_attempts: u32,
}

impl Default for ReshardingConfig {
    fn default() -> Self {
        Self {
            participant_deadline: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_millis(500),
            apply_lag_threshold_ms: 100,
            critical_section_timeout: Duration::from_secs(5),
            max_unreachable_rounds: 10,
            cleanup_retry_interval: Duration::from_secs(10),
            cleanup_max_attempts: 30,
        }
    }
}

impl ReshardingConfig {
    /// Tight timings for tests and local demos.
    pub fn fast() -> Self {
        Self {
            participant_deadline: Duration::from_millis(500),
            attempt_timeout: Duration::from_millis(100),
            retry: RetryPolicy {
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(50),
                multiplier: 2.0,
            },
            poll_interval: Duration::from_millis(10),
            apply_lag_threshold_ms: 100,
            critical_section_timeout: Duration::from_secs(2),
            max_unreachable_rounds: 3,
            cleanup_retry_interval: Duration::from_millis(20),
            cleanup_max_attempts: 10,
        }
    }

    /// Set the per-round participant deadline.
    pub fn with_participant_deadline(mut self, deadline: Duration) -> Self {
        self.participant_deadline = deadline;
        self
    }

    /// Set the per-attempt RPC timeout.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Set the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the progress poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the apply lag threshold in milliseconds.
    pub fn with_apply_lag_threshold_ms(mut self, lag_ms: u64) -> Self {
        self.apply_lag_threshold_ms = lag_ms;
        self
    }

    /// Set the critical section timeout.
    pub fn with_critical_section_timeout(mut self, timeout: Duration) -> Self {
        self.critical_section_timeout = timeout;
        self
    }

    /// Set how many unreachable rounds are tolerated.
    pub fn with_max_unreachable_rounds(mut self, rounds: u32) -> Self {
        self.max_unreachable_rounds = rounds;
        self
    }

    /// Set the background cleanup retry interval.
    pub fn with_cleanup_retry_interval(mut self, interval: Duration) -> Self {
        self.cleanup_retry_interval = interval;
        self
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.attempt_timeout.is_zero() || self.participant_deadline.is_zero() {
            return Err(Error::Config("participant timeouts must be non-zero".to_string()));
        }
        if self.attempt_timeout > self.participant_deadline {
            return Err(Error::Config(format!(
                "attempt timeout {:?} exceeds participant deadline {:?}",
                self.attempt_timeout, self.participant_deadline
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be non-zero".to_string()));
        }
        if self.max_unreachable_rounds == 0 {
            return Err(Error::Config("max_unreachable_rounds must be at least 1".to_string()));
        }
        self.retry.validate()
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_backoff: Duration,

    /// Upper bound on any single delay.
    pub max_backoff: Duration,

    /// Growth factor per attempt.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(32) as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        Duration::from_millis(millis as u64).min(self.max_backoff)
    }

    /// Delay with up to 50% random jitter added.
    pub fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let jitter = base.mul_f64(rand::random::<f64>() * 0.5);
        (base + jitter).min(self.max_backoff)
    }

    fn validate(&self) -> Result<()> {
        if self.multiplier < 1.0 {
            return Err(Error::Config("retry multiplier must be >= 1.0".to_string()));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(Error::Config("initial backoff exceeds max backoff".to_string()));
        }
        Ok(())
    }
}

/// Configuration for the TCP participant transport.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,

    /// Timeout for one request/response exchange.
    pub request_timeout: Duration,

    /// Largest accepted frame in bytes.
    pub max_frame_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}

impl NetworkConfig {
    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(ReshardingConfig::default().validate().is_ok());
        assert!(ReshardingConfig::fast().validate().is_ok());
    }

    #[test]
    fn test_invalid_configs() {
        let config = ReshardingConfig::default()
            .with_attempt_timeout(Duration::from_secs(60))
            .with_participant_deadline(Duration::from_secs(1));
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = ReshardingConfig::default().with_max_unreachable_rounds(0);
        assert!(config.validate().is_err());

        let config = ReshardingConfig::default().with_retry_policy(RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            multiplier: 0.5,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_is_bounded() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            multiplier: 2.0,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(10));
        assert_eq!(policy.backoff(1), Duration::from_millis(20));
        assert_eq!(policy.backoff(10), Duration::from_millis(100));
        for attempt in 0..20 {
            let delay = policy.backoff_with_jitter(attempt);
            assert!(delay >= policy.backoff(attempt));
            assert!(delay <= policy.max_backoff);
        }
    }
}
