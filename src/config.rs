use std::time::Duration;

use rand::Rng;

use crate::error::BatchError;

/// Exponential backoff for transient captioning failures.
///
/// With the defaults an item gets 3 calls, waiting 2s then 4s between them.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total calls per item, including the first (must be >= 1).
    pub max_attempts: u32,
    /// Wait after the first transient failure.
    pub base_delay: Duration,
    /// Growth factor applied per further failure (must be >= 1.0).
    pub multiplier: f64,
    /// Ceiling for any single wait.
    pub max_delay: Duration,
    /// Randomize each wait within [50%, 100%] of its computed value.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Wait before the next call, given the number of the attempt that just failed (1-based).
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let exp = failed_attempt.saturating_sub(1) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        let capped = if secs.is_finite() && secs < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max_delay
        };

        if self.jitter && !capped.is_zero() {
            let factor: f64 = rand::rng().random_range(0.5..=1.0);
            capped.mul_f64(factor)
        } else {
            capped
        }
    }

    pub fn validate(&self) -> Result<(), BatchError> {
        if self.max_attempts == 0 {
            return Err(BatchError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(BatchError::Config(format!(
                "backoff multiplier must be >= 1.0 (got {})",
                self.multiplier
            )));
        }
        if self.max_delay < self.base_delay {
            return Err(BatchError::Config(format!(
                "max delay {:?} is below base delay {:?}",
                self.max_delay, self.base_delay
            )));
        }
        Ok(())
    }
}

/// Configuration for a batch captioning run.
///
/// Use [`BatchConfig::builder()`] for ergonomic construction, or
/// [`BatchConfig::default()`] for the documented defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    pub retry: RetryPolicy,
    /// Upper bound on a single captioning call before it counts as a timeout.
    pub call_timeout: Duration,
    /// Pause after each processed item to avoid request bursts (0 = none).
    pub pace: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(120),
            pace: Duration::from_millis(200),
        }
    }
}

impl BatchConfig {
    /// Start building a config with the builder pattern.
    pub fn builder() -> BatchConfigBuilder {
        BatchConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<(), BatchError> {
        self.retry.validate()?;
        if self.call_timeout.is_zero() {
            return Err(BatchError::Config(
                "call timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`BatchConfig`].
#[derive(Default)]
pub struct BatchConfigBuilder {
    config: BatchConfig,
}

impl BatchConfigBuilder {
    /// Set the total number of calls per item.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    /// Set the wait after the first transient failure.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.config.retry.base_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.retry.multiplier = multiplier;
        self
    }

    /// Set the ceiling for a single backoff wait.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.config.retry.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.config.retry.jitter = jitter;
        self
    }

    /// Set the per-call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    /// Set the pause between items.
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.config.pace = pace;
        self
    }

    /// Build the final [`BatchConfig`].
    pub fn build(self) -> BatchConfig {
        self.config
    }
}
