//! Retry policy with exponential backoff and optional jitter.
//!
//! The policy is pure: it only computes delays and retry decisions. The
//! suspension itself happens in the invoker, per worker task.

use rand::Rng;
use std::time::Duration;

use crate::types::CrawlerError;
use crate::{Error, Result};

/// Backoff configuration for one service type. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Page fetches: a few retries with moderate backoff.
    pub fn for_fetch() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Embedding endpoints throttle aggressively; back off faster.
    pub fn for_embedding() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            backoff_multiplier: 3.0,
            jitter: true,
        }
    }

    pub fn for_storage() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn for_ingestion() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_base_delay(mut self, d: Duration) -> Self {
        self.base_delay = d;
        self
    }

    pub fn with_max_delay(mut self, d: Duration) -> Self {
        self.max_delay = d;
        self
    }

    pub fn with_backoff_multiplier(mut self, m: f64) -> Self {
        self.backoff_multiplier = m;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_delay.is_zero() {
            return Err(Error::invalid_field(
                "retry.base_delay_ms",
                "base delay must be positive",
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(Error::invalid_field(
                "retry.max_delay_ms",
                "max delay must be >= base delay",
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier <= 1.0 {
            return Err(Error::invalid_field(
                "retry.backoff_multiplier",
                "backoff multiplier must be a finite value > 1",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Un-jittered delay ceiling for a 1-based attempt number:
    /// `min(max_delay, base_delay * multiplier^(attempt-1))`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let exponent = i32::try_from(exponent).unwrap_or(i32::MAX);
        let factor = self.config.backoff_multiplier.powi(exponent);
        let millis = self.config.base_delay.as_secs_f64() * 1000.0 * factor;
        let cap = self.config.max_delay;
        if !millis.is_finite() || millis >= cap.as_secs_f64() * 1000.0 {
            return cap;
        }
        Duration::from_secs_f64(millis / 1000.0).min(cap)
    }

    /// Delay to wait after the given failed attempt.
    ///
    /// With jitter enabled the value is drawn uniformly from `[delay/2, delay]`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if !self.config.jitter || delay.is_zero() {
            return delay;
        }
        let upper = delay.as_secs_f64();
        let lower = upper / 2.0;
        let secs = rand::thread_rng().gen_range(lower..=upper);
        Duration::from_secs_f64(secs)
    }

    /// Whether a failed attempt may be followed by another.
    pub fn should_retry(&self, attempt: u32, error: &CrawlerError) -> bool {
        error.is_recoverable() && attempt <= self.config.max_retries
    }

    /// Combined decision: `Some(delay)` to retry, `None` to stop.
    pub fn decide(&self, attempt: u32, error: &CrawlerError) -> Option<Duration> {
        self.should_retry(attempt, error)
            .then(|| self.next_delay(attempt))
    }
}
