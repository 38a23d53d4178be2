//! Scheduler configuration.
//!
//! Durations are carried as milliseconds so the struct deserializes cleanly
//! from files and environment variables; use the accessors to get `Duration`s.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::SchedulerError;
use crate::queue::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub worker_count: usize,
    /// In-flight executions per worker.
    pub max_concurrent: usize,
    pub poll_interval_ms: u64,
    pub lease_ttl_ms: u64,
    /// Default for tasks submitted without their own limit.
    pub max_attempts: u32,
    pub reclaim_interval_ms: u64,
    /// Candidates fetched per free slot, to absorb lost lease races.
    pub over_fetch_factor: usize,
    pub retry: RetryConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            max_concurrent: 2,
            poll_interval_ms: 1_000,
            lease_ttl_ms: 30_000,
            max_attempts: 3,
            reclaim_interval_ms: 30_000,
            over_fetch_factor: 2,
            retry: RetryConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    /// Renewal period: half the lease TTL.
    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis((self.lease_ttl_ms / 2).max(1))
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }

    pub fn total_capacity(&self) -> usize {
        self.worker_count * self.max_concurrent
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.policy()
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        let invalid = |msg: &str| Err(SchedulerError::InvalidConfig(msg.to_string()));
        if self.worker_count == 0 {
            return invalid("worker_count must be at least 1");
        }
        if self.max_concurrent == 0 {
            return invalid("max_concurrent must be at least 1");
        }
        if self.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be positive");
        }
        if self.lease_ttl_ms == 0 {
            return invalid("lease_ttl_ms must be positive");
        }
        if self.max_attempts == 0 {
            return invalid("max_attempts must be at least 1");
        }
        if self.reclaim_interval_ms == 0 {
            return invalid("reclaim_interval_ms must be positive");
        }
        if self.over_fetch_factor == 0 {
            return invalid("over_fetch_factor must be at least 1");
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return invalid("retry.multiplier must be >= 1.0");
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return invalid("retry.max_delay_ms must be >= retry.base_delay_ms");
        }
        Ok(())
    }
}

/// Backoff settings for failed attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Zero requeues immediately.
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 0,
            multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}
