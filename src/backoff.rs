// src/backoff.rs
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry budget and exponential backoff for a job.
///
/// The n-th failure (1-based) waits `backoff_base * backoff_factor^(n - 1)`
/// seconds before the job becomes claimable again; once the number of failed
/// attempts exceeds `max_retries` the job is dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Seconds
    pub backoff_base: u64,
    pub backoff_factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: 2,
            backoff_factor: 2,
        }
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Exhausted,
}

impl RetryPolicy {
    pub fn calculate_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1);
        let multiplier = (self.backoff_factor as u64).saturating_pow(exponent);
        Duration::from_secs(self.backoff_base.saturating_mul(multiplier))
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts > self.max_retries
    }

    /// `attempts` counts failures including the one just observed.
    pub fn decide(&self, attempts: u32) -> RetryDecision {
        if self.is_exhausted(attempts) {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry {
                delay: self.calculate_delay(attempts),
            }
        }
    }
}

/// Partial override of a [`RetryPolicy`], used for per-job options and `config set`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicyPatch {
    pub max_retries: Option<u32>,
    pub backoff_base: Option<u64>,
    pub backoff_factor: Option<u32>,
}

impl RetryPolicyPatch {
    pub fn is_empty(&self) -> bool {
        self.max_retries.is_none() && self.backoff_base.is_none() && self.backoff_factor.is_none()
    }

    pub fn apply_to(&self, policy: RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(policy.max_retries),
            backoff_base: self.backoff_base.unwrap_or(policy.backoff_base),
            backoff_factor: self.backoff_factor.unwrap_or(policy.backoff_factor),
        }
    }
}
