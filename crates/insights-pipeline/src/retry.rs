//! Retry policy per enrichment step and classification of failure messages.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upper bound on any computed retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Policy key used when the failed step is unknown or a full re-enrichment failed.
pub const FULL_ENRICH_STEP: &str = "enrich";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_seconds: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_seconds: 60,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// `base * multiplier^(attempt - 1)`, capped. Attempts count from 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let secs = self.base_delay_seconds as f64
            * self.backoff_multiplier.max(1.0).powi(exponent.min(64) as i32);
        if !secs.is_finite() || secs >= MAX_RETRY_DELAY.as_secs_f64() {
            return MAX_RETRY_DELAY;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    pub fn is_exhausted(&self, failures: i32) -> bool {
        failures >= 0 && failures as u32 >= self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicyRow {
    pub step_name: String,
    #[serde(flatten)]
    pub policy: RetryPolicy,
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicies {
    by_step: HashMap<String, RetryPolicy>,
}

impl RetryPolicies {
    pub fn from_rows(rows: impl IntoIterator<Item = RetryPolicyRow>) -> Self {
        Self {
            by_step: rows.into_iter().map(|row| (row.step_name, row.policy)).collect(),
        }
    }

    pub fn for_step(&self, step_name: &str) -> RetryPolicy {
        self.by_step.get(step_name).copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Transient failures are retried; request and auth problems are not. Unknown messages
/// default to retryable.
pub fn classify_error(message: &str) -> RetryDisposition {
    let message = message.to_lowercase();
    let has = |needle: &str| message.contains(needle);

    let transient = has("rate limit")
        || has("429")
        || has("timeout")
        || has("timed out")
        || has("econnreset")
        || has("econnrefused")
        || has("connection reset")
        || has("connection refused")
        || has("502")
        || has("503")
        || has("504")
        || has("overloaded")
        || has("capacity")
        || has("temporarily unavailable");
    if transient {
        return RetryDisposition::Retryable;
    }

    let permanent = has("invalid")
        || has("validation")
        || has("unauthorized")
        || has("401")
        || has("forbidden")
        || has("403")
        || has("not found")
        || has("404");
    if permanent {
        RetryDisposition::NonRetryable
    } else {
        RetryDisposition::Retryable
    }
}
