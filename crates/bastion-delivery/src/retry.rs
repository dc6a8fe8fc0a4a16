//! Table-driven retry scheduling for failed webhook deliveries.
//!
//! Delays come from a fixed [`BackoffSchedule`] indexed by attempt number
//! rather than from a formula, so operators can read the whole retry
//! timeline from configuration. Attempts past the end of the table reuse the
//! last entry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, Result};

/// Default delays in seconds: 10s, 1m, 5m, 30m, 2h.
pub const DEFAULT_BACKOFF_SECONDS: [u64; 5] = [10, 60, 300, 1800, 7200];

/// Ordered retry delays indexed by attempt number, starting at 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u64>", into = "Vec<u64>")]
pub struct BackoffSchedule {
    delays: Vec<Duration>,
}

impl BackoffSchedule {
    /// Creates a schedule from explicit delays.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if `delays` is empty.
    pub fn new(delays: Vec<Duration>) -> Result<Self> {
        if delays.is_empty() {
            return Err(DeliveryError::configuration("backoff schedule must not be empty"));
        }
        Ok(Self { delays })
    }

    /// Creates a schedule from whole seconds.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if `seconds` is empty.
    pub fn from_secs(seconds: &[u64]) -> Result<Self> {
        Self::new(seconds.iter().copied().map(Duration::from_secs).collect())
    }

    /// Delay before the attempt that follows attempt `attempt`.
    ///
    /// Attempt numbers below 1 are treated as 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let index = (attempt.max(1) - 1) as usize;
        let last = self.delays.len() - 1;
        self.delays[index.min(last)]
    }

    /// Configured delays in order.
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self { delays: DEFAULT_BACKOFF_SECONDS.iter().copied().map(Duration::from_secs).collect() }
    }
}

impl TryFrom<Vec<u64>> for BackoffSchedule {
    type Error = DeliveryError;

    fn try_from(seconds: Vec<u64>) -> Result<Self> {
        Self::from_secs(&seconds)
    }
}

impl From<BackoffSchedule> for Vec<u64> {
    fn from(schedule: BackoffSchedule) -> Self {
        schedule.delays.iter().map(Duration::as_secs).collect()
    }
}

/// Retry budget and delays applied to new deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    /// Delay table.
    pub schedule: BackoffSchedule,
}

impl RetryPolicy {
    /// Builds a policy allowing `max_retries` retries after the first attempt.
    pub fn with_max_retries(max_retries: u32, schedule: BackoffSchedule) -> Self {
        Self { max_attempts: max_retries.saturating_add(1), schedule }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_max_retries(DEFAULT_BACKOFF_SECONDS.len() as u32, BackoffSchedule::default())
    }
}

/// Facts about a failed attempt needed to decide on a retry.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempt that just failed, 1-based.
    pub attempt_number: u32,
    /// Budget recorded on the delivery attempt.
    pub max_attempts: u32,
    /// Whether the failure was classified as transient.
    pub retryable: bool,
    /// When the attempt failed.
    pub failed_at: DateTime<Utc>,
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt.
    Retry {
        /// Delay from the failure to the next attempt
        delay: Duration,
        /// Absolute time of the next attempt
        next_attempt_at: DateTime<Utc>,
    },
    /// The attempt is terminal.
    GiveUp {
        /// Why no retry is scheduled
        reason: String,
    },
}

impl RetryContext {
    /// Creates a retry context for a failed attempt.
    pub fn new(
        attempt_number: u32,
        max_attempts: u32,
        retryable: bool,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self { attempt_number, max_attempts, retryable, failed_at }
    }

    /// Decides whether and when to retry.
    ///
    /// Non-retryable failures give up first, then an exhausted budget.
    pub fn decide_retry(&self, schedule: &BackoffSchedule) -> RetryDecision {
        if !self.retryable {
            return RetryDecision::GiveUp { reason: "non-retryable failure".to_string() };
        }

        if self.attempt_number >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = schedule.delay_for_attempt(self.attempt_number);
        let Ok(chrono_delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp {
                reason: "retry delay duration out of range".to_string(),
            };
        };

        RetryDecision::Retry { delay, next_attempt_at: self.failed_at + chrono_delay }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_and_clamping() {
        let schedule = BackoffSchedule::default();
        let secs: Vec<u64> = (1..=7).map(|n| schedule.delay_for_attempt(n).as_secs()).collect();
        assert_eq!(secs, vec![10, 60, 300, 1800, 7200, 7200, 7200]);
        assert_eq!(schedule.delay_for_attempt(0), Duration::from_secs(10));
    }

    #[test]
    fn empty_schedule_is_rejected() {
        let result = BackoffSchedule::new(Vec::new());
        assert!(matches!(result, Err(DeliveryError::Configuration { .. })));
    }

    #[test]
    fn schedule_serializes_as_seconds() {
        let schedule = BackoffSchedule::from_secs(&[1, 2, 3]).unwrap();
        let json = serde_json::to_string(&schedule).unwrap();
        assert_eq!(json, "[1,2,3]");
        assert_eq!(serde_json::from_str::<BackoffSchedule>(&json).unwrap(), schedule);
        assert!(serde_json::from_str::<BackoffSchedule>("[]").is_err());
    }

    #[test]
    fn retry_uses_table_delay() {
        let failed_at = Utc::now();
        let decision =
            RetryContext::new(2, 6, true, failed_at).decide_retry(&BackoffSchedule::default());

        assert_eq!(
            decision,
            RetryDecision::Retry {
                delay: Duration::from_secs(60),
                next_attempt_at: failed_at + chrono::Duration::seconds(60),
            }
        );
    }

    #[test]
    fn budget_exhaustion_gives_up() {
        let decision =
            RetryContext::new(3, 3, true, Utc::now()).decide_retry(&BackoffSchedule::default());
        match decision {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("maximum attempts")),
            RetryDecision::Retry { .. } => unreachable!("budget is exhausted"),
        }
    }

    #[test]
    fn non_retryable_gives_up_regardless_of_budget() {
        let decision =
            RetryContext::new(1, 10, false, Utc::now()).decide_retry(&BackoffSchedule::default());
        assert!(matches!(decision, RetryDecision::GiveUp { .. }));
    }

    #[test]
    fn max_retries_adds_first_attempt() {
        let schedule = BackoffSchedule::default();
        assert_eq!(RetryPolicy::with_max_retries(5, schedule.clone()).max_attempts, 6);
        assert_eq!(RetryPolicy::with_max_retries(u32::MAX, schedule).max_attempts, u32::MAX);
    }
}
