use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::{BidiError, RetrySettings};

/// Decides which failures are worth another attempt and how long to wait first
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    fn is_retryable(&self, error: &BidiError) -> bool;

    /// Delay before attempt `attempt + 1`, where `attempt` counts failures so far
    fn backoff(&self, attempt: u32) -> Duration;

    /// Total attempts allowed, 0 for unbounded
    fn max_attempts(&self) -> u32;
}

/// Exponential backoff over transient status codes and checksum failures
#[derive(Debug, Clone)]
pub struct DefaultRetryPolicy {
    settings: RetrySettings,
}

impl DefaultRetryPolicy {
    pub fn new(settings: RetrySettings) -> Self {
        Self { settings }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.settings.max_attempts = attempts;
        self
    }
}

impl Default for DefaultRetryPolicy {
    fn default() -> Self {
        Self::new(RetrySettings::default())
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn is_retryable(&self, error: &BidiError) -> bool {
        error.is_retryable()
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.settings.base_backoff.as_millis() as u64;
        let exp = 2_u64.saturating_pow(attempt.saturating_sub(1));
        let millis = std::cmp::min(
            base.saturating_mul(exp),
            self.settings.max_backoff.as_millis() as u64,
        );

        let millis = if self.settings.jitter && millis > 1 {
            rand::thread_rng().gen_range(millis / 2..=millis)
        } else {
            millis
        };
        Duration::from_millis(millis)
    }

    fn max_attempts(&self) -> u32 {
        self.settings.max_attempts
    }
}

/// Outcome of recording a failure
#[derive(Debug)]
pub enum RetryDecision {
    Retry { backoff: Duration, attempt: u32 },
    GiveUp(BidiError),
}

/// Tracks the failures of one logical operation across attempts
#[derive(Debug, Clone)]
pub struct RetryContext {
    policy: Arc<dyn RetryPolicy>,
    failures: Vec<BidiError>,
}

impl RetryContext {
    pub fn new(policy: Arc<dyn RetryPolicy>) -> Self {
        Self {
            policy,
            failures: Vec::new(),
        }
    }

    /// Failed attempts recorded since the last reset
    pub fn attempts(&self) -> u32 {
        self.failures.len() as u32
    }

    /// Forget earlier failures after the operation made progress
    pub fn reset(&mut self) {
        self.failures.clear();
    }

    /// Record `error` and decide whether to try again.
    ///
    /// When giving up after earlier failures, the returned error carries them as suppressed
    /// failures in the order they happened.
    pub fn record_error(&mut self, error: BidiError) -> RetryDecision {
        let attempt = self.attempts() + 1;

        if !self.policy.is_retryable(&error) {
            if self.failures.is_empty() {
                return RetryDecision::GiveUp(error);
            }
            return RetryDecision::GiveUp(self.exhausted("Unretryable error", attempt, error));
        }

        let max = self.policy.max_attempts();
        if max != 0 && attempt >= max {
            return RetryDecision::GiveUp(self.exhausted(
                "Operation failed to complete within attempt budget",
                attempt,
                error,
            ));
        }

        let backoff = self.policy.backoff(attempt);
        debug!(attempt, ?backoff, %error, "Retrying after failure");
        self.failures.push(error);
        RetryDecision::Retry { backoff, attempt }
    }

    fn exhausted(&mut self, message: &str, attempts: u32, error: BidiError) -> BidiError {
        BidiError::RetryExhausted {
            message: message.to_string(),
            attempts,
            source: Box::new(error),
            suppressed: std::mem::take(&mut self.failures),
        }
    }
}
