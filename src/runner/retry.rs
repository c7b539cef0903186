//! Mapping of run outcomes to what happens to the queue item next.

use chrono::{DateTime, Duration, Utc};

use crate::config::RetryConfig;
use crate::model::{Disposition, RunOutcome};

/// Retry budget and exponential backoff for transient failures.
///
/// Deterministic failures (logic and build failures) are terminal on first
/// occurrence: running the same candidate again would give the same result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
            max_backoff,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::seconds(config.base_backoff_secs as i64),
            Duration::seconds(config.max_backoff_secs as i64),
        )
    }

    /// Backoff after the given zero-based attempt: `base * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2i32.checked_pow(attempt).unwrap_or(i32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |b| b.min(self.max_backoff))
    }

    /// A worker's retry-after hint, capped at the maximum backoff.
    pub fn retry_after(&self, secs: u64) -> Duration {
        i64::try_from(secs)
            .ok()
            .and_then(Duration::try_seconds)
            .map_or(self.max_backoff, |hint| hint.min(self.max_backoff))
    }

    /// Decides the disposition of a finished attempt.
    ///
    /// # Arguments
    ///
    /// * `outcome` - what happened
    /// * `attempt` - zero-based attempt number of the finished run
    /// * `now` - finish time
    /// * `min_backoff` - lower bound on the backoff, e.g. from a host's
    ///   retry-after hint
    pub fn disposition(
        &self,
        outcome: &RunOutcome,
        attempt: u32,
        now: DateTime<Utc>,
        min_backoff: Option<Duration>,
    ) -> Disposition {
        match outcome {
            RunOutcome::Success => Disposition::Completed,
            RunOutcome::Cancelled { .. } => Disposition::Cancelled,
            RunOutcome::Failed { kind, .. } if kind.is_transient() => {
                if attempt >= self.max_retries {
                    return Disposition::FailedPermanent;
                }
                let backoff = match min_backoff {
                    Some(min) => self.backoff(attempt).max(min),
                    None => self.backoff(attempt),
                };
                Disposition::Retry {
                    next_attempt: attempt + 1,
                    not_before: now
                        .checked_add_signed(backoff)
                        .unwrap_or(DateTime::<Utc>::MAX_UTC),
                }
            }
            RunOutcome::Failed { .. } => Disposition::Terminal,
        }
    }
}
