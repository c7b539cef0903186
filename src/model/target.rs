//! Target identity and per-(target, suite) scheduling state.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a unit of work: a target repository plus the suite of
/// changes attempted against it.
///
/// Ordering is lexicographic on `(target, suite)` and is used as the final
/// tie-breaker wherever a deterministic order is required.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunKey {
    /// VCS URL (or other stable identifier) of the target repository.
    pub target: String,
    /// Name of the suite of changes.
    pub suite: String,
}

impl RunKey {
    /// Creates a new key.
    pub fn new(target: impl Into<String>, suite: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            suite: suite.into(),
        }
    }

    /// Returns the host part of the target URL, if the target parses as one.
    pub fn host(&self) -> Option<String> {
        target_host(&self.target)
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.target, self.suite)
    }
}

/// Extracts the host from a target URL.
///
/// Targets that are not URLs (local paths, bare names) have no host and are
/// never subject to host rate limiting.
pub fn target_host(target: &str) -> Option<String> {
    url::Url::parse(target)
        .ok()
        .and_then(|url| url.host_str().map(str::to_lowercase))
}

/// Known state of a (target, suite) pair as observed by the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    /// The (target, suite) pair.
    pub key: RunKey,
    /// When the last run for this pair changed state.
    pub last_attempt: Option<DateTime<Utc>>,
    /// When the last successful run finished.
    pub last_success: Option<DateTime<Utc>>,
    /// Number of finished runs.
    pub attempts: u32,
    /// Number of successful runs.
    pub successes: u32,
    /// Duration of the most recent finished run in seconds.
    pub last_duration_secs: Option<f64>,
    /// Fingerprint of a candidate whose last run ended terminally.
    ///
    /// The scheduler will not admit a candidate with this fingerprint again.
    pub blocked_fingerprint: Option<String>,
}

impl TargetState {
    /// Creates an empty state for a key.
    pub fn new(key: RunKey) -> Self {
        Self {
            key,
            last_attempt: None,
            last_success: None,
            attempts: 0,
            successes: 0,
            last_duration_secs: None,
            blocked_fingerprint: None,
        }
    }

    /// Time elapsed since the last attempt, or `None` if never attempted.
    pub fn staleness(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_attempt
            .map(|at| (now - at).max(Duration::zero()))
    }

    /// Laplace-smoothed success rate over finished runs.
    pub fn success_likelihood(&self) -> f64 {
        (f64::from(self.successes) + 1.0) / (f64::from(self.attempts) + 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display_and_order() {
        let a = RunKey::new("https://example.com/a", "lintian-fixes");
        let b = RunKey::new("https://example.com/a", "multiarch");
        assert_eq!(a.to_string(), "https://example.com/a/lintian-fixes");
        assert!(a < b);
    }

    #[test]
    fn test_target_host() {
        assert_eq!(
            target_host("https://GitHub.com/owner/repo"),
            Some("github.com".to_string())
        );
        assert_eq!(target_host("not a url"), None);
        assert_eq!(
            RunKey::new("git://salsa.debian.org/x.git", "s").host(),
            Some("salsa.debian.org".to_string())
        );
    }

    #[test]
    fn test_staleness() {
        let now = Utc::now();
        let mut state = TargetState::new(RunKey::new("t", "s"));
        assert!(state.staleness(now).is_none());

        state.last_attempt = Some(now - Duration::hours(3));
        assert_eq!(state.staleness(now), Some(Duration::hours(3)));

        // Clock skew never yields negative staleness.
        state.last_attempt = Some(now + Duration::minutes(5));
        assert_eq!(state.staleness(now), Some(Duration::zero()));
    }

    #[test]
    fn test_success_likelihood() {
        let mut state = TargetState::new(RunKey::new("t", "s"));
        assert!((state.success_likelihood() - 0.5).abs() < f64::EPSILON);

        state.attempts = 8;
        state.successes = 8;
        assert!((state.success_likelihood() - 0.9).abs() < 1e-9);
    }
}
