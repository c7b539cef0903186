//! Open-proposal limits per maintainer.

use crate::config::{PublisherConfig, RateLimiterKind};
use crate::model::PublishPolicy;

/// Computes how many proposals a maintainer may have open at once.
///
/// The scheduler uses the same limiter to penalize maintainers near quota,
/// so ranking and publishing agree on what "at quota" means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimiter {
    /// No limit. Open counts are still tracked.
    Unlimited,
    /// At most `max` open proposals, unless the policy overrides it.
    Fixed { max: u32 },
    /// Start with one open proposal and allow one more per merged proposal.
    SlowStart { max: u32 },
}

impl RateLimiter {
    /// Builds the limiter selected in the publisher configuration.
    pub fn from_config(config: &PublisherConfig) -> Self {
        match (config.rate_limiter, config.max_open_per_maintainer) {
            (RateLimiterKind::None, _) | (_, None) => RateLimiter::Unlimited,
            (RateLimiterKind::Fixed, Some(max)) => RateLimiter::Fixed { max },
            (RateLimiterKind::SlowStart, Some(max)) => RateLimiter::SlowStart { max },
        }
    }

    /// Returns the limit for a maintainer, `None` meaning unlimited.
    ///
    /// A per-maintainer `max_open` on the policy replaces the configured
    /// maximum.
    pub fn limit_for(&self, policy: Option<&PublishPolicy>) -> Option<u32> {
        let override_max = policy.and_then(|p| p.max_open);
        match *self {
            RateLimiter::Unlimited => override_max,
            RateLimiter::Fixed { max } => Some(override_max.unwrap_or(max)),
            RateLimiter::SlowStart { max } => {
                let merged = policy.map_or(0, |p| p.merged_proposals);
                Some(override_max.unwrap_or(max).min(merged.saturating_add(1)))
            }
        }
    }

    /// Whether a maintainer is at or above its limit.
    pub fn is_at_quota(&self, policy: Option<&PublishPolicy>) -> bool {
        let open = policy.map_or(0, |p| p.open_proposals);
        self.limit_for(policy).is_some_and(|limit| open >= limit)
    }
}
