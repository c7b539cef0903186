//! Candidate ranking.
//!
//! Ranking is a pure function of the candidate set, the current queue, the
//! publish policies and the known target state. It performs no I/O, which
//! keeps cycles reproducible: the same inputs always give the same order.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};

use crate::config::{RankingWeights, SchedulerConfig};
use crate::model::{fingerprint, Candidate, PublishPolicy, RunKey, TargetState};
use crate::publisher::RateLimiter;
use crate::queue::{dispatch_order, QueueItem};

/// A candidate the scheduler could not use.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedCandidate {
    /// Position in the candidate list.
    pub index: usize,
    /// Target as given, if any.
    pub target: Option<String>,
    pub reason: String,
}

/// Result of ranking one cycle.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    /// Items to admit, in dispatch order, at most `queue_depth` long.
    pub items: Vec<QueueItem>,
    /// Keys of pinned queue items (retries and operator requests).
    pub pinned: HashSet<RunKey>,
    /// Candidates that were skipped and reported.
    pub malformed: Vec<MalformedCandidate>,
    /// Candidates excluded because their key is claimed or running.
    pub in_flight: usize,
    /// Candidates excluded because an identical attempt ended terminally.
    pub blocked: usize,
    /// Candidates left out because the queue depth was reached.
    pub overflow: usize,
}

/// Scores candidates and builds the ordered admission list.
#[derive(Debug, Clone)]
pub struct Ranker {
    config: SchedulerConfig,
    limiter: RateLimiter,
}

impl Ranker {
    /// Creates a ranker.
    ///
    /// # Arguments
    ///
    /// * `config` - weights, suite priorities and queue depth
    /// * `limiter` - the publisher's limiter, used for the quota penalty
    pub fn new(config: SchedulerConfig, limiter: RateLimiter) -> Self {
        Self { config, limiter }
    }

    /// Returns the ranking weights.
    pub fn weights(&self) -> &RankingWeights {
        &self.config.weights
    }

    /// Converts the candidate set into an ordered list of queue items.
    ///
    /// Candidates whose key is already claimed or in progress are excluded,
    /// as are keys held by a pinned item. Pinned items neither appear in the
    /// output nor count toward the queue depth. Overflow is simply omitted
    /// and reconsidered next cycle.
    pub fn schedule(
        &self,
        candidates: &[Candidate],
        current_queue: &[QueueItem],
        policies: &[PublishPolicy],
        targets: &[TargetState],
        now: DateTime<Utc>,
    ) -> Schedule {
        let mut schedule = Schedule::default();

        let in_flight: HashSet<&RunKey> = current_queue
            .iter()
            .filter(|i| i.state.is_in_flight())
            .map(|i| &i.key)
            .collect();
        schedule.pinned = current_queue
            .iter()
            .filter(|i| !i.state.is_in_flight() && i.is_pinned())
            .map(|i| i.key.clone())
            .collect();

        let policies: HashMap<&str, &PublishPolicy> = policies
            .iter()
            .map(|p| (p.maintainer.as_str(), p))
            .collect();
        let targets: HashMap<&RunKey, &TargetState> =
            targets.iter().map(|t| (&t.key, t)).collect();

        let mut ranked: HashMap<RunKey, QueueItem> = HashMap::new();
        for (index, candidate) in candidates.iter().enumerate() {
            let key = match candidate.key() {
                Ok(key) => key,
                Err(reason) => {
                    schedule.malformed.push(MalformedCandidate {
                        index,
                        target: candidate.target.clone(),
                        reason,
                    });
                    continue;
                }
            };

            if in_flight.contains(&key) {
                schedule.in_flight += 1;
                continue;
            }
            if schedule.pinned.contains(&key) {
                continue;
            }

            let state = targets.get(&key).copied();
            if let Some(blocked) = state.and_then(|s| s.blocked_fingerprint.as_deref()) {
                if blocked == fingerprint(&key.target, &key.suite, &candidate.context) {
                    schedule.blocked += 1;
                    continue;
                }
            }

            let maintainer = candidate.rate_limit_bucket();
            let policy = policies.get(maintainer.as_str()).copied();
            let staleness = self.staleness(state, now);
            let score = self.score(candidate, state, policy, staleness);

            let item = QueueItem::new(key.clone(), maintainer, candidate.context.clone(), score)
                .with_staleness(staleness)
                .with_estimated_duration(state.and_then(|s| s.last_duration_secs));

            // Duplicate keys keep the better-ranked entry.
            match ranked.get(&key) {
                Some(existing) if dispatch_order(existing, &item).is_le() => {}
                _ => {
                    ranked.insert(key, item);
                }
            }
        }

        let mut items: Vec<QueueItem> = ranked.into_values().collect();
        items.sort_by(dispatch_order);

        let depth = self.config.queue_depth;
        if items.len() > depth {
            schedule.overflow = items.len() - depth;
            items.truncate(depth);
        }
        schedule.items = items;

        schedule
    }

    /// Time since the last attempt; never-attempted pairs get a fixed staleness.
    fn staleness(&self, state: Option<&TargetState>, now: DateTime<Utc>) -> Duration {
        state.and_then(|s| s.staleness(now)).unwrap_or_else(|| {
            Duration::seconds((self.config.never_attempted_staleness_hours * 3600.0) as i64)
        })
    }

    /// Weighted sum of publish likelihood, staleness, suite priority and value.
    pub fn score(
        &self,
        candidate: &Candidate,
        state: Option<&TargetState>,
        policy: Option<&PublishPolicy>,
        staleness: Duration,
    ) -> f64 {
        let w = &self.config.weights;

        let likelihood = state.map_or(0.5, TargetState::success_likelihood);
        let quota_used = match self.limiter.limit_for(policy) {
            Some(0) => 1.0,
            Some(limit) => {
                let open = policy.map_or(0, |p| p.open_proposals);
                (f64::from(open) / f64::from(limit)).min(1.0)
            }
            None => 0.0,
        };
        let publish_term = likelihood * (1.0 - w.quota_penalty * quota_used);

        let staleness_hours = staleness.num_seconds() as f64 / 3600.0;
        let suite_priority = self
            .config
            .suite_priorities
            .get(&candidate.suite)
            .copied()
            .unwrap_or(0.0);

        w.success * publish_term
            + w.staleness * staleness_hours
            + w.suite * suite_priority
            + w.value * candidate.value
    }
}
