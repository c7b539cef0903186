//! Publishing of successful runs under per-maintainer rate limits.
//!
//! # Overview
//!
//! The publisher consists of:
//! - **Publisher**: decides per run whether to publish now, defer
//!   (rate-limited) or skip, and performs the action
//! - **RateLimiter**: open-proposal limit per maintainer, shared with the
//!   scheduler's ranking
//! - **PublishAction**: the external push/propose collaborator
//! - **Trust rules**: choose the publish mode per target and suite
//!
//! Each run is published at most once. The claim on a run's publish record
//! is taken before any side effect, and only rate-limited records can be
//! claimed again.

pub mod action;
pub mod rate_limit;
pub mod trust;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{PublisherConfig, TrustRule};
use crate::metrics::MetricsCollector;
use crate::model::{
    AuditEvent, AuditKind, ProposalStatus, PublishMode, PublishRecord, PublishStatus, Run,
};
use crate::runner::RunFinished;
use crate::storage::{StateStore, StoreError};

pub use action::{ActionError, CommandPublishAction, DryRunPublishAction, PublishAction};
pub use rate_limit::RateLimiter;
pub use trust::select_mode;

/// Errors that can occur while publishing.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Run {0} not found")]
    UnknownRun(Uuid),

    #[error("Proposal {0} not found")]
    UnknownProposal(String),
}

/// Result of considering a run for publishing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "kebab-case")]
pub enum PublishDecision {
    /// The change was pushed or proposed.
    Published {
        mode: PublishMode,
        proposal_id: Option<String>,
    },
    /// The maintainer is at quota; the run is reconsidered later.
    RateLimited,
    /// The run will not be published.
    Skipped { reason: String },
}

/// How far a claimed publish got.
#[derive(Debug)]
enum Claim {
    /// Record claimed, nothing published yet.
    Held,
    /// The action succeeded.
    Published {
        mode: PublishMode,
        proposal_id: Option<String>,
    },
}

impl PublishDecision {
    fn skipped(reason: impl Into<String>) -> Self {
        PublishDecision::Skipped {
            reason: reason.into(),
        }
    }
}

/// Summary of one publisher cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    /// Proposals found merged or closed.
    pub closed: usize,
    pub published: usize,
    pub rate_limited: usize,
    pub skipped: usize,
}

impl PublishReport {
    fn add(&mut self, decision: &PublishDecision) {
        match decision {
            PublishDecision::Published { .. } => self.published += 1,
            PublishDecision::RateLimited => self.rate_limited += 1,
            PublishDecision::Skipped { .. } => self.skipped += 1,
        }
    }
}

/// Publishes successful runs.
pub struct Publisher {
    store: Arc<dyn StateStore>,
    action: Arc<dyn PublishAction>,
    limiter: RateLimiter,
    trust: Vec<TrustRule>,
    default_mode: PublishMode,
    interval: Duration,
    batch_size: usize,
    metrics: MetricsCollector,
}

impl Publisher {
    /// Creates a publisher from its configuration section.
    pub fn new(
        config: &PublisherConfig,
        store: Arc<dyn StateStore>,
        action: Arc<dyn PublishAction>,
    ) -> Self {
        Self {
            store,
            action,
            limiter: RateLimiter::from_config(config),
            trust: config.trust.clone(),
            default_mode: config.default_mode,
            interval: Duration::from_secs(config.interval_secs),
            batch_size: config.batch_size,
            metrics: MetricsCollector::new(),
        }
    }

    /// The limiter, shared with ranking.
    pub fn limiter(&self) -> RateLimiter {
        self.limiter
    }

    /// Decides what to do with a run and does it.
    ///
    /// Considering the same run again returns the earlier decision without
    /// repeating any side effect, except for rate-limited runs, which are
    /// evaluated afresh.
    pub async fn consider(&self, run: &Run) -> Result<PublishDecision, PublishError> {
        if !run.is_publishable() {
            return Ok(PublishDecision::skipped("run produced no publishable change"));
        }

        if !self.store.try_claim_publish(run).await? {
            debug!(run_id = %run.id, "Run already handled by the publisher");
            return Ok(self.existing_decision(run.id).await?);
        }

        let mut claim = Claim::Held;
        let result = self.publish_claimed(run, &mut claim).await;
        match result {
            Ok(decision) => Ok(decision),
            Err(e) => {
                self.abandon_claim(run, claim, &e).await;
                Err(e)
            }
        }
    }

    /// Publishes a run whose record this publisher has claimed, tracking
    /// progress in `claim` for [`Publisher::abandon_claim`].
    async fn publish_claimed(
        &self,
        run: &Run,
        claim: &mut Claim,
    ) -> Result<PublishDecision, PublishError> {
        let mode = select_mode(&self.trust, self.default_mode, &run.key);
        if !mode.publishes() {
            let reason = format!("publish mode is {}", mode);
            return self
                .finish(run, Some(mode), PublishStatus::Skipped, Some(reason), None)
                .await;
        }

        let policy = self.store.get_policy(&run.maintainer).await?;
        let limit = self.limiter.limit_for(policy.as_ref());
        if !self.store.try_reserve_slot(&run.maintainer, limit).await? {
            let open = policy.as_ref().map_or(0, |p| p.open_proposals);
            let reason = format!(
                "maintainer {} at quota ({}/{})",
                run.maintainer,
                open,
                limit.unwrap_or(open)
            );
            return self
                .finish(run, Some(mode), PublishStatus::RateLimited, Some(reason), None)
                .await;
        }

        match self.perform(mode, run).await {
            Ok((mode, proposal_id)) => {
                *claim = Claim::Published {
                    mode,
                    proposal_id: proposal_id.clone(),
                };
                if proposal_id.is_none() {
                    // A direct push leaves nothing open.
                    self.release_slot(run).await;
                }
                self.finish(run, Some(mode), PublishStatus::Published, None, proposal_id)
                    .await
            }
            Err(e) => {
                self.release_slot(run).await;
                warn!(run_id = %run.id, key = %run.key, error = %e, "Publish action failed");
                let reason = format!("publish-failure: {}", e);
                self.finish(run, Some(mode), PublishStatus::Skipped, Some(reason), None)
                    .await
            }
        }
    }

    async fn release_slot(&self, run: &Run) {
        if let Err(e) = self.store.release_slot(&run.maintainer).await {
            warn!(
                run_id = %run.id,
                maintainer = %run.maintainer,
                error = %e,
                "Failed to release quota slot"
            );
        }
    }

    /// Settles a claimed record after a storage error so it does not stay
    /// `publishing`.
    async fn abandon_claim(&self, run: &Run, claim: Claim, cause: &PublishError) {
        error!(run_id = %run.id, key = %run.key, error = %cause, "Publish aborted");

        let now = Utc::now();
        let mut record = PublishRecord {
            run_id: run.id,
            key: run.key.clone(),
            maintainer: run.maintainer.clone(),
            mode: None,
            status: PublishStatus::Skipped,
            reason: Some(format!("publish-error: {}", cause)),
            proposal_id: None,
            proposal_status: None,
            created_at: now,
            updated_at: now,
        };
        // The change went out; keep the proposal so its slot is freed on close.
        if let Claim::Published { mode, proposal_id } = claim {
            record.mode = Some(mode);
            record.status = PublishStatus::Published;
            record.reason = None;
            record.proposal_status = proposal_id.as_ref().map(|_| ProposalStatus::Open);
            record.proposal_id = proposal_id;
        }

        if let Err(e) = self.store.finish_publish(&record).await {
            warn!(run_id = %run.id, error = %e, "Failed to settle publish record");
        }
    }

    /// Loads a run and considers it.
    pub async fn publish_run(&self, run_id: Uuid) -> Result<PublishDecision, PublishError> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(PublishError::UnknownRun(run_id))?;
        self.consider(&run).await
    }

    async fn perform(
        &self,
        mode: PublishMode,
        run: &Run,
    ) -> Result<(PublishMode, Option<String>), ActionError> {
        match mode {
            PublishMode::Push => {
                self.action.push(run).await?;
                Ok((PublishMode::Push, None))
            }
            PublishMode::AttemptPush => match self.action.push(run).await {
                Ok(()) => Ok((PublishMode::Push, None)),
                Err(ActionError::PermissionDenied(reason)) => {
                    info!(run_id = %run.id, reason = %reason, "Push not permitted, proposing instead");
                    let id = self.action.propose(run).await?;
                    Ok((PublishMode::Propose, Some(id)))
                }
                Err(e) => Err(e),
            },
            _ => {
                let id = self.action.propose(run).await?;
                Ok((PublishMode::Propose, Some(id)))
            }
        }
    }

    async fn existing_decision(&self, run_id: Uuid) -> Result<PublishDecision, StoreError> {
        let Some(record) = self.store.get_publish_record(run_id).await? else {
            return Ok(PublishDecision::skipped("publish record missing"));
        };
        Ok(match record.status {
            PublishStatus::Published => PublishDecision::Published {
                mode: record.mode.unwrap_or(PublishMode::Propose),
                proposal_id: record.proposal_id,
            },
            PublishStatus::RateLimited => PublishDecision::RateLimited,
            PublishStatus::Publishing => PublishDecision::skipped("publish already in progress"),
            PublishStatus::Skipped => {
                PublishDecision::skipped(record.reason.unwrap_or_else(|| "skipped".to_string()))
            }
        })
    }

    /// Writes the final record, audits it and updates metrics.
    async fn finish(
        &self,
        run: &Run,
        mode: Option<PublishMode>,
        status: PublishStatus,
        reason: Option<String>,
        proposal_id: Option<String>,
    ) -> Result<PublishDecision, PublishError> {
        let now = Utc::now();
        let record = PublishRecord {
            run_id: run.id,
            key: run.key.clone(),
            maintainer: run.maintainer.clone(),
            mode,
            status,
            reason: reason.clone(),
            proposal_status: proposal_id.as_ref().map(|_| ProposalStatus::Open),
            proposal_id: proposal_id.clone(),
            created_at: now,
            updated_at: now,
        };
        self.store.finish_publish(&record).await?;

        let (kind, decision) = match status {
            PublishStatus::Published => (
                AuditKind::Published,
                PublishDecision::Published {
                    mode: mode.unwrap_or(PublishMode::Propose),
                    proposal_id,
                },
            ),
            PublishStatus::RateLimited => (AuditKind::RateLimited, PublishDecision::RateLimited),
            _ => (
                AuditKind::PublishSkipped,
                PublishDecision::skipped(reason.clone().unwrap_or_default()),
            ),
        };

        let detail = match (&decision, &reason) {
            (PublishDecision::Published { mode, proposal_id }, _) => match proposal_id {
                Some(id) => format!("{} as {}", mode, id),
                None => mode.to_string(),
            },
            (_, Some(reason)) => reason.clone(),
            (_, None) => status.as_str().to_string(),
        };
        let event = AuditEvent::new(kind, detail)
            .with_run(run.id)
            .with_key(run.key.clone());
        // Best effort from here; the record is written.
        if let Err(e) = self.store.append_event(&event).await {
            warn!(run_id = %run.id, error = %e, "Failed to audit publish decision");
        }

        self.metrics.record_publish(mode, status);
        if let Ok(Some(policy)) = self.store.get_policy(&run.maintainer).await {
            self.metrics
                .set_open_proposals(&policy.maintainer, policy.open_proposals);
        }

        info!(
            run_id = %run.id,
            key = %run.key,
            maintainer = %run.maintainer,
            status = status.as_str(),
            "Publish decision recorded"
        );
        Ok(decision)
    }

    // =========================================================================
    // Proposals
    // =========================================================================

    /// Asks the action for the status of every open proposal and closes
    /// those that were merged or closed.
    ///
    /// Returns the number of proposals closed.
    pub async fn refresh_proposals(&self) -> Result<usize, PublishError> {
        let mut closed = 0;
        for record in self.store.list_open_proposals().await? {
            let Some(proposal_id) = record.proposal_id.as_deref() else {
                continue;
            };
            match self.action.proposal_status(proposal_id).await {
                Ok(ProposalStatus::Open) => {}
                Ok(status) => {
                    if self.close(&record, status).await? {
                        closed += 1;
                    }
                }
                Err(e) => {
                    warn!(proposal_id = proposal_id, error = %e, "Failed to refresh proposal status");
                }
            }
        }
        Ok(closed)
    }

    /// Records a proposal status reported from outside, e.g. a webhook.
    ///
    /// Returns `false` if the proposal was already closed.
    pub async fn report_proposal_status(
        &self,
        proposal_id: &str,
        status: ProposalStatus,
    ) -> Result<bool, PublishError> {
        let record = self
            .store
            .find_proposal(proposal_id)
            .await?
            .ok_or_else(|| PublishError::UnknownProposal(proposal_id.to_string()))?;
        if status == ProposalStatus::Open {
            return Ok(false);
        }
        self.close(&record, status).await
    }

    async fn close(
        &self,
        record: &PublishRecord,
        status: ProposalStatus,
    ) -> Result<bool, PublishError> {
        if !self.store.close_proposal(record.run_id, status).await? {
            return Ok(false);
        }

        let event = AuditEvent::new(
            AuditKind::ProposalClosed,
            format!(
                "{} {}",
                record.proposal_id.as_deref().unwrap_or("proposal"),
                status.as_str()
            ),
        )
        .with_run(record.run_id)
        .with_key(record.key.clone());
        self.store.append_event(&event).await?;

        if let Some(policy) = self.store.get_policy(&record.maintainer).await? {
            self.metrics
                .set_open_proposals(&policy.maintainer, policy.open_proposals);
        }
        info!(
            run_id = %record.run_id,
            maintainer = %record.maintainer,
            status = status.as_str(),
            "Proposal closed"
        );
        Ok(true)
    }

    // =========================================================================
    // Cycles
    // =========================================================================

    /// Considers publishable runs that were never handled or were rate limited.
    ///
    /// Up to `batch_size` runs are considered, oldest first. Once a
    /// maintainer is found at quota their remaining runs are passed over for
    /// the rest of the cycle, so a backlog from one maintainer cannot keep
    /// other maintainers' runs out of the batch.
    pub async fn publish_pending(&self) -> Result<PublishReport, PublishError> {
        let mut report = PublishReport::default();
        let mut at_quota: HashSet<String> = HashSet::new();
        let mut considered = 0;
        let mut after = None;

        while considered < self.batch_size {
            let page = self
                .store
                .list_publish_candidates(after, self.batch_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some((last.finished_at, last.id));
            let exhausted = page.len() < self.batch_size;

            for run in page {
                if considered >= self.batch_size {
                    break;
                }
                if at_quota.contains(&run.maintainer) {
                    report.rate_limited += 1;
                    continue;
                }
                let decision = self.consider(&run).await?;
                if decision == PublishDecision::RateLimited {
                    at_quota.insert(run.maintainer.clone());
                }
                report.add(&decision);
                considered += 1;
            }

            if exhausted {
                break;
            }
        }

        Ok(report)
    }

    /// One cycle: refresh proposals, which may free quota, then publish.
    pub async fn run_cycle(&self) -> Result<PublishReport, PublishError> {
        let closed = self.refresh_proposals().await?;
        let mut report = self.publish_pending().await?;
        report.closed = closed;

        info!(
            closed = report.closed,
            published = report.published,
            rate_limited = report.rate_limited,
            skipped = report.skipped,
            "Publisher cycle complete"
        );
        Ok(report)
    }

    /// Runs cycles every interval and considers runs as they finish.
    pub async fn run_loop(
        &self,
        mut shutdown: broadcast::Receiver<()>,
        mut finished: broadcast::Receiver<RunFinished>,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut listening = true;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Publisher received shutdown signal");
                    break;
                }
                event = finished.recv(), if listening => match event {
                    Ok(RunFinished { run }) if run.is_publishable() => {
                        if let Err(e) = self.consider(&run).await {
                            error!(run_id = %run.id, error = %e, "Failed to publish run");
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Missed runs are picked up by the next cycle.
                        warn!(missed = missed, "Publisher fell behind run events");
                    }
                    Err(broadcast::error::RecvError::Closed) => listening = false,
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "Publisher cycle failed");
                    }
                }
            }
        }
    }
}
