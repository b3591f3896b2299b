//! Periodic recovery of failed and stalled queue items.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use insights_core::{names, EnrichStep, PipelineError, QueueItem};
use insights_storage::{load_registry, FailureUpdate, ItemUpdate, PipelineStore};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::orchestrator::{Dispatch, Orchestrator, StepResult};
use crate::retry::{RetryPolicies, FULL_ENRICH_STEP};

/// Actor recorded on runs started by the scheduler.
pub const RETRY_ACTOR: &str = "retry-scheduler";

/// Failed items read per tick, as a multiple of the batch limit.
const CANDIDATE_WINDOW: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Candidate {
    Failed,
    Stalled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    pub examined: usize,
    pub redispatched: usize,
    pub deferred: usize,
    pub dead_lettered: usize,
    pub errors: usize,
}

pub struct RetryScheduler {
    store: Arc<dyn PipelineStore>,
    orchestrator: Orchestrator,
    policies: RetryPolicies,
    batch_limit: i64,
    stall_after: chrono::Duration,
}

impl RetryScheduler {
    pub fn new(
        orchestrator: Orchestrator,
        policies: RetryPolicies,
        batch_limit: i64,
        stall_after: chrono::Duration,
    ) -> Self {
        Self {
            store: orchestrator.store().clone(),
            orchestrator,
            policies,
            batch_limit: batch_limit.max(1),
            stall_after,
        }
    }

    /// One pass: prioritized items first, then the oldest update. Items still backing off
    /// are skipped without using up the batch.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<RetrySummary, PipelineError> {
        let registry = load_registry(self.store.as_ref()).await?;
        let failed = registry.code_for(names::FAILED)?;
        let dead_letter = registry.code_for(names::DEAD_LETTER)?;
        let in_flight = registry.codes_between(names::PENDING_ENRICHMENT, names::ENRICHED)?;

        let mut candidates = self
            .store
            .list_retry_candidates(failed, self.batch_limit.saturating_mul(CANDIDATE_WINDOW))
            .await?
            .into_iter()
            .map(|item| (Candidate::Failed, item))
            .collect::<Vec<_>>();
        let stalled = self
            .store
            .list_stalled(&in_flight, now - self.stall_after, self.batch_limit)
            .await?;
        candidates.extend(stalled.into_iter().map(|item| (Candidate::Stalled, item)));

        candidates.sort_by(|(_, a), (_, b)| {
            a.priority_requested_at
                .is_none()
                .cmp(&b.priority_requested_at.is_none())
                .then(a.priority_requested_at.cmp(&b.priority_requested_at))
                .then(a.updated_at.cmp(&b.updated_at))
        });

        let batch = usize::try_from(self.batch_limit).unwrap_or(usize::MAX);
        let mut summary = RetrySummary::default();
        for (kind, item) in candidates {
            if summary.redispatched + summary.dead_lettered + summary.errors >= batch {
                break;
            }
            summary.examined += 1;
            let step = match kind {
                Candidate::Failed => item.last_failed_step.as_deref().and_then(|s| s.parse().ok()),
                Candidate::Stalled => item.single_step_hint(),
            };
            let step_name = step.map(EnrichStep::as_str).unwrap_or(FULL_ENRICH_STEP);
            let policy = self.policies.for_step(step_name);

            if kind == Candidate::Failed {
                if policy.is_exhausted(item.failure_count) {
                    match self.move_to_dead_letter(&item, dead_letter, now).await {
                        Ok(()) => {
                            warn!(
                                queue_id = %item.id,
                                failures = item.failure_count,
                                step = step_name,
                                "retries exhausted; moved to dead letter"
                            );
                            summary.dead_lettered += 1;
                        }
                        Err(err) => {
                            warn!(queue_id = %item.id, error = %err, "dead-letter move failed");
                            summary.errors += 1;
                        }
                    }
                    continue;
                }
                let attempt = u32::try_from(item.failure_count).unwrap_or(0);
                let due = item.updated_at
                    + chrono::Duration::from_std(policy.delay_for_attempt(attempt))
                        .unwrap_or_else(|_| chrono::Duration::minutes(5));
                if item.priority_requested_at.is_none() && due > now {
                    summary.deferred += 1;
                    continue;
                }
            }

            match self.redispatch(&item, step).await {
                Ok(dispatch) => {
                    info!(
                        queue_id = %item.id,
                        run_id = %dispatch.run.id,
                        agent_status = dispatch.response.status,
                        ?kind,
                        "item redispatched"
                    );
                    summary.redispatched += 1;
                }
                Err(err) => {
                    warn!(queue_id = %item.id, error = %err, ?kind, "redispatch failed");
                    summary.errors += 1;
                    if let Err(record_err) = self.record_dispatch_failure(&item, &err).await {
                        warn!(
                            queue_id = %item.id,
                            error = %record_err,
                            "could not record redispatch failure"
                        );
                    }
                }
            }
        }

        info!(
            examined = summary.examined,
            redispatched = summary.redispatched,
            deferred = summary.deferred,
            dead_lettered = summary.dead_lettered,
            errors = summary.errors,
            "retry tick finished"
        );
        Ok(summary)
    }

    async fn move_to_dead_letter(
        &self,
        item: &QueueItem,
        dead_letter: i32,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        let reason = match item.last_error_message.as_deref() {
            Some(message) => format!("Max retries exhausted: {message}"),
            None => "Max retries exhausted".to_string(),
        };
        let update = ItemUpdate {
            failures: FailureUpdate::note(reason, now),
            clear_priority: true,
            ..Default::default()
        };
        self.store.update_status(item.id, dead_letter, update).await?;
        Ok(())
    }

    async fn redispatch(
        &self,
        item: &QueueItem,
        step: Option<EnrichStep>,
    ) -> Result<Dispatch, PipelineError> {
        match step {
            Some(step) => self.orchestrator.run_step_by(step, item.id, RETRY_ACTOR).await,
            None => self.orchestrator.reenrich(item.id, RETRY_ACTOR).await,
        }
    }

    /// The agent never saw the item, so report the failure against whichever run now owns it.
    async fn record_dispatch_failure(
        &self,
        item: &QueueItem,
        err: &PipelineError,
    ) -> Result<(), PipelineError> {
        if !matches!(err, PipelineError::UpstreamUnavailable { .. }) {
            return Ok(());
        }
        let Some(current) = self.store.get_item(item.id).await? else {
            return Ok(());
        };
        if let Some(run_id) = current.current_run_id {
            self.orchestrator
                .finish_step(item.id, run_id, StepResult::failed(err.to_string()))
                .await?;
        }
        Ok(())
    }
}

/// Registers the retry tick on `cron` when the scheduler is enabled.
pub async fn maybe_build_scheduler(
    enabled: bool,
    cron: &str,
    scheduler: Arc<RetryScheduler>,
) -> Result<Option<JobScheduler>> {
    if !enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let scheduler = Arc::clone(&scheduler);
        Box::pin(async move {
            if let Err(err) = scheduler.tick(Utc::now()).await {
                warn!(error = %err, "retry tick failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
