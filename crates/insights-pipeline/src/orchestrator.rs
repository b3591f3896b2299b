//! Turns enrichment requests into status transitions, run bookkeeping and agent calls.

use std::sync::Arc;

use chrono::Utc;
use insights_agent::{AgentEndpoint, AgentResponse, AgentService};
use insights_core::{
    names, EnrichStep, PayloadPatch, PipelineError, PipelineRun, QueueItem, RunStatus, StatusBand,
    StatusRegistry, MANUAL_OVERRIDE_KEY, RETURN_STATUS_KEY, SINGLE_STEP_KEY,
};
use insights_storage::{load_registry, DispatchedRun, FailureUpdate, ItemUpdate, PipelineStore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::retry::{classify_error, RetryDisposition, FULL_ENRICH_STEP};
use crate::runs::RunTracker;

/// Actor recorded on runs started by the pipeline itself.
pub const SYSTEM_ACTOR: &str = "system";

/// Result of handing an item to the agent.
#[derive(Debug, Clone, Serialize)]
pub struct Dispatch {
    pub item: QueueItem,
    pub run: PipelineRun,
    pub cancelled: Vec<Uuid>,
    pub response: AgentResponse,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriorityDispatch {
    pub item: QueueItem,
    pub response: AgentResponse,
}

/// What the agent reports when a dispatched step ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl StepResult {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FinishOutcome {
    Completed { item: QueueItem, run: PipelineRun },
    Failed { item: QueueItem, run: PipelineRun },
    /// The item no longer points at this run; nothing was written to it.
    Stale { run: PipelineRun },
}

/// Codes resolved once per operation from a fresh registry snapshot.
struct StepCodes {
    published: i32,
    pending_review: i32,
    enriched: i32,
    failed: i32,
}

impl StepCodes {
    fn resolve(registry: &StatusRegistry) -> Result<Self, PipelineError> {
        Ok(Self {
            published: registry.code_for(names::PUBLISHED)?,
            pending_review: registry.code_for(names::PENDING_REVIEW)?,
            enriched: registry.code_for(names::ENRICHED)?,
            failed: registry.code_for(names::FAILED)?,
        })
    }

    /// Published items go back through review. Failed or interrupted items keep the target
    /// they were given when first dispatched.
    fn return_status_for(&self, item: &QueueItem) -> i32 {
        if item.status_code == self.published {
            return self.pending_review;
        }
        let interrupted = item.status_code == self.failed
            || (StatusBand::of(item.status_code) == StatusBand::Enrichment
                && item.status_code != self.enriched);
        match item.return_status_hint() {
            Some(hint) if interrupted && hint == self.pending_review => self.pending_review,
            _ => self.enriched,
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn PipelineStore>,
    agent: Arc<dyn AgentService>,
    runs: RunTracker,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn PipelineStore>, agent: Arc<dyn AgentService>) -> Self {
        let runs = RunTracker::new(store.clone());
        Self { store, agent, runs }
    }

    pub fn runs(&self) -> &RunTracker {
        &self.runs
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.store
    }

    async fn require_item(&self, queue_id: Uuid) -> Result<QueueItem, PipelineError> {
        self.store
            .get_item(queue_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("queue_item", queue_id))
    }

    /// Re-run one named step. Unknown names fail before anything is read or written.
    pub async fn run_step(
        &self,
        step: &str,
        queue_id: Uuid,
        created_by: &str,
    ) -> Result<Dispatch, PipelineError> {
        let step: EnrichStep = step.parse()?;
        self.run_step_by(step, queue_id, created_by).await
    }

    pub async fn run_step_by(
        &self,
        step: EnrichStep,
        queue_id: Uuid,
        created_by: &str,
    ) -> Result<Dispatch, PipelineError> {
        let span = info_span!("run_step", %queue_id, step = step.as_str());
        async move {
            self.agent.check_ready()?;
            let registry = load_registry(self.store.as_ref()).await?;
            let entry_code = registry.code_for(step.entry_status_name())?;
            let codes = StepCodes::resolve(&registry)?;

            let item = self.require_item(queue_id).await?;
            let previous = item.status_code;
            let return_status = codes.return_status_for(&item);
            let prompt = self.store.current_prompt(step.agent_name()).await?;

            let update = ItemUpdate {
                patch: PayloadPatch::new()
                    .set(RETURN_STATUS_KEY, return_status)
                    .set(SINGLE_STEP_KEY, step.as_str()),
                clear_priority: true,
                ..Default::default()
            };
            let DispatchedRun {
                run,
                cancelled,
                item,
            } = self
                .runs
                .dispatch(queue_id, &format!("re-{step}"), created_by, entry_code, update)
                .await?;
            info!(
                from = %registry.label(previous),
                to = %registry.label(entry_code),
                return_status = %registry.label(return_status),
                "item queued for single step"
            );

            let body = json!({
                "id": queue_id,
                "step": step.as_str(),
                "run_id": run.id,
                "prompt_version": prompt.map(|p| p.version),
            });
            let response = self
                .agent
                .invoke(AgentEndpoint::EnrichSingleStep, body)
                .await
                .inspect_err(|err| {
                    warn!(run_id = %run.id, error = %err, "agent call failed after status change");
                })?;

            Ok(Dispatch {
                item,
                run,
                cancelled,
                response,
            })
        }
        .instrument(span)
        .await
    }

    /// Restart the whole enrichment sequence. The agent is told to land the item in review.
    pub async fn reenrich(
        &self,
        queue_id: Uuid,
        created_by: &str,
    ) -> Result<Dispatch, PipelineError> {
        let span = info_span!("reenrich", %queue_id);
        async move {
            self.agent.check_ready()?;
            let registry = load_registry(self.store.as_ref()).await?;
            let pending_enrichment = registry.code_for(names::PENDING_ENRICHMENT)?;
            let pending_review = registry.code_for(names::PENDING_REVIEW)?;

            self.require_item(queue_id).await?;
            let update = ItemUpdate {
                patch: PayloadPatch::new()
                    .set(MANUAL_OVERRIDE_KEY, true)
                    .set(RETURN_STATUS_KEY, pending_review)
                    .remove(SINGLE_STEP_KEY),
                failures: FailureUpdate::Reset,
                clear_priority: true,
                ..Default::default()
            };
            let DispatchedRun {
                run,
                cancelled,
                item,
            } = self
                .runs
                .dispatch(queue_id, "re-enrich", created_by, pending_enrichment, update)
                .await?;
            info!(run_id = %run.id, "item reset for full enrichment");

            let response = self
                .agent
                .invoke(
                    AgentEndpoint::EnrichItem,
                    json!({"id": queue_id, "run_id": run.id}),
                )
                .await
                .inspect_err(|err| {
                    warn!(run_id = %run.id, error = %err, "agent call failed after status change");
                })?;

            Ok(Dispatch {
                item,
                run,
                cancelled,
                response,
            })
        }
        .instrument(span)
        .await
    }

    /// Ask the agent to handle an item now. The status is left alone.
    pub async fn prioritize(&self, queue_id: Uuid) -> Result<PriorityDispatch, PipelineError> {
        self.agent.check_ready()?;
        let item = self.require_item(queue_id).await?;
        if StatusBand::of(item.status_code) == StatusBand::Terminal {
            let registry = load_registry(self.store.as_ref()).await?;
            return Err(PipelineError::invalid_transition(
                "queue_item",
                registry.label(item.status_code),
                "priority",
            ));
        }

        let item = self.store.mark_priority(queue_id, Utc::now()).await?;
        info!(%queue_id, "priority processing requested");
        let response = self
            .agent
            .invoke(AgentEndpoint::ProcessItem, json!({"id": queue_id}))
            .await?;
        Ok(PriorityDispatch { item, response })
    }

    /// Record the agent's result for `run_id`. Results for superseded runs are dropped.
    pub async fn finish_step(
        &self,
        queue_id: Uuid,
        run_id: Uuid,
        result: StepResult,
    ) -> Result<FinishOutcome, PipelineError> {
        let registry = load_registry(self.store.as_ref()).await?;
        let pending_review = registry.code_for(names::PENDING_REVIEW)?;
        let failed = registry.code_for(names::FAILED)?;
        let dead_letter = registry.code_for(names::DEAD_LETTER)?;

        let item = self.require_item(queue_id).await?;
        let run = self.runs.get(run_id).await?;
        if run.queue_id != queue_id {
            return Err(PipelineError::Validation(format!(
                "run {run_id} does not belong to queue item {queue_id}"
            )));
        }
        if item.current_run_id != Some(run_id) {
            return self.drop_stale(run_id).await;
        }

        let (status_code, update, run_status) = if result.success {
            let target = item
                .return_status_hint()
                .filter(|code| registry.contains(*code))
                .unwrap_or(pending_review);
            let update = ItemUpdate {
                patch: PayloadPatch::new()
                    .remove(RETURN_STATUS_KEY)
                    .remove(SINGLE_STEP_KEY)
                    .remove(MANUAL_OVERRIDE_KEY),
                failures: FailureUpdate::Reset,
                expect_run_id: Some(run_id),
                ..Default::default()
            };
            (target, update, RunStatus::Completed)
        } else {
            let step = item
                .single_step_hint()
                .map(EnrichStep::as_str)
                .unwrap_or(FULL_ENRICH_STEP);
            let message = result.error.as_deref().unwrap_or_default();
            let target = match classify_error(message) {
                RetryDisposition::Retryable => failed,
                RetryDisposition::NonRetryable => dead_letter,
            };
            let update = ItemUpdate {
                failures: FailureUpdate::record(step, message, Utc::now()),
                expect_run_id: Some(run_id),
                ..Default::default()
            };
            (target, update, RunStatus::Failed)
        };

        let item = match self.store.update_status(queue_id, status_code, update).await {
            Ok(item) => item,
            Err(PipelineError::Conflict(_)) => return self.drop_stale(run_id).await,
            Err(err) => return Err(err),
        };
        let run = self.runs.complete(run_id, run_status).await?;
        info!(
            %queue_id,
            %run_id,
            status = %registry.label(item.status_code),
            "step result recorded"
        );

        if result.success {
            Ok(FinishOutcome::Completed { item, run })
        } else {
            Ok(FinishOutcome::Failed { item, run })
        }
    }

    async fn drop_stale(&self, run_id: Uuid) -> Result<FinishOutcome, PipelineError> {
        warn!(%run_id, "ignoring result of superseded pipeline run");
        let run = self.runs.complete(run_id, RunStatus::Cancelled).await?;
        Ok(FinishOutcome::Stale { run })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{insert_item, seeded_store};
    use insights_agent::RecordingAgent;
    use insights_core::{NewPromptVersion, StatusRegistry};

    async fn registry(store: &Arc<dyn PipelineStore>) -> StatusRegistry {
        load_registry(store.as_ref()).await.unwrap()
    }

    async fn setup(status: &str) -> (Arc<dyn PipelineStore>, Arc<RecordingAgent>, Orchestrator, QueueItem) {
        let store = seeded_store().await;
        let item = insert_item(&store, status, "bis").await;
        let agent = Arc::new(RecordingAgent::new());
        let orchestrator = Orchestrator::new(store.clone(), agent.clone());
        (store, agent, orchestrator, item)
    }

    #[tokio::test]
    async fn published_items_return_to_review() {
        let (store, agent, orchestrator, item) = setup("published").await;
        let registry = registry(&store).await;

        let dispatch = orchestrator.run_step("tag", item.id, "editor@example.com").await.unwrap();
        assert_eq!(dispatch.item.status_code, registry.code_for("to_tag").unwrap());
        assert_eq!(dispatch.item.current_run_id, Some(dispatch.run.id));
        assert_eq!(
            dispatch.item.return_status_hint(),
            Some(registry.code_for("pending_review").unwrap())
        );
        assert_eq!(dispatch.item.payload["_single_step"], "tag");
        assert_eq!(dispatch.item.payload["title"], "Operational resilience update");
        assert_eq!(dispatch.run.trigger, "re-tag");
        assert_eq!(dispatch.response.status, 200);
        assert_eq!(agent.calls()[0].0, AgentEndpoint::EnrichSingleStep);
    }

    #[tokio::test]
    async fn enriched_items_return_to_enriched() {
        let (store, _agent, orchestrator, item) = setup("enriched").await;
        let registry = registry(&store).await;

        let dispatch = orchestrator.run_step("tag", item.id, "editor@example.com").await.unwrap();
        assert_eq!(
            dispatch.item.return_status_hint(),
            Some(registry.code_for("enriched").unwrap())
        );
    }

    #[tokio::test]
    async fn unknown_step_writes_nothing() {
        let (store, agent, orchestrator, item) = setup("enriched").await;

        let err = orchestrator.run_step("translate", item.id, "editor@example.com").await.unwrap_err();
        assert!(matches!(err, PipelineError::UnknownStep(_)));
        assert!(err.is_validation());

        assert_eq!(store.get_item(item.id).await.unwrap().unwrap(), item);
        assert!(store.runs_for_item(item.id).await.unwrap().is_empty());
        assert!(agent.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_items_and_misconfigured_agents_write_nothing() {
        let (store, _agent, orchestrator, item) = setup("enriched").await;
        let err = orchestrator.run_step("tag", Uuid::new_v4(), "system").await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { entity: "queue_item", .. }));

        let broken = Orchestrator::new(
            store.clone(),
            Arc::new(RecordingAgent::misconfigured("AGENT_API_KEY is not set")),
        );
        let err = broken.run_step("summarize", item.id, "system").await.unwrap_err();
        assert!(matches!(err, PipelineError::Misconfigured(_)));
        assert_eq!(store.get_item(item.id).await.unwrap().unwrap(), item);
        assert!(store.runs_for_item(item.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upstream_failure_leaves_item_in_progress() {
        let store = seeded_store().await;
        let item = insert_item(&store, "enriched", "bis").await;
        let orchestrator = Orchestrator::new(
            store.clone(),
            Arc::new(RecordingAgent::unavailable(502, "<html>\n<h1>Bad Gateway</h1>\n</html>")),
        );

        let err = orchestrator.run_step("summarize", item.id, "system").await.unwrap_err();
        assert_eq!(err.http_status(), 502);
        assert!(matches!(err, PipelineError::UpstreamUnavailable { ref preview, .. } if !preview.contains('\n')));

        let current = store.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(current.status_code, registry(&store).await.code_for("to_summarize").unwrap());
        let runs = store.runs_for_item(item.id).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Running);
    }

    #[tokio::test]
    async fn concurrent_steps_leave_one_running_run() {
        let (store, _agent, orchestrator, item) = setup("enriched").await;
        let mut handles = Vec::new();
        for step in ["summarize", "tag", "thumbnail", "tag", "summarize", "thumbnail"] {
            let orchestrator = orchestrator.clone();
            handles.push(tokio::spawn(async move {
                orchestrator.run_step(step, item.id, "system").await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let runs = store.runs_for_item(item.id).await.unwrap();
        let running = runs.iter().filter(|r| r.status == RunStatus::Running).collect::<Vec<_>>();
        assert_eq!(running.len(), 1);
        assert_eq!(runs.len(), 6);
        let current = store.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(current.current_run_id, Some(running[0].id));

        // the live run's result is applied, every cancelled run's result is dropped
        for run in runs.iter().filter(|r| r.status == RunStatus::Cancelled) {
            let outcome = orchestrator
                .finish_step(item.id, run.id, StepResult::succeeded())
                .await
                .unwrap();
            assert!(matches!(outcome, FinishOutcome::Stale { .. }));
        }
        let outcome = orchestrator
            .finish_step(item.id, running[0].id, StepResult::succeeded())
            .await
            .unwrap();
        assert!(matches!(outcome, FinishOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn request_carries_current_prompt_version() {
        let (store, agent, orchestrator, item) = setup("enriched").await;
        let prompt = store
            .insert_prompt(NewPromptVersion {
                agent_name: "tagger".into(),
                version: "2.3.0".into(),
                prompt_text: "Tag with the BFSI taxonomy.".into(),
                model_id: None,
                notes: None,
            })
            .await
            .unwrap();
        store.make_current(prompt.id, None, Utc::now()).await.unwrap();

        orchestrator.run_step("tag", item.id, "system").await.unwrap();
        orchestrator.run_step("summarize", item.id, "system").await.unwrap();
        let calls = agent.calls();
        assert_eq!(calls[0].1["prompt_version"], "2.3.0");
        assert!(calls[1].1["prompt_version"].is_null());
    }

    #[tokio::test]
    async fn finishing_moves_item_to_return_status() {
        let (store, _agent, orchestrator, item) = setup("published").await;
        let registry = registry(&store).await;
        let dispatch = orchestrator.run_step("tag", item.id, "system").await.unwrap();

        let outcome = orchestrator
            .finish_step(item.id, dispatch.run.id, StepResult::succeeded())
            .await
            .unwrap();
        let FinishOutcome::Completed { item, run } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(item.status_code, registry.code_for("pending_review").unwrap());
        assert!(item.payload.get("_return_status").is_none());
        assert!(item.payload.get("_single_step").is_none());
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn superseded_results_are_ignored() {
        let (store, _agent, orchestrator, item) = setup("enriched").await;
        let first = orchestrator.run_step("tag", item.id, "system").await.unwrap();
        let second = orchestrator.run_step("summarize", item.id, "system").await.unwrap();

        let outcome = orchestrator
            .finish_step(item.id, first.run.id, StepResult::succeeded())
            .await
            .unwrap();
        assert!(matches!(outcome, FinishOutcome::Stale { ref run } if run.status == RunStatus::Cancelled));

        let current = store.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(current, second.item);
    }

    #[tokio::test]
    async fn failures_are_counted_and_keep_hints() {
        let (store, _agent, orchestrator, item) = setup("published").await;
        let registry = registry(&store).await;
        let dispatch = orchestrator.run_step("thumbnail", item.id, "system").await.unwrap();

        let outcome = orchestrator
            .finish_step(item.id, dispatch.run.id, StepResult::failed("screenshot timed out"))
            .await
            .unwrap();
        let FinishOutcome::Failed { item, run } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(item.status_code, registry.code_for("failed").unwrap());
        assert_eq!(item.failure_count, 1);
        assert_eq!(item.last_failed_step.as_deref(), Some("thumbnail"));
        assert_eq!(item.last_error_message.as_deref(), Some("screenshot timed out"));
        assert!(item.last_error_at.is_some_and(|at| at >= run.created_at));
        assert_eq!(item.return_status_hint(), Some(registry.code_for("pending_review").unwrap()));
        assert_eq!(run.status, RunStatus::Failed);

        // a retry of a failed, formerly published item still lands in review
        let retry = orchestrator.run_step("thumbnail", item.id, "system").await.unwrap();
        assert_eq!(
            retry.item.return_status_hint(),
            Some(registry.code_for("pending_review").unwrap())
        );
    }

    #[tokio::test]
    async fn permanent_failures_go_straight_to_dead_letter() {
        let (store, _agent, orchestrator, item) = setup("enriched").await;
        let dispatch = orchestrator.run_step("summarize", item.id, "system").await.unwrap();
        let outcome = orchestrator
            .finish_step(item.id, dispatch.run.id, StepResult::failed("404 page not found"))
            .await
            .unwrap();
        let FinishOutcome::Failed { item, .. } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(item.status_code, registry(&store).await.code_for("dead_letter").unwrap());
    }

    #[tokio::test]
    async fn reenrich_resets_failures_and_targets_review() {
        let (store, agent, orchestrator, item) = setup("enriched").await;
        let registry = registry(&store).await;
        let dispatch = orchestrator.run_step("tag", item.id, "system").await.unwrap();
        orchestrator
            .finish_step(item.id, dispatch.run.id, StepResult::failed("rate limit"))
            .await
            .unwrap();

        let dispatch = orchestrator.reenrich(item.id, "editor@example.com").await.unwrap();
        assert_eq!(dispatch.run.trigger, "re-enrich");
        assert_eq!(dispatch.item.status_code, registry.code_for("pending_enrichment").unwrap());
        assert_eq!(dispatch.item.failure_count, 0);
        assert!(dispatch.item.last_failed_step.is_none());
        assert!(dispatch.item.last_error_message.is_none());
        assert_eq!(dispatch.item.payload["_manual_override"], true);
        assert!(dispatch.item.payload.get("_single_step").is_none());
        assert_eq!(
            dispatch.item.return_status_hint(),
            Some(registry.code_for("pending_review").unwrap())
        );
        assert_eq!(agent.calls().last().unwrap().0, AgentEndpoint::EnrichItem);
    }

    #[tokio::test]
    async fn prioritize_keeps_status_and_rejects_terminal_items() {
        let (store, agent, orchestrator, item) = setup("pending_enrichment").await;
        let dispatch = orchestrator.prioritize(item.id).await.unwrap();
        assert_eq!(dispatch.item.status_code, item.status_code);
        assert!(dispatch.item.priority_requested_at.is_some());
        assert_eq!(agent.calls()[0].0, AgentEndpoint::ProcessItem);

        let rejected = insert_item(&store, "rejected", "bis").await;
        let err = orchestrator.prioritize(rejected.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
    }
}
