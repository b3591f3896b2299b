//! In-process store. Every operation holds one lock, so each call is atomic.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use insights_core::{
    NewPromptVersion, NewQueueItem, PipelineError, PipelineRun, PromptVersion, QueueItem,
    RunStatus, Stage, StatusCode,
};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    DispatchedRun, FailureUpdate, ItemUpdate, PromptStore, QueueFilter, QueueStore, RunStore,
    RunTransition, StartedRun, StatusStore, StoreResult,
};

#[derive(Debug, Default)]
struct MemoryState {
    statuses: BTreeMap<i32, StatusCode>,
    items: HashMap<Uuid, QueueItem>,
    runs: HashMap<Uuid, PipelineRun>,
    prompts: HashMap<Uuid, PromptVersion>,
}

impl MemoryState {
    fn require_status(&self, status_code: i32) -> StoreResult<()> {
        if self.statuses.contains_key(&status_code) {
            Ok(())
        } else {
            Err(PipelineError::Validation(format!(
                "unknown status code {status_code}"
            )))
        }
    }

    fn update_item(
        &mut self,
        id: Uuid,
        status_code: i32,
        update: ItemUpdate,
    ) -> StoreResult<QueueItem> {
        self.require_status(status_code)?;
        if let Some(Some(run_id)) = update.current_run_id {
            let owned = self.runs.get(&run_id).is_some_and(|run| run.queue_id == id);
            if !owned {
                return Err(PipelineError::Validation(format!(
                    "run {run_id} does not belong to queue item {id}"
                )));
            }
        }
        let item = self
            .items
            .get_mut(&id)
            .ok_or_else(|| PipelineError::not_found("queue_item", id))?;
        if let Some(expected) = update.expect_run_id {
            if item.current_run_id != Some(expected) {
                return Err(PipelineError::Conflict(format!(
                    "queue item {id} no longer points at run {expected}"
                )));
            }
        }

        item.status_code = status_code;
        if let Some(run_id) = update.current_run_id {
            item.current_run_id = run_id;
        }
        update.patch.apply(&mut item.payload);
        match update.failures {
            FailureUpdate::Keep => {}
            FailureUpdate::Reset => {
                item.failure_count = 0;
                item.last_failed_step = None;
                item.last_error_message = None;
                item.last_error_at = None;
            }
            FailureUpdate::Record { step, error, at } => {
                item.failure_count += 1;
                item.last_failed_step = Some(step);
                item.last_error_message = Some(error);
                item.last_error_at = Some(at);
            }
            FailureUpdate::Note { error, at } => {
                item.last_error_message = Some(error);
                item.last_error_at = Some(at);
            }
        }
        if update.clear_priority {
            item.priority_requested_at = None;
        }
        item.updated_at = Utc::now();
        Ok(item.clone())
    }

    fn start_run(
        &mut self,
        queue_id: Uuid,
        trigger: &str,
        created_by: &str,
    ) -> StoreResult<StartedRun> {
        if !self.items.contains_key(&queue_id) {
            return Err(PipelineError::not_found("queue_item", queue_id));
        }
        let now = Utc::now();
        let mut cancelled = Vec::new();
        for run in self.runs.values_mut() {
            if run.queue_id == queue_id && run.status == RunStatus::Running {
                run.status = RunStatus::Cancelled;
                run.completed_at = Some(now);
                cancelled.push(run.id);
            }
        }
        let run = PipelineRun {
            id: Uuid::new_v4(),
            queue_id,
            trigger: trigger.to_string(),
            status: RunStatus::Running,
            created_by: created_by.to_string(),
            created_at: now,
            completed_at: None,
        };
        self.runs.insert(run.id, run.clone());
        Ok(StartedRun { run, cancelled })
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_statuses(rows: impl IntoIterator<Item = StatusCode>) -> Self {
        let state = MemoryState {
            statuses: rows.into_iter().map(|row| (row.code, row)).collect(),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }
}

fn sorted_items(mut items: Vec<QueueItem>) -> Vec<QueueItem> {
    items.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
    items
}

/// Priority requests first, oldest request first, then the oldest update.
fn retry_order(mut items: Vec<QueueItem>, limit: i64) -> Vec<QueueItem> {
    items.sort_by(|a, b| {
        a.priority_requested_at
            .is_none()
            .cmp(&b.priority_requested_at.is_none())
            .then(a.priority_requested_at.cmp(&b.priority_requested_at))
            .then(a.updated_at.cmp(&b.updated_at))
            .then(a.id.cmp(&b.id))
    });
    apply_limit(items, Some(limit))
}

fn apply_limit<T>(mut rows: Vec<T>, limit: Option<i64>) -> Vec<T> {
    if let Some(limit) = limit {
        rows.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
    }
    rows
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn load_statuses(&self) -> StoreResult<Vec<StatusCode>> {
        let state = self.state.lock().await;
        Ok(state.statuses.values().cloned().collect())
    }

    async fn upsert_statuses(&self, rows: &[StatusCode]) -> StoreResult<usize> {
        let mut state = self.state.lock().await;
        for row in rows {
            let taken = state
                .statuses
                .values()
                .any(|existing| existing.name == row.name && existing.code != row.code);
            if taken {
                return Err(PipelineError::Conflict(format!(
                    "status name {} already bound to another code",
                    row.name
                )));
            }
            state.statuses.insert(row.code, row.clone());
        }
        Ok(rows.len())
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn insert_item(&self, item: NewQueueItem) -> StoreResult<QueueItem> {
        let mut state = self.state.lock().await;
        if !state.statuses.contains_key(&item.status_code) {
            return Err(PipelineError::Validation(format!(
                "unknown status code {}",
                item.status_code
            )));
        }
        if state.items.values().any(|existing| existing.url == item.url) {
            return Err(PipelineError::Conflict(format!(
                "queue item already exists for {}",
                item.url
            )));
        }
        let now = Utc::now();
        let payload = if item.payload.is_object() {
            item.payload
        } else {
            JsonValue::Object(Default::default())
        };
        let row = QueueItem {
            id: Uuid::new_v4(),
            url: item.url,
            status_code: item.status_code,
            payload,
            current_run_id: None,
            failure_count: 0,
            last_failed_step: None,
            last_error_message: None,
            last_error_at: None,
            priority_requested_at: None,
            discovered_at: now,
            updated_at: now,
        };
        state.items.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_item(&self, id: Uuid) -> StoreResult<Option<QueueItem>> {
        let state = self.state.lock().await;
        Ok(state.items.get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status_code: i32,
        update: ItemUpdate,
    ) -> StoreResult<QueueItem> {
        let mut state = self.state.lock().await;
        state.update_item(id, status_code, update)
    }

    async fn list_by_status_range(
        &self,
        min: i32,
        max: i32,
        limit: Option<i64>,
    ) -> StoreResult<Vec<QueueItem>> {
        let state = self.state.lock().await;
        let filter = QueueFilter::status_range(min, max);
        let items = state
            .items
            .values()
            .filter(|item| filter.matches(item))
            .cloned()
            .collect();
        Ok(apply_limit(sorted_items(items), limit))
    }

    async fn list_retry_candidates(
        &self,
        status_code: i32,
        limit: i64,
    ) -> StoreResult<Vec<QueueItem>> {
        let state = self.state.lock().await;
        let items = state
            .items
            .values()
            .filter(|item| item.status_code == status_code)
            .cloned()
            .collect();
        Ok(retry_order(items, limit))
    }

    async fn list_stalled(
        &self,
        status_codes: &[i32],
        before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<QueueItem>> {
        let state = self.state.lock().await;
        let items = state
            .items
            .values()
            .filter(|item| status_codes.contains(&item.status_code) && item.updated_at < before)
            .filter(|item| {
                item.current_run_id
                    .and_then(|run_id| state.runs.get(&run_id))
                    .is_some_and(|run| run.status == RunStatus::Running)
            })
            .cloned()
            .collect();
        Ok(retry_order(items, limit))
    }

    async fn count_items(&self, filter: &QueueFilter) -> StoreResult<i64> {
        let state = self.state.lock().await;
        let count = state.items.values().filter(|item| filter.matches(item)).count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn mark_priority(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<QueueItem> {
        let mut state = self.state.lock().await;
        let item = state
            .items
            .get_mut(&id)
            .ok_or_else(|| PipelineError::not_found("queue_item", id))?;
        item.priority_requested_at = Some(at);
        Ok(item.clone())
    }

    async fn list_discovered_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<QueueItem>> {
        let state = self.state.lock().await;
        let mut items = state
            .items
            .values()
            .filter(|item| item.discovered_at >= since)
            .cloned()
            .collect::<Vec<_>>();
        items.sort_by_key(|item| item.discovered_at);
        Ok(items)
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn start_run(
        &self,
        queue_id: Uuid,
        trigger: &str,
        created_by: &str,
    ) -> StoreResult<StartedRun> {
        let mut state = self.state.lock().await;
        state.start_run(queue_id, trigger, created_by)
    }

    async fn dispatch_run(
        &self,
        queue_id: Uuid,
        trigger: &str,
        created_by: &str,
        status_code: i32,
        update: ItemUpdate,
    ) -> StoreResult<DispatchedRun> {
        let mut state = self.state.lock().await;
        state.require_status(status_code)?;
        let StartedRun { run, cancelled } = state.start_run(queue_id, trigger, created_by)?;
        let update = ItemUpdate {
            current_run_id: Some(Some(run.id)),
            expect_run_id: None,
            ..update
        };
        let item = state.update_item(queue_id, status_code, update)?;
        Ok(DispatchedRun {
            run,
            cancelled,
            item,
        })
    }

    async fn complete_run(&self, run_id: Uuid, status: RunStatus) -> StoreResult<RunTransition> {
        if !status.is_terminal() {
            return Err(PipelineError::Validation(
                "a run can only be completed with a terminal status".into(),
            ));
        }
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| PipelineError::not_found("pipeline_run", run_id))?;
        if run.status.is_terminal() {
            return Ok(RunTransition::AlreadyTerminal(run.clone()));
        }
        run.status = status;
        run.completed_at = Some(Utc::now());
        Ok(RunTransition::Applied(run.clone()))
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<PipelineRun>> {
        let state = self.state.lock().await;
        Ok(state.runs.get(&run_id).cloned())
    }

    async fn runs_for_item(&self, queue_id: Uuid) -> StoreResult<Vec<PipelineRun>> {
        let state = self.state.lock().await;
        let mut runs = state
            .runs
            .values()
            .filter(|run| run.queue_id == queue_id)
            .cloned()
            .collect::<Vec<_>>();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(runs)
    }
}

#[async_trait]
impl PromptStore for MemoryStore {
    async fn insert_prompt(&self, prompt: NewPromptVersion) -> StoreResult<PromptVersion> {
        let mut state = self.state.lock().await;
        let duplicate = state
            .prompts
            .values()
            .any(|p| p.agent_name == prompt.agent_name && p.version == prompt.version);
        if duplicate {
            return Err(PipelineError::Conflict(format!(
                "prompt version {} already exists for {}",
                prompt.version, prompt.agent_name
            )));
        }
        let row = PromptVersion {
            id: Uuid::new_v4(),
            agent_name: prompt.agent_name,
            version: prompt.version,
            prompt_text: prompt.prompt_text,
            model_id: prompt.model_id,
            stage: Stage::Dev,
            notes: prompt.notes,
            created_at: Utc::now(),
            deployed_at: None,
            retired_at: None,
        };
        state.prompts.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_prompt(&self, id: Uuid) -> StoreResult<Option<PromptVersion>> {
        let state = self.state.lock().await;
        Ok(state.prompts.get(&id).cloned())
    }

    async fn list_prompts(&self, agent_name: Option<&str>) -> StoreResult<Vec<PromptVersion>> {
        let state = self.state.lock().await;
        let mut rows = state
            .prompts
            .values()
            .filter(|p| agent_name.map_or(true, |agent| p.agent_name == agent))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| {
            a.agent_name
                .cmp(&b.agent_name)
                .then_with(|| b.version.cmp(&a.version))
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(rows)
    }

    async fn current_prompt(&self, agent_name: &str) -> StoreResult<Option<PromptVersion>> {
        let state = self.state.lock().await;
        Ok(state
            .prompts
            .values()
            .find(|p| p.agent_name == agent_name && p.stage == Stage::Prd)
            .cloned())
    }

    async fn set_stage(&self, id: Uuid, from: Stage, to: Stage) -> StoreResult<PromptVersion> {
        if from == Stage::Prd || to == Stage::Prd {
            return Err(PipelineError::Validation(
                "PRD is only reachable through make_current".into(),
            ));
        }
        let mut state = self.state.lock().await;
        let prompt = state
            .prompts
            .get_mut(&id)
            .ok_or_else(|| PipelineError::not_found("prompt_version", id))?;
        if prompt.stage != from {
            return Err(PipelineError::invalid_transition("prompt_version", prompt.stage, to));
        }
        prompt.stage = to;
        if to == Stage::Ret {
            prompt.retired_at = Some(Utc::now());
        }
        Ok(prompt.clone())
    }

    async fn make_current(
        &self,
        id: Uuid,
        expected: Option<Stage>,
        at: DateTime<Utc>,
    ) -> StoreResult<PromptVersion> {
        let mut state = self.state.lock().await;
        let target = state
            .prompts
            .get(&id)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("prompt_version", id))?;
        if target.stage == Stage::Prd {
            return Err(PipelineError::invalid_transition("prompt_version", Stage::Prd, Stage::Prd));
        }
        if let Some(expected) = expected {
            if target.stage != expected {
                return Err(PipelineError::invalid_transition(
                    "prompt_version",
                    target.stage,
                    Stage::Prd,
                ));
            }
        }

        for prompt in state.prompts.values_mut() {
            if prompt.agent_name == target.agent_name && prompt.stage == Stage::Prd {
                prompt.stage = Stage::Ret;
                prompt.retired_at = Some(at);
            }
        }
        let prompt = state
            .prompts
            .get_mut(&id)
            .ok_or_else(|| PipelineError::not_found("prompt_version", id))?;
        prompt.stage = Stage::Prd;
        prompt.deployed_at = Some(at);
        prompt.retired_at = None;
        Ok(prompt.clone())
    }

    async fn delete_prompt(&self, id: Uuid) -> StoreResult<PromptVersion> {
        let mut state = self.state.lock().await;
        let stage = state
            .prompts
            .get(&id)
            .map(|p| p.stage)
            .ok_or_else(|| PipelineError::not_found("prompt_version", id))?;
        if stage == Stage::Prd {
            return Err(PipelineError::invalid_transition("prompt_version", Stage::Prd, "deleted"));
        }
        state
            .prompts
            .remove(&id)
            .ok_or_else(|| PipelineError::not_found("prompt_version", id))
    }
}
