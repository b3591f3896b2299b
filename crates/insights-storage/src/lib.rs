//! Persistence ports for the ingestion pipeline plus in-memory and Postgres backends.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use insights_core::{
    NewPromptVersion, NewQueueItem, PayloadPatch, PipelineError, PipelineRun, PromptVersion,
    QueueItem, RunStatus, Stage, StatusCode, StatusRegistry,
};
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "insights-storage";

pub type StoreResult<T> = Result<T, PipelineError>;

/// How an item update touches the failure bookkeeping columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FailureUpdate {
    #[default]
    Keep,
    /// Zero the counter and clear the failed step and last error.
    Reset,
    /// Increment `failure_count` and remember the failing step and its error.
    Record {
        step: String,
        error: String,
        at: DateTime<Utc>,
    },
    /// Overwrite the last error only.
    Note { error: String, at: DateTime<Utc> },
}

impl FailureUpdate {
    pub fn record(step: impl Into<String>, error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::Record {
            step: step.into(),
            error: error.into(),
            at,
        }
    }

    pub fn note(error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::Note {
            error: error.into(),
            at,
        }
    }
}

/// Fields written together with a status change, in one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemUpdate {
    /// `Some(None)` clears the pointer; `None` leaves it untouched.
    pub current_run_id: Option<Option<Uuid>>,
    pub patch: PayloadPatch,
    pub failures: FailureUpdate,
    pub clear_priority: bool,
    /// Only apply when the item still points at this run; otherwise `Conflict`.
    pub expect_run_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueFilter {
    pub status_min: Option<i32>,
    pub status_max: Option<i32>,
    pub discovered_since: Option<DateTime<Utc>>,
    pub source_slug: Option<String>,
}

impl QueueFilter {
    pub fn status_range(min: i32, max: i32) -> Self {
        Self {
            status_min: Some(min),
            status_max: Some(max),
            ..Default::default()
        }
    }

    pub fn matches(&self, item: &QueueItem) -> bool {
        self.status_min.map_or(true, |min| item.status_code >= min)
            && self.status_max.map_or(true, |max| item.status_code <= max)
            && self
                .discovered_since
                .map_or(true, |since| item.discovered_at >= since)
            && self
                .source_slug
                .as_deref()
                .map_or(true, |slug| item.source_slug() == Some(slug))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartedRun {
    pub run: PipelineRun,
    /// Runs that were `running` for the item and got cancelled in the same step.
    pub cancelled: Vec<Uuid>,
}

/// A new run together with the item already pointing at it.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchedRun {
    pub run: PipelineRun,
    pub cancelled: Vec<Uuid>,
    pub item: QueueItem,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunTransition {
    Applied(PipelineRun),
    /// The run had already reached a terminal status; nothing was written.
    AlreadyTerminal(PipelineRun),
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn load_statuses(&self) -> StoreResult<Vec<StatusCode>>;
    /// Insert-or-update by code. Returns the number of rows written.
    async fn upsert_statuses(&self, rows: &[StatusCode]) -> StoreResult<usize>;
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn insert_item(&self, item: NewQueueItem) -> StoreResult<QueueItem>;
    async fn get_item(&self, id: Uuid) -> StoreResult<Option<QueueItem>>;
    async fn update_status(
        &self,
        id: Uuid,
        status_code: i32,
        update: ItemUpdate,
    ) -> StoreResult<QueueItem>;
    /// Items with `min <= status_code <= max`, oldest update first.
    async fn list_by_status_range(
        &self,
        min: i32,
        max: i32,
        limit: Option<i64>,
    ) -> StoreResult<Vec<QueueItem>>;
    /// Items with `status_code`: priority requests first (oldest request first), then the
    /// oldest update.
    async fn list_retry_candidates(
        &self,
        status_code: i32,
        limit: i64,
    ) -> StoreResult<Vec<QueueItem>>;
    /// Items in one of `status_codes`, untouched since `before`, whose current run is still
    /// `running`. Same ordering as `list_retry_candidates`.
    async fn list_stalled(
        &self,
        status_codes: &[i32],
        before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<QueueItem>>;
    async fn count_items(&self, filter: &QueueFilter) -> StoreResult<i64>;
    async fn mark_priority(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<QueueItem>;
    async fn list_discovered_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<QueueItem>>;
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Cancel every `running` run of the item, then insert a new `running` run.
    async fn start_run(
        &self,
        queue_id: Uuid,
        trigger: &str,
        created_by: &str,
    ) -> StoreResult<StartedRun>;
    /// `start_run`, then move the item to `status_code` pointing at the new run, in one
    /// atomic step. `update.current_run_id` and `update.expect_run_id` are ignored.
    async fn dispatch_run(
        &self,
        queue_id: Uuid,
        trigger: &str,
        created_by: &str,
        status_code: i32,
        update: ItemUpdate,
    ) -> StoreResult<DispatchedRun>;
    async fn complete_run(&self, run_id: Uuid, status: RunStatus) -> StoreResult<RunTransition>;
    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<PipelineRun>>;
    /// Newest first.
    async fn runs_for_item(&self, queue_id: Uuid) -> StoreResult<Vec<PipelineRun>>;
}

#[async_trait]
pub trait PromptStore: Send + Sync {
    async fn insert_prompt(&self, prompt: NewPromptVersion) -> StoreResult<PromptVersion>;
    async fn get_prompt(&self, id: Uuid) -> StoreResult<Option<PromptVersion>>;
    /// Ordered by agent, then version descending, then creation time descending.
    async fn list_prompts(&self, agent_name: Option<&str>) -> StoreResult<Vec<PromptVersion>>;
    async fn current_prompt(&self, agent_name: &str) -> StoreResult<Option<PromptVersion>>;
    /// Compare-and-set stage update that never touches `PRD`.
    async fn set_stage(&self, id: Uuid, from: Stage, to: Stage) -> StoreResult<PromptVersion>;
    /// Retire the agent's current `PRD` row and promote `id`, atomically, stamping both
    /// `retired_at` and `deployed_at` with `at`. `expected` guards the target's current stage.
    async fn make_current(
        &self,
        id: Uuid,
        expected: Option<Stage>,
        at: DateTime<Utc>,
    ) -> StoreResult<PromptVersion>;
    /// Refuses to delete the current `PRD` version.
    async fn delete_prompt(&self, id: Uuid) -> StoreResult<PromptVersion>;
}

pub trait PipelineStore: StatusStore + QueueStore + RunStore + PromptStore {}

impl<T> PipelineStore for T where T: StatusStore + QueueStore + RunStore + PromptStore {}

/// Fresh registry snapshot for one operation.
pub async fn load_registry<S>(store: &S) -> StoreResult<StatusRegistry>
where
    S: StatusStore + ?Sized,
{
    let rows = store.load_statuses().await?;
    if rows.is_empty() {
        return Err(PipelineError::Misconfigured(
            "status_lookup is empty; seed the status catalogue first".into(),
        ));
    }
    StatusRegistry::from_rows(rows)
}

/// `memory://` selects the in-process store; anything else is a Postgres URL.
pub async fn open_store(database_url: &str) -> anyhow::Result<Arc<dyn PipelineStore>> {
    if database_url.starts_with("memory://") {
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = PgStore::connect(database_url)
        .await
        .with_context(|| "connecting to pipeline database".to_string())?;
    Ok(Arc::new(store))
}
