use async_trait::async_trait;
use chrono::{DateTime, Utc};
use insights_core::{
    NewPromptVersion, NewQueueItem, PipelineError, PipelineRun, PromptVersion, QueueItem,
    RunStatus, Stage, StatusCode,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Decode, PgConnection, PgPool, Postgres, QueryBuilder, Row, Type};
use tracing::debug;
use uuid::Uuid;

use crate::{
    DispatchedRun, FailureUpdate, ItemUpdate, PromptStore, QueueFilter, QueueStore, RunStore,
    RunTransition, StartedRun, StatusStore, StoreResult,
};

const ITEM_COLUMNS: &str = "id, url, status_code, payload, current_run_id, failure_count, \
     last_failed_step, last_error_message, last_error_at, priority_requested_at, discovered_at, \
     updated_at";
const RUN_COLUMNS: &str = "id, queue_id, trigger, status, created_by, created_at, completed_at";
const PROMPT_COLUMNS: &str = "id, agent_name, version, prompt_text, model_id, stage, notes, \
     created_at, deployed_at, retired_at";
/// Priority requests first, then the oldest update.
const RETRY_ORDER: &str = "ORDER BY priority_requested_at IS NULL, priority_requested_at, updated_at, id";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// Unique violations become `Conflict`, foreign-key violations `Validation`.
fn db_error(err: sqlx::Error) -> PipelineError {
    if let sqlx::Error::Database(db) = &err {
        match db.code().as_deref() {
            Some("23505") => return PipelineError::Conflict(db.message().to_string()),
            Some("23503") => return PipelineError::Validation(db.message().to_string()),
            _ => {}
        }
    }
    PipelineError::Storage(err.into())
}

fn col<'r, T>(row: &'r PgRow, name: &str) -> StoreResult<T>
where
    T: Decode<'r, Postgres> + Type<Postgres>,
{
    row.try_get(name).map_err(db_error)
}

fn item_from_row(row: &PgRow) -> StoreResult<QueueItem> {
    Ok(QueueItem {
        id: col(row, "id")?,
        url: col(row, "url")?,
        status_code: col(row, "status_code")?,
        payload: col(row, "payload")?,
        current_run_id: col(row, "current_run_id")?,
        failure_count: col(row, "failure_count")?,
        last_failed_step: col(row, "last_failed_step")?,
        last_error_message: col(row, "last_error_message")?,
        last_error_at: col(row, "last_error_at")?,
        priority_requested_at: col(row, "priority_requested_at")?,
        discovered_at: col(row, "discovered_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

fn run_from_row(row: &PgRow) -> StoreResult<PipelineRun> {
    let status: String = col(row, "status")?;
    Ok(PipelineRun {
        id: col(row, "id")?,
        queue_id: col(row, "queue_id")?,
        trigger: col(row, "trigger")?,
        status: status.parse()?,
        created_by: col(row, "created_by")?,
        created_at: col(row, "created_at")?,
        completed_at: col(row, "completed_at")?,
    })
}

fn prompt_from_row(row: &PgRow) -> StoreResult<PromptVersion> {
    let stage: String = col(row, "stage")?;
    Ok(PromptVersion {
        id: col(row, "id")?,
        agent_name: col(row, "agent_name")?,
        version: col(row, "version")?,
        prompt_text: col(row, "prompt_text")?,
        model_id: col(row, "model_id")?,
        stage: stage.parse()?,
        notes: col(row, "notes")?,
        created_at: col(row, "created_at")?,
        deployed_at: col(row, "deployed_at")?,
        retired_at: col(row, "retired_at")?,
    })
}

/// One UPDATE for status, run pointer, payload patch and failure bookkeeping. `None` when no
/// row matched the id and the `expect_run_id` guard.
async fn update_item(
    conn: &mut PgConnection,
    id: Uuid,
    status_code: i32,
    update: &ItemUpdate,
) -> StoreResult<Option<QueueItem>> {
    let (failure_mode, failed_step, error, error_at) = match &update.failures {
        FailureUpdate::Keep => ("keep", None, None, None),
        FailureUpdate::Reset => ("reset", None, None, None),
        FailureUpdate::Record { step, error, at } => {
            ("record", Some(step.as_str()), Some(error.as_str()), Some(*at))
        }
        FailureUpdate::Note { error, at } => ("note", None, Some(error.as_str()), Some(*at)),
    };
    let sql = format!(
        r#"
        UPDATE ingestion_queue
           SET status_code = $2,
               current_run_id = CASE WHEN $3 THEN $4::uuid ELSE current_run_id END,
               payload = (COALESCE(payload, '{{}}'::jsonb) - $5::text[]) || $6::jsonb,
               failure_count = CASE $7::text
                   WHEN 'reset' THEN 0
                   WHEN 'record' THEN failure_count + 1
                   ELSE failure_count END,
               last_failed_step = CASE $7::text
                   WHEN 'reset' THEN NULL
                   WHEN 'record' THEN $8::text
                   ELSE last_failed_step END,
               last_error_message = CASE $7::text
                   WHEN 'reset' THEN NULL
                   WHEN 'record' THEN $11::text
                   WHEN 'note' THEN $11::text
                   ELSE last_error_message END,
               last_error_at = CASE $7::text
                   WHEN 'reset' THEN NULL
                   WHEN 'record' THEN $12::timestamptz
                   WHEN 'note' THEN $12::timestamptz
                   ELSE last_error_at END,
               priority_requested_at = CASE WHEN $9 THEN NULL ELSE priority_requested_at END,
               updated_at = NOW()
         WHERE id = $1
           AND ($10::uuid IS NULL OR current_run_id = $10::uuid)
     RETURNING {ITEM_COLUMNS}
        "#
    );
    let row = sqlx::query(&sql)
        .bind(id)
        .bind(status_code)
        .bind(update.current_run_id.is_some())
        .bind(update.current_run_id.flatten())
        .bind(&update.patch.remove)
        .bind(update.patch.set_object())
        .bind(failure_mode)
        .bind(failed_step)
        .bind(update.clear_priority)
        .bind(update.expect_run_id)
        .bind(error)
        .bind(error_at)
        .fetch_optional(conn)
        .await
        .map_err(db_error)?;
    row.as_ref().map(item_from_row).transpose()
}

/// Cancel the item's running runs and insert a new one. The caller owns the transaction.
async fn start_run_in(
    conn: &mut PgConnection,
    queue_id: Uuid,
    trigger: &str,
    created_by: &str,
) -> StoreResult<StartedRun> {
    // Row lock serialises concurrent starts for the same item.
    let locked = sqlx::query("SELECT id FROM ingestion_queue WHERE id = $1 FOR UPDATE")
        .bind(queue_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error)?;
    if locked.is_none() {
        return Err(PipelineError::not_found("queue_item", queue_id));
    }

    let cancelled_rows = sqlx::query(
        r#"
        UPDATE pipeline_run
           SET status = 'cancelled',
               completed_at = NOW()
         WHERE queue_id = $1
           AND status = 'running'
     RETURNING id
        "#,
    )
    .bind(queue_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error)?;
    let cancelled = cancelled_rows
        .iter()
        .map(|row| col::<Uuid>(row, "id"))
        .collect::<StoreResult<Vec<_>>>()?;

    let sql = format!(
        "INSERT INTO pipeline_run (id, queue_id, trigger, status, created_by) \
         VALUES ($1, $2, $3, 'running', $4) RETURNING {RUN_COLUMNS}"
    );
    let row = sqlx::query(&sql)
        .bind(Uuid::new_v4())
        .bind(queue_id)
        .bind(trigger)
        .bind(created_by)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error)?;
    let run = run_from_row(&row)?;
    Ok(StartedRun { run, cancelled })
}

#[async_trait]
impl StatusStore for PgStore {
    async fn load_statuses(&self) -> StoreResult<Vec<StatusCode>> {
        let rows = sqlx::query("SELECT code, name, sort_order FROM status_lookup ORDER BY sort_order, code")
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(|row| {
                Ok(StatusCode {
                    code: col(row, "code")?,
                    name: col(row, "name")?,
                    sort_order: col(row, "sort_order")?,
                })
            })
            .collect()
    }

    async fn upsert_statuses(&self, rows: &[StatusCode]) -> StoreResult<usize> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO status_lookup (code, name, sort_order)
                VALUES ($1, $2, $3)
                ON CONFLICT (code) DO UPDATE
                   SET name = EXCLUDED.name,
                       sort_order = EXCLUDED.sort_order
                "#,
            )
            .bind(row.code)
            .bind(&row.name)
            .bind(row.sort_order)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }
        tx.commit().await.map_err(db_error)?;
        Ok(rows.len())
    }
}

#[async_trait]
impl QueueStore for PgStore {
    async fn insert_item(&self, item: NewQueueItem) -> StoreResult<QueueItem> {
        let payload = if item.payload.is_object() {
            item.payload
        } else {
            JsonValue::Object(Default::default())
        };
        let sql = format!(
            "INSERT INTO ingestion_queue (id, url, status_code, payload) \
             VALUES ($1, $2, $3, $4) RETURNING {ITEM_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&item.url)
            .bind(item.status_code)
            .bind(payload)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;
        item_from_row(&row)
    }

    async fn get_item(&self, id: Uuid) -> StoreResult<Option<QueueItem>> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM ingestion_queue WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn update_status(
        &self,
        id: Uuid,
        status_code: i32,
        update: ItemUpdate,
    ) -> StoreResult<QueueItem> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        let updated = update_item(&mut conn, id, status_code, &update).await?;
        drop(conn);

        match updated {
            Some(item) => Ok(item),
            None => match (self.get_item(id).await?, update.expect_run_id) {
                (Some(_), Some(expected)) => Err(PipelineError::Conflict(format!(
                    "queue item {id} no longer points at run {expected}"
                ))),
                _ => Err(PipelineError::not_found("queue_item", id)),
            },
        }
    }

    async fn list_by_status_range(
        &self,
        min: i32,
        max: i32,
        limit: Option<i64>,
    ) -> StoreResult<Vec<QueueItem>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM ingestion_queue \
             WHERE status_code BETWEEN $1 AND $2 \
             ORDER BY updated_at, id LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(min)
            .bind(max)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.iter().map(item_from_row).collect()
    }

    async fn list_retry_candidates(
        &self,
        status_code: i32,
        limit: i64,
    ) -> StoreResult<Vec<QueueItem>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM ingestion_queue WHERE status_code = $1 {RETRY_ORDER} LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(status_code)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.iter().map(item_from_row).collect()
    }

    async fn list_stalled(
        &self,
        status_codes: &[i32],
        before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<QueueItem>> {
        let sql = format!(
            r#"
            SELECT {ITEM_COLUMNS} FROM ingestion_queue
             WHERE status_code = ANY($1)
               AND updated_at < $2
               AND EXISTS (
                   SELECT 1 FROM pipeline_run
                    WHERE pipeline_run.id = ingestion_queue.current_run_id
                      AND pipeline_run.status = 'running')
             {RETRY_ORDER}
             LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(status_codes.to_vec())
            .bind(before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.iter().map(item_from_row).collect()
    }

    async fn count_items(&self, filter: &QueueFilter) -> StoreResult<i64> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) AS n FROM ingestion_queue WHERE TRUE");
        if let Some(min) = filter.status_min {
            qb.push(" AND status_code >= ").push_bind(min);
        }
        if let Some(max) = filter.status_max {
            qb.push(" AND status_code <= ").push_bind(max);
        }
        if let Some(since) = filter.discovered_since {
            qb.push(" AND discovered_at >= ").push_bind(since);
        }
        if let Some(slug) = &filter.source_slug {
            qb.push(" AND payload->>'source_slug' = ").push_bind(slug.clone());
        }
        let row = qb.build().fetch_one(&self.pool).await.map_err(db_error)?;
        col(&row, "n")
    }

    async fn mark_priority(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<QueueItem> {
        let sql = format!(
            "UPDATE ingestion_queue SET priority_requested_at = $2 WHERE id = $1 RETURNING {ITEM_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(at)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or_else(|| PipelineError::not_found("queue_item", id))?;
        item_from_row(&row)
    }

    async fn list_discovered_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<QueueItem>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM ingestion_queue WHERE discovered_at >= $1 ORDER BY discovered_at"
        );
        let rows = sqlx::query(&sql)
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.iter().map(item_from_row).collect()
    }
}

#[async_trait]
impl RunStore for PgStore {
    async fn start_run(
        &self,
        queue_id: Uuid,
        trigger: &str,
        created_by: &str,
    ) -> StoreResult<StartedRun> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let started = start_run_in(&mut tx, queue_id, trigger, created_by).await?;
        tx.commit().await.map_err(db_error)?;
        debug!(
            %queue_id,
            run_id = %started.run.id,
            cancelled = started.cancelled.len(),
            "pipeline run started"
        );
        Ok(started)
    }

    async fn dispatch_run(
        &self,
        queue_id: Uuid,
        trigger: &str,
        created_by: &str,
        status_code: i32,
        update: ItemUpdate,
    ) -> StoreResult<DispatchedRun> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let StartedRun { run, cancelled } =
            start_run_in(&mut tx, queue_id, trigger, created_by).await?;
        let update = ItemUpdate {
            current_run_id: Some(Some(run.id)),
            expect_run_id: None,
            ..update
        };
        let item = update_item(&mut tx, queue_id, status_code, &update)
            .await?
            .ok_or_else(|| PipelineError::not_found("queue_item", queue_id))?;
        tx.commit().await.map_err(db_error)?;
        debug!(%queue_id, run_id = %run.id, cancelled = cancelled.len(), "pipeline run dispatched");
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
        let sql = format!(
            "UPDATE pipeline_run SET status = $2, completed_at = NOW() \
             WHERE id = $1 AND status = 'running' RETURNING {RUN_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(run_id)
            .bind(status.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        if let Some(row) = row {
            return Ok(RunTransition::Applied(run_from_row(&row)?));
        }
        match self.get_run(run_id).await? {
            Some(run) => Ok(RunTransition::AlreadyTerminal(run)),
            None => Err(PipelineError::not_found("pipeline_run", run_id)),
        }
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<PipelineRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM pipeline_run WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn runs_for_item(&self, queue_id: Uuid) -> StoreResult<Vec<PipelineRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM pipeline_run WHERE queue_id = $1 ORDER BY created_at DESC, id DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(queue_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.iter().map(run_from_row).collect()
    }
}

#[async_trait]
impl PromptStore for PgStore {
    async fn insert_prompt(&self, prompt: NewPromptVersion) -> StoreResult<PromptVersion> {
        let sql = format!(
            "INSERT INTO prompt_version (id, agent_name, version, prompt_text, model_id, stage, notes) \
             VALUES ($1, $2, $3, $4, $5, 'DEV', $6) RETURNING {PROMPT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&prompt.agent_name)
            .bind(&prompt.version)
            .bind(&prompt.prompt_text)
            .bind(&prompt.model_id)
            .bind(&prompt.notes)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;
        prompt_from_row(&row)
    }

    async fn get_prompt(&self, id: Uuid) -> StoreResult<Option<PromptVersion>> {
        let sql = format!("SELECT {PROMPT_COLUMNS} FROM prompt_version WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        row.as_ref().map(prompt_from_row).transpose()
    }

    async fn list_prompts(&self, agent_name: Option<&str>) -> StoreResult<Vec<PromptVersion>> {
        let sql = format!(
            r#"SELECT {PROMPT_COLUMNS} FROM prompt_version
                WHERE ($1::text IS NULL OR agent_name = $1::text)
             ORDER BY agent_name COLLATE "C", version COLLATE "C" DESC, created_at DESC"#
        );
        let rows = sqlx::query(&sql)
            .bind(agent_name)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.iter().map(prompt_from_row).collect()
    }

    async fn current_prompt(&self, agent_name: &str) -> StoreResult<Option<PromptVersion>> {
        let sql = format!(
            "SELECT {PROMPT_COLUMNS} FROM prompt_version WHERE agent_name = $1 AND stage = 'PRD'"
        );
        let row = sqlx::query(&sql)
            .bind(agent_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        row.as_ref().map(prompt_from_row).transpose()
    }

    async fn set_stage(&self, id: Uuid, from: Stage, to: Stage) -> StoreResult<PromptVersion> {
        if from == Stage::Prd || to == Stage::Prd {
            return Err(PipelineError::Validation(
                "PRD is only reachable through make_current".into(),
            ));
        }
        let sql = format!(
            r#"
            UPDATE prompt_version
               SET stage = $3,
                   retired_at = CASE WHEN $3 = 'RET' THEN NOW() ELSE retired_at END
             WHERE id = $1
               AND stage = $2
         RETURNING {PROMPT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(from.as_str())
            .bind(to.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        if let Some(row) = row {
            return prompt_from_row(&row);
        }
        match self.get_prompt(id).await? {
            Some(current) => Err(PipelineError::invalid_transition(
                "prompt_version",
                current.stage,
                to,
            )),
            None => Err(PipelineError::not_found("prompt_version", id)),
        }
    }

    async fn make_current(
        &self,
        id: Uuid,
        expected: Option<Stage>,
        at: DateTime<Utc>,
    ) -> StoreResult<PromptVersion> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        // Agent-wide row locks, in id order, before the target is read.
        sqlx::query(
            r#"
            SELECT id FROM prompt_version
             WHERE agent_name = (SELECT agent_name FROM prompt_version WHERE id = $1)
             ORDER BY id
               FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error)?;

        let sql = format!("SELECT {PROMPT_COLUMNS} FROM prompt_version WHERE id = $1");
        let target = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error)?
            .as_ref()
            .map(prompt_from_row)
            .transpose()?
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

        sqlx::query(
            r#"
            UPDATE prompt_version
               SET stage = 'RET',
                   retired_at = $2
             WHERE agent_name = $1
               AND stage = 'PRD'
            "#,
        )
        .bind(&target.agent_name)
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        let sql = format!(
            "UPDATE prompt_version SET stage = 'PRD', deployed_at = $2, retired_at = NULL \
             WHERE id = $1 RETURNING {PROMPT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(at)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error)?;
        let promoted = prompt_from_row(&row)?;

        tx.commit().await.map_err(db_error)?;
        Ok(promoted)
    }

    async fn delete_prompt(&self, id: Uuid) -> StoreResult<PromptVersion> {
        let sql = format!(
            "DELETE FROM prompt_version WHERE id = $1 AND stage <> 'PRD' RETURNING {PROMPT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        if let Some(row) = row {
            return prompt_from_row(&row);
        }
        match self.get_prompt(id).await? {
            Some(_) => Err(PipelineError::invalid_transition("prompt_version", Stage::Prd, "deleted")),
            None => Err(PipelineError::not_found("prompt_version", id)),
        }
    }
}
