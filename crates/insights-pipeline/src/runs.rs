use std::sync::Arc;

use insights_core::{PipelineError, PipelineRun, RunStatus};
use insights_storage::{DispatchedRun, ItemUpdate, PipelineStore, RunTransition, StartedRun};
use tracing::{info, warn};
use uuid::Uuid;

/// Bookkeeping for enrichment attempts. At most one run per item is `running`.
#[derive(Clone)]
pub struct RunTracker {
    store: Arc<dyn PipelineStore>,
}

impl RunTracker {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self { store }
    }

    pub async fn start(
        &self,
        queue_id: Uuid,
        trigger: &str,
        created_by: &str,
    ) -> Result<StartedRun, PipelineError> {
        let started = self.store.start_run(queue_id, trigger, created_by).await?;
        for cancelled in &started.cancelled {
            info!(%queue_id, run_id = %cancelled, "cancelled superseded pipeline run");
        }
        info!(%queue_id, run_id = %started.run.id, trigger, created_by, "pipeline run started");
        Ok(started)
    }

    /// Start a run and move the item onto it in one store operation, so the item never points
    /// at a run a concurrent dispatch already cancelled.
    pub async fn dispatch(
        &self,
        queue_id: Uuid,
        trigger: &str,
        created_by: &str,
        status_code: i32,
        update: ItemUpdate,
    ) -> Result<DispatchedRun, PipelineError> {
        let dispatched = self
            .store
            .dispatch_run(queue_id, trigger, created_by, status_code, update)
            .await?;
        for cancelled in &dispatched.cancelled {
            info!(%queue_id, run_id = %cancelled, "cancelled superseded pipeline run");
        }
        info!(%queue_id, run_id = %dispatched.run.id, trigger, created_by, "pipeline run started");
        Ok(dispatched)
    }

    /// Completing a run that is already terminal is logged and ignored; a cancellation can
    /// race with the agent reporting back.
    pub async fn complete(
        &self,
        run_id: Uuid,
        status: RunStatus,
    ) -> Result<PipelineRun, PipelineError> {
        match self.store.complete_run(run_id, status).await? {
            RunTransition::Applied(run) => {
                info!(%run_id, status = %run.status, "pipeline run finished");
                Ok(run)
            }
            RunTransition::AlreadyTerminal(run) => {
                warn!(
                    %run_id,
                    requested = %status,
                    current = %run.status,
                    "pipeline run already terminal; keeping first status"
                );
                Ok(run)
            }
        }
    }

    pub async fn get(&self, run_id: Uuid) -> Result<PipelineRun, PipelineError> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("pipeline_run", run_id))
    }

    pub async fn runs_for(&self, queue_id: Uuid) -> Result<Vec<PipelineRun>, PipelineError> {
        self.store.runs_for_item(queue_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{insert_item, seeded_store};

    #[tokio::test]
    async fn double_completion_keeps_first_status() {
        let store = seeded_store().await;
        let item = insert_item(&store, "enriched", "bis").await;
        let tracker = RunTracker::new(store.clone());

        let run = tracker.start(item.id, "manual", "editor@example.com").await.unwrap().run;
        let first = tracker.complete(run.id, RunStatus::Cancelled).await.unwrap();
        let second = tracker.complete(run.id, RunStatus::Completed).await.unwrap();
        assert_eq!(first.status, RunStatus::Cancelled);
        assert_eq!(second.status, RunStatus::Cancelled);
        assert_eq!(tracker.get(run.id).await.unwrap().status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn unknown_runs_are_not_found() {
        let store = seeded_store().await;
        let tracker = RunTracker::new(store);
        let err = tracker.complete(Uuid::new_v4(), RunStatus::Failed).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { entity: "pipeline_run", .. }));
    }

    #[tokio::test]
    async fn restarting_cancels_the_previous_run() {
        let store = seeded_store().await;
        let item = insert_item(&store, "enriched", "bis").await;
        let tracker = RunTracker::new(store.clone());

        let first = tracker.start(item.id, "re-tag", "system").await.unwrap();
        let second = tracker.start(item.id, "re-summarize", "system").await.unwrap();
        assert_eq!(second.cancelled, vec![first.run.id]);

        let runs = tracker.runs_for(item.id).await.unwrap();
        let running = runs.iter().filter(|r| r.status == RunStatus::Running).collect::<Vec<_>>();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, second.run.id);
        assert!(runs.iter().any(|r| r.id == first.run.id && r.completed_at.is_some()));
    }

    #[tokio::test]
    async fn dispatch_points_the_item_at_its_new_run() {
        let store = seeded_store().await;
        let item = insert_item(&store, "enriched", "bis").await;
        let tracker = RunTracker::new(store.clone());
        let registry = insights_storage::load_registry(store.as_ref()).await.unwrap();
        let to_tag = registry.code_for("to_tag").unwrap();

        let first = tracker
            .dispatch(item.id, "re-tag", "system", to_tag, ItemUpdate::default())
            .await
            .unwrap();
        let second = tracker
            .dispatch(item.id, "re-tag", "system", to_tag, ItemUpdate::default())
            .await
            .unwrap();
        assert_eq!(second.cancelled, vec![first.run.id]);
        assert_eq!(second.item.current_run_id, Some(second.run.id));
        assert_eq!(second.item.status_code, to_tag);
    }
}
