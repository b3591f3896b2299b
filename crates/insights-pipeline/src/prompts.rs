//! Staged prompt versions per agent: DEV -> TST -> PRD, with PRD rows retired to RET.

use std::sync::Arc;

use chrono::Utc;
use insights_core::{NewPromptVersion, PipelineError, PromptVersion, Stage};
use insights_storage::PipelineStore;
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct PromptRegistry {
    store: Arc<dyn PipelineStore>,
}

impl PromptRegistry {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self { store }
    }

    pub async fn create(&self, prompt: NewPromptVersion) -> Result<PromptVersion, PipelineError> {
        for (field, value) in [
            ("agent_name", &prompt.agent_name),
            ("version", &prompt.version),
            ("prompt_text", &prompt.prompt_text),
        ] {
            if value.trim().is_empty() {
                return Err(PipelineError::Validation(format!("{field} is required")));
            }
        }
        let created = self.store.insert_prompt(prompt).await?;
        info!(agent = %created.agent_name, version = %created.version, "prompt version created");
        Ok(created)
    }

    pub async fn get(&self, id: Uuid) -> Result<PromptVersion, PipelineError> {
        self.store
            .get_prompt(id)
            .await?
            .ok_or_else(|| PipelineError::not_found("prompt_version", id))
    }

    pub async fn list(&self, agent_name: Option<&str>) -> Result<Vec<PromptVersion>, PipelineError> {
        self.store.list_prompts(agent_name).await
    }

    pub async fn current(&self, agent_name: &str) -> Result<Option<PromptVersion>, PipelineError> {
        self.store.current_prompt(agent_name).await
    }

    /// One stage forward. TST -> PRD retires the agent's current version in the same step.
    pub async fn promote(&self, id: Uuid) -> Result<PromptVersion, PipelineError> {
        let prompt = self.get(id).await?;
        let promoted = match prompt.stage {
            Stage::Dev => self.store.set_stage(id, Stage::Dev, Stage::Tst).await?,
            Stage::Tst => self.store.make_current(id, Some(Stage::Tst), Utc::now()).await?,
            stage @ (Stage::Prd | Stage::Ret) => {
                return Err(PipelineError::invalid_transition(
                    "prompt_version",
                    stage,
                    "promote",
                ));
            }
        };
        info!(
            agent = %promoted.agent_name,
            version = %promoted.version,
            from = %prompt.stage,
            to = %promoted.stage,
            "prompt version promoted"
        );
        Ok(promoted)
    }

    /// Force any non-current version straight to PRD.
    pub async fn rollback(&self, id: Uuid) -> Result<PromptVersion, PipelineError> {
        let prompt = self.get(id).await?;
        if prompt.stage == Stage::Prd {
            return Err(PipelineError::invalid_transition(
                "prompt_version",
                Stage::Prd,
                Stage::Prd,
            ));
        }
        let current = self
            .store
            .make_current(id, Some(prompt.stage), Utc::now())
            .await?;
        info!(
            agent = %current.agent_name,
            version = %current.version,
            from = %prompt.stage,
            "prompt version rolled back to current"
        );
        Ok(current)
    }

    /// The current PRD version cannot be deleted.
    pub async fn delete(&self, id: Uuid) -> Result<PromptVersion, PipelineError> {
        let deleted = self.store.delete_prompt(id).await?;
        info!(agent = %deleted.agent_name, version = %deleted.version, "prompt version deleted");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insights_storage::MemoryStore;

    fn registry() -> PromptRegistry {
        PromptRegistry::new(Arc::new(MemoryStore::new()))
    }

    fn draft(agent: &str, version: &str) -> NewPromptVersion {
        NewPromptVersion {
            agent_name: agent.into(),
            version: version.into(),
            prompt_text: "Summarize the article for a BFSI executive.".into(),
            model_id: Some("gpt-4o".into()),
            notes: None,
        }
    }

    async fn to_prd(registry: &PromptRegistry, agent: &str, version: &str) -> PromptVersion {
        let created = registry.create(draft(agent, version)).await.unwrap();
        registry.promote(created.id).await.unwrap();
        registry.promote(created.id).await.unwrap()
    }

    #[tokio::test]
    async fn promotion_walks_dev_tst_prd() {
        let registry = registry();
        let created = registry.create(draft("summarizer", "1.0.0")).await.unwrap();
        assert_eq!(created.stage, Stage::Dev);

        let tst = registry.promote(created.id).await.unwrap();
        assert_eq!(tst.stage, Stage::Tst);
        assert!(tst.deployed_at.is_none());

        let prd = registry.promote(created.id).await.unwrap();
        assert_eq!(prd.stage, Stage::Prd);
        assert!(prd.deployed_at.is_some());
        assert_eq!(registry.current("summarizer").await.unwrap().unwrap().id, created.id);
    }

    #[tokio::test]
    async fn promoting_to_prd_retires_previous_version() {
        let registry = registry();
        let v1 = to_prd(&registry, "tagger", "1.0.0").await;
        let v2 = to_prd(&registry, "tagger", "1.1.0").await;

        let old = registry.get(v1.id).await.unwrap();
        assert_eq!(old.stage, Stage::Ret);
        assert!(old.retired_at.unwrap() <= v2.deployed_at.unwrap());

        let prd = registry
            .list(Some("tagger"))
            .await
            .unwrap()
            .into_iter()
            .filter(|p| p.stage == Stage::Prd)
            .count();
        assert_eq!(prd, 1);
    }

    #[tokio::test]
    async fn prd_and_ret_cannot_be_promoted() {
        let registry = registry();
        let v1 = to_prd(&registry, "tagger", "1.0.0").await;
        let err = registry.promote(v1.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));

        to_prd(&registry, "tagger", "1.1.0").await;
        let err = registry.promote(v1.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { ref from, .. } if from == "RET"));
    }

    #[tokio::test]
    async fn rollback_restores_a_retired_version() {
        let registry = registry();
        let v1 = to_prd(&registry, "summarizer", "1.0.0").await;
        let v2 = to_prd(&registry, "summarizer", "2.0.0").await;

        let restored = registry.rollback(v1.id).await.unwrap();
        assert_eq!(restored.stage, Stage::Prd);
        assert!(restored.retired_at.is_none());
        assert_eq!(registry.get(v2.id).await.unwrap().stage, Stage::Ret);

        let err = registry.rollback(v1.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn rollback_can_skip_stages() {
        let registry = registry();
        let draft_version = registry.create(draft("thumbnail-generator", "0.1.0")).await.unwrap();
        let current = registry.rollback(draft_version.id).await.unwrap();
        assert_eq!(current.stage, Stage::Prd);
    }

    #[tokio::test]
    async fn delete_refuses_current_version() {
        let registry = registry();
        let live = to_prd(&registry, "tagger", "1.0.0").await;
        let spare = registry.create(draft("tagger", "1.1.0-rc1")).await.unwrap();

        let err = registry.delete(live.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
        registry.delete(spare.id).await.unwrap();
        let missing = registry.delete(spare.id).await.unwrap_err();
        assert!(matches!(missing, PipelineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn create_validates_required_fields() {
        let registry = registry();
        let mut bad = draft("tagger", "1.0.0");
        bad.prompt_text = "  ".into();
        assert!(registry.create(bad).await.unwrap_err().is_validation());

        registry.create(draft("tagger", "1.0.0")).await.unwrap();
        let dup = registry.create(draft("tagger", "1.0.0")).await.unwrap_err();
        assert!(matches!(dup, PipelineError::Conflict(_)));
    }
}
