use chrono::{DateTime, Duration, Utc};
use insights_core::health::{aggregate, SourceHealth};
use insights_core::{names, PipelineError};
use insights_storage::{load_registry, PipelineStore};

/// Health of every source that discovered something in the last 30 days, sorted by slug.
pub async fn source_health(
    store: &dyn PipelineStore,
    now: DateTime<Utc>,
) -> Result<Vec<SourceHealth>, PipelineError> {
    let registry = load_registry(store).await?;
    let failed = registry.code_for(names::FAILED)?;
    let items = store.list_discovered_since(now - Duration::days(30)).await?;
    Ok(aggregate(&items, failed, now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{insert_item, seeded_store};
    use insights_core::health::HealthStatus;

    #[tokio::test]
    async fn fresh_sources_are_reported_from_the_store() {
        let store = seeded_store().await;
        for _ in 0..3 {
            insert_item(&store, "enriched", "bis").await;
        }
        insert_item(&store, "failed", "fca").await;
        insert_item(&store, "published", "fca").await;

        let health = source_health(store.as_ref(), Utc::now()).await.unwrap();
        let slugs = health.iter().map(|h| h.source_slug.as_str()).collect::<Vec<_>>();
        assert_eq!(slugs, vec!["bis", "fca"]);
        assert_eq!(health[0].health_status, HealthStatus::Healthy);
        assert_eq!(health[1].failed_7d, 1);
        assert_eq!(health[1].error_rate, 50);
        assert_eq!(health[1].health_status, HealthStatus::Error);
    }
}
