//! JSON API over the enrichment pipeline for the review dashboard and agent callbacks.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use insights_agent::{AgentService, HttpAgentClient};
use insights_core::{NewPromptVersion, PipelineError};
use insights_pipeline::{
    maybe_build_scheduler, source_health, Catalogue, Orchestrator, PipelineConfig,
    PromptRegistry, RetryPolicies, RetryScheduler, StepResult,
};
use insights_storage::{load_registry, open_store, PipelineStore};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "insights-web";

/// Actor recorded on runs started from the dashboard when the request names nobody.
const DASHBOARD_ACTOR: &str = "admin";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PipelineStore>,
    pub orchestrator: Orchestrator,
    pub prompts: PromptRegistry,
}

impl AppState {
    pub fn new(store: Arc<dyn PipelineStore>, agent: Arc<dyn AgentService>) -> Self {
        Self {
            orchestrator: Orchestrator::new(store.clone(), agent),
            prompts: PromptRegistry::new(store.clone()),
            store,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ItemsQuery {
    min: Option<i32>,
    max: Option<i32>,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PromptsQuery {
    agent: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EnrichStepRequest {
    step: Option<String>,
    id: Option<String>,
    created_by: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ActorRequest {
    created_by: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/statuses", get(statuses_handler))
        .route("/api/items", get(items_handler))
        .route("/api/items/{id}", get(item_detail_handler))
        .route("/api/enrich-step", post(enrich_step_handler))
        .route("/api/items/{id}/reenrich", post(reenrich_handler))
        .route("/api/items/{id}/priority", post(priority_handler))
        .route("/api/items/{id}/runs/{run_id}/complete", post(complete_run_handler))
        .route("/api/source-health", get(source_health_handler))
        .route("/api/prompts", get(prompts_handler).post(create_prompt_handler))
        .route("/api/prompts/{id}/promote", post(promote_prompt_handler))
        .route("/api/prompts/{id}/rollback", post(rollback_prompt_handler))
        .route("/api/prompts/{id}", axum::routing::delete(delete_prompt_handler))
        .with_state(Arc::new(state))
}

/// Serves the API and, when enabled, the retry scheduler alongside it.
pub async fn serve(config: PipelineConfig) -> anyhow::Result<()> {
    let store = open_store(&config.database_url).await?;
    let agent: Arc<dyn AgentService> = Arc::new(HttpAgentClient::new(config.agent_client_config())?);
    if let Err(err) = agent.check_ready() {
        warn!(error = %err, "agent client not ready; enrichment requests will be rejected");
    }
    let state = AppState::new(store, agent);

    let policies = match Catalogue::load(&config.catalogue_path).await {
        Ok(catalogue) => catalogue.retry_policies(),
        Err(err) => {
            warn!(error = %err, "using default retry policies");
            RetryPolicies::default()
        }
    };
    let retry = Arc::new(RetryScheduler::new(
        state.orchestrator.clone(),
        policies,
        config.retry_batch_limit,
        config.stall_after(),
    ));
    let scheduler = maybe_build_scheduler(config.scheduler_enabled, &config.retry_cron, retry).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await.context("starting retry scheduler")?;
        info!(cron = %config.retry_cron, "retry scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "serving pipeline API");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(PipelineConfig::from_env()).await
}

fn error_response(err: PipelineError) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!(error = %err, "request failed");
    }
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

fn parse_id(raw: &str) -> Result<Uuid, PipelineError> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| PipelineError::Validation(format!("invalid id: {raw}")))
}

/// Empty bodies decode as the type's default so optional payloads can be omitted.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, PipelineError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|err| PipelineError::Validation(format!("invalid request body: {err}")))
}

async fn statuses_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_registry(state.store.as_ref()).await {
        Ok(registry) => Json(registry.rows()).into_response(),
        Err(err) => error_response(err),
    }
}

async fn items_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ItemsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let result = async {
        // open bounds fall back to the catalogue's lowest and highest codes
        let (min, max) = match (query.min, query.max) {
            (Some(min), Some(max)) => (min, max),
            (min, max) => {
                let registry = load_registry(state.store.as_ref()).await?;
                let (lowest, highest) = registry.code_bounds().ok_or_else(|| {
                    PipelineError::Misconfigured("status catalogue is empty".into())
                })?;
                (min.unwrap_or(lowest), max.unwrap_or(highest))
            }
        };
        state.store.list_by_status_range(min, max, Some(limit)).await
    }
    .await;
    match result {
        Ok(items) => Json(items).into_response(),
        Err(err) => error_response(err),
    }
}

async fn item_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let result = async {
        let id = parse_id(&id)?;
        let item = state
            .store
            .get_item(id)
            .await?
            .ok_or_else(|| PipelineError::not_found("queue_item", id))?;
        let runs = state.orchestrator.runs().runs_for(id).await?;
        Ok::<_, PipelineError>(json!({ "item": item, "runs": runs }))
    }
    .await;
    match result {
        Ok(body) => Json(body).into_response(),
        Err(err) => error_response(err),
    }
}

/// Propagates the agent's own status code and body.
async fn enrich_step_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let result = async {
        let req: EnrichStepRequest = parse_body(&body)?;
        let (Some(step), Some(id)) = (req.step, req.id) else {
            return Err(PipelineError::Validation("step and id are required".into()));
        };
        let id = parse_id(&id)?;
        let created_by = req.created_by.unwrap_or_else(|| DASHBOARD_ACTOR.to_string());
        state.orchestrator.run_step(&step, id, &created_by).await
    }
    .await;
    match result {
        Ok(dispatch) => {
            let status =
                StatusCode::from_u16(dispatch.response.status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, Json(dispatch.response.body)).into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn reenrich_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    body: Bytes,
) -> Response {
    let result = async {
        let id = parse_id(&id)?;
        let req: ActorRequest = parse_body(&body)?;
        let created_by = req.created_by.unwrap_or_else(|| DASHBOARD_ACTOR.to_string());
        state.orchestrator.reenrich(id, &created_by).await
    }
    .await;
    match result {
        Ok(dispatch) => Json(dispatch).into_response(),
        Err(err) => error_response(err),
    }
}

async fn priority_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let result = async {
        let id = parse_id(&id)?;
        state.orchestrator.prioritize(id).await
    }
    .await;
    match result {
        Ok(dispatch) => Json(dispatch).into_response(),
        Err(err) => error_response(err),
    }
}

async fn complete_run_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((id, run_id)): AxumPath<(String, String)>,
    body: Bytes,
) -> Response {
    let result = async {
        let id = parse_id(&id)?;
        let run_id = parse_id(&run_id)?;
        let outcome: StepResult = parse_body(&body)?;
        state.orchestrator.finish_step(id, run_id, outcome).await
    }
    .await;
    match result {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => error_response(err),
    }
}

async fn source_health_handler(State(state): State<Arc<AppState>>) -> Response {
    match source_health(state.store.as_ref(), Utc::now()).await {
        Ok(health) => Json(json!({ "health": health })).into_response(),
        Err(err) => error_response(err),
    }
}

async fn prompts_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PromptsQuery>,
) -> Response {
    let agent = query.agent.as_deref().filter(|a| !a.is_empty());
    match state.prompts.list(agent).await {
        Ok(prompts) => Json(prompts).into_response(),
        Err(err) => error_response(err),
    }
}

async fn create_prompt_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let result = async {
        let prompt: NewPromptVersion = serde_json::from_slice(&body)
            .map_err(|err| PipelineError::Validation(format!("invalid request body: {err}")))?;
        state.prompts.create(prompt).await
    }
    .await;
    match result {
        Ok(prompt) => (StatusCode::CREATED, Json(prompt)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn promote_prompt_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let result = async { state.prompts.promote(parse_id(&id)?).await }.await;
    match result {
        Ok(prompt) => Json(prompt).into_response(),
        Err(err) => error_response(err),
    }
}

async fn rollback_prompt_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let result = async { state.prompts.rollback(parse_id(&id)?).await }.await;
    match result {
        Ok(prompt) => Json(prompt).into_response(),
        Err(err) => error_response(err),
    }
}

async fn delete_prompt_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let result = async { state.prompts.delete(parse_id(&id)?).await }.await;
    match result {
        Ok(prompt) => Json(json!({ "deleted": prompt })).into_response(),
        Err(err) => error_response(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use insights_agent::RecordingAgent;
    use insights_core::{NewQueueItem, QueueItem, RunStatus};
    use insights_storage::MemoryStore;
    use serde_json::Value;
    use tower::ServiceExt;

    fn store() -> Arc<dyn PipelineStore> {
        let catalogue =
            Catalogue::from_yaml_str(include_str!("../../../config/pipeline.yaml")).unwrap();
        Arc::new(MemoryStore::with_statuses(catalogue.statuses))
    }

    async fn insert(store: &Arc<dyn PipelineStore>, status: &str, slug: &str) -> QueueItem {
        let registry = load_registry(store.as_ref()).await.unwrap();
        store
            .insert_item(NewQueueItem {
                url: format!("https://{slug}.example.org/{}", Uuid::new_v4()),
                status_code: registry.code_for(status).unwrap(),
                payload: json!({"title": "Basel III endgame", "source_slug": slug}),
            })
            .await
            .unwrap()
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn statuses_and_items_are_listed() {
        let store = store();
        let item = insert(&store, "enriched", "bis").await;
        let app = app(AppState::new(store, Arc::new(RecordingAgent::new())));

        let (status, body) = send(&app, "GET", "/api/statuses", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().iter().any(|s| s["name"] == "dead_letter"));

        let (status, body) = send(&app, "GET", "/api/items?min=200&max=299", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["id"], item.id.to_string());

        let (status, body) = send(&app, "GET", "/api/items?min=500&max=599", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_item_bounds_cover_the_whole_catalogue() {
        let store = store();
        let discovered = insert(&store, "discovered", "bis").await;
        let unpublished = insert(&store, "unpublished", "ecb").await;
        let app = app(AppState::new(store, Arc::new(RecordingAgent::new())));

        let (status, body) = send(&app, "GET", "/api/items", None).await;
        assert_eq!(status, StatusCode::OK);
        let ids = body
            .as_array()
            .unwrap()
            .iter()
            .map(|item| item["id"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert!(ids.contains(&discovered.id.to_string()));
        assert!(ids.contains(&unpublished.id.to_string()));

        let (_, body) = send(&app, "GET", "/api/items?min=500", None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["id"], unpublished.id.to_string());
    }

    #[tokio::test]
    async fn enrich_step_validates_input() {
        let app = app(AppState::new(store(), Arc::new(RecordingAgent::new())));

        let (status, body) = send(&app, "POST", "/api/enrich-step", Some(json!({"step": "tag"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("required"));

        let (status, _) = send(
            &app,
            "POST",
            "/api/enrich-step",
            Some(json!({"step": "translate", "id": Uuid::new_v4()})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            "POST",
            "/api/enrich-step",
            Some(json!({"step": "tag", "id": Uuid::new_v4()})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn enrich_step_relays_agent_response_and_records_run() {
        let store = store();
        let item = insert(&store, "enriched", "mckinsey").await;
        let agent = Arc::new(RecordingAgent::responding(202, json!({"queued": true})));
        let app = app(AppState::new(store.clone(), agent.clone()));

        let (status, body) = send(
            &app,
            "POST",
            "/api/enrich-step",
            Some(json!({"step": "summarize", "id": item.id, "created_by": "editor@example.com"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, json!({"queued": true}));
        assert_eq!(agent.calls().len(), 1);

        let (status, detail) = send(&app, "GET", &format!("/api/items/{}", item.id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["item"]["status_code"], 210);
        let runs = detail["runs"].as_array().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0]["trigger"], "re-summarize");
        assert_eq!(runs[0]["created_by"], "editor@example.com");
    }

    #[tokio::test]
    async fn unconfigured_agent_is_a_server_error_without_side_effects() {
        let store = store();
        let item = insert(&store, "enriched", "bis").await;
        let app = app(AppState::new(
            store.clone(),
            Arc::new(RecordingAgent::misconfigured("AGENT_API_KEY is not set")),
        ));

        let (status, body) = send(
            &app,
            "POST",
            "/api/enrich-step",
            Some(json!({"step": "tag", "id": item.id})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("AGENT_API_KEY"));
        assert!(store.runs_for_item(item.id).await.unwrap().is_empty());
        assert_eq!(store.get_item(item.id).await.unwrap().unwrap().status_code, item.status_code);
    }

    #[tokio::test]
    async fn agent_callback_completes_the_run() {
        let store = store();
        let item = insert(&store, "enriched", "bis").await;
        let state = AppState::new(store.clone(), Arc::new(RecordingAgent::new()));
        let superseded = state.orchestrator.run_step("tag", item.id, "admin").await.unwrap();
        let current = state.orchestrator.run_step("summarize", item.id, "admin").await.unwrap();
        let app = app(state);

        let stale = format!("/api/items/{}/runs/{}/complete", item.id, superseded.run.id);
        let (status, body) = send(&app, "POST", &stale, Some(json!({"success": true}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "stale");
        assert_eq!(body["run"]["status"], "cancelled");

        let uri = format!("/api/items/{}/runs/{}/complete", item.id, current.run.id);
        let (status, body) = send(&app, "POST", &uri, Some(json!({"success": true}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "completed");
        assert_eq!(body["item"]["status_code"], 240);
        let run = store.get_run(current.run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn priority_is_refused_for_terminal_items() {
        let store = store();
        let rejected = insert(&store, "rejected", "bis").await;
        let queued = insert(&store, "pending_enrichment", "bis").await;
        let app = app(AppState::new(store, Arc::new(RecordingAgent::new())));

        let (status, _) =
            send(&app, "POST", &format!("/api/items/{}/priority", rejected.id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) =
            send(&app, "POST", &format!("/api/items/{}/priority", queued.id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body["item"]["priority_requested_at"].is_null());

        let (status, _) = send(&app, "POST", "/api/items/not-a-uuid/priority", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn prompt_lifecycle_over_http() {
        let app = app(AppState::new(store(), Arc::new(RecordingAgent::new())));

        let (status, created) = send(
            &app,
            "POST",
            "/api/prompts",
            Some(json!({
                "agent_name": "summarizer",
                "version": "1.0.0",
                "prompt_text": "Summarize for a risk officer."
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["stage"], "DEV");
        let id = created["id"].as_str().unwrap().to_string();

        let promote = format!("/api/prompts/{id}/promote");
        let (_, tst) = send(&app, "POST", &promote, None).await;
        assert_eq!(tst["stage"], "TST");
        let (_, prd) = send(&app, "POST", &promote, None).await;
        assert_eq!(prd["stage"], "PRD");

        let (status, _) = send(&app, "POST", &promote, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _) = send(&app, "DELETE", &format!("/api/prompts/{id}"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, listed) = send(&app, "GET", "/api/prompts?agent=summarizer", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (status, _) = send(&app, "POST", "/api/prompts", Some(json!({"agent_name": "tagger"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn source_health_reports_failing_sources() {
        let store = store();
        insert(&store, "failed", "fca").await;
        insert(&store, "failed", "fca").await;
        insert(&store, "enriched", "ecb").await;
        let app = app(AppState::new(store, Arc::new(RecordingAgent::new())));

        let (status, body) = send(&app, "GET", "/api/source-health", None).await;
        assert_eq!(status, StatusCode::OK);
        let health = body["health"].as_array().unwrap();
        assert_eq!(health.len(), 2);
        assert_eq!(health[0]["source_slug"], "ecb");
        assert_eq!(health[1]["source_slug"], "fca");
        assert_eq!(health[1]["failed_7d"], 2);
        assert_eq!(health[1]["total_7d"], 2);
    }
}
