//! Client side of the agent-execution service that performs summarize/tag/thumbnail work.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use insights_core::{upstream_preview, PipelineError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info_span, warn, Instrument};

#[cfg(any(test, feature = "test-support"))]
mod recording;

#[cfg(any(test, feature = "test-support"))]
pub use recording::RecordingAgent;

pub const CRATE_NAME: &str = "insights-agent";

/// Header carrying the shared secret.
pub const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentEndpoint {
    EnrichSingleStep,
    EnrichItem,
    ProcessItem,
}

impl AgentEndpoint {
    pub fn path(self) -> &'static str {
        match self {
            Self::EnrichSingleStep => "/api/agents/enrich-single-step",
            Self::EnrichItem => "/api/agents/enrich-item",
            Self::ProcessItem => "/api/agents/process-item",
        }
    }
}

/// Status and JSON body returned by the agent, passed through to callers unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub status: u16,
    pub body: JsonValue,
}

impl AgentResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait AgentService: Send + Sync {
    /// Fails with `Misconfigured` when the client could never reach the agent.
    /// Callers check this before touching any state.
    fn check_ready(&self) -> Result<(), PipelineError>;

    /// One POST, no in-process retry.
    async fn invoke(
        &self,
        endpoint: AgentEndpoint,
        body: JsonValue,
    ) -> Result<AgentResponse, PipelineError>;
}

#[derive(Debug, Clone)]
pub struct AgentClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for AgentClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3001".to_string(),
            api_key: None,
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
pub struct HttpAgentClient {
    client: reqwest::Client,
    config: AgentClientConfig,
}

impl HttpAgentClient {
    pub fn new(config: AgentClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &AgentClientConfig {
        &self.config
    }

    fn url_for(&self, endpoint: AgentEndpoint) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint.path())
    }

    fn api_key(&self) -> Result<&str, PipelineError> {
        self.config
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| PipelineError::Misconfigured("AGENT_API_KEY is not set".into()))
    }
}

/// Transport failures carry no HTTP status of their own; report them as 503.
fn transport_error(err: &reqwest::Error) -> PipelineError {
    let status = if err.is_timeout() { 504 } else { 503 };
    PipelineError::UpstreamUnavailable {
        status,
        preview: upstream_preview(&err.to_string()),
    }
}

#[async_trait]
impl AgentService for HttpAgentClient {
    fn check_ready(&self) -> Result<(), PipelineError> {
        if self.config.base_url.trim().is_empty() {
            return Err(PipelineError::Misconfigured("AGENT_API_URL is not set".into()));
        }
        self.api_key().map(|_| ())
    }

    async fn invoke(
        &self,
        endpoint: AgentEndpoint,
        body: JsonValue,
    ) -> Result<AgentResponse, PipelineError> {
        let api_key = self.api_key()?;
        let url = self.url_for(endpoint);
        let span = info_span!("agent_call", endpoint = endpoint.path());

        async move {
            let resp = self
                .client
                .post(&url)
                .header(API_KEY_HEADER, api_key)
                .json(&body)
                .send()
                .await
                .map_err(|err| transport_error(&err))?;
            let status = resp.status().as_u16();
            let raw = resp.text().await.map_err(|err| transport_error(&err))?;

            match serde_json::from_str::<JsonValue>(&raw) {
                Ok(body) => {
                    debug!(status, "agent replied");
                    Ok(AgentResponse { status, body })
                }
                Err(_) => {
                    warn!(status, "agent returned a non-JSON body");
                    let status = if status >= 500 { status } else { 502 };
                    Err(PipelineError::upstream(status, &raw))
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;

    async fn spawn_agent() -> String {
        let app = Router::new()
            .route(
                "/api/agents/enrich-single-step",
                post(|headers: HeaderMap, Json(body): Json<JsonValue>| async move {
                    let key = headers
                        .get(API_KEY_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    if key != "secret" {
                        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "bad key"})));
                    }
                    (StatusCode::OK, Json(json!({"success": true, "echo": body})))
                }),
            )
            .route(
                "/api/agents/enrich-item",
                post(|| async {
                    (
                        StatusCode::BAD_GATEWAY,
                        format!("<html>\n<body>{}</body></html>", "gateway ".repeat(40)),
                    )
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    fn client(base_url: String, api_key: Option<&str>) -> HttpAgentClient {
        HttpAgentClient::new(AgentClientConfig {
            base_url,
            api_key: api_key.map(ToString::to_string),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn missing_key_is_misconfigured() {
        let agent = client("http://localhost:3001".into(), Some("  "));
        assert!(matches!(agent.check_ready(), Err(PipelineError::Misconfigured(_))));
        let agent = client("http://localhost:3001".into(), Some("k"));
        assert!(agent.check_ready().is_ok());
    }

    #[tokio::test]
    async fn json_responses_propagate_status_and_body() {
        let base = spawn_agent().await;

        let agent = client(base.clone(), Some("secret"));
        let resp = agent
            .invoke(AgentEndpoint::EnrichSingleStep, json!({"id": "abc", "step": "tag"}))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body["echo"]["step"], "tag");

        let wrong = client(base, Some("nope"));
        let resp = wrong
            .invoke(AgentEndpoint::EnrichSingleStep, json!({"id": "abc"}))
            .await
            .unwrap();
        assert_eq!(resp.status, 401);
        assert!(!resp.is_success());
    }

    #[tokio::test]
    async fn html_bodies_become_bounded_upstream_errors() {
        let base = spawn_agent().await;
        let agent = client(base, Some("secret"));
        let err = agent
            .invoke(AgentEndpoint::EnrichItem, json!({"id": "abc"}))
            .await
            .unwrap_err();
        match err {
            PipelineError::UpstreamUnavailable { status, preview } => {
                assert_eq!(status, 502);
                assert!(preview.len() <= 103);
                assert!(!preview.contains('\n'));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_agent_is_upstream_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let agent = client(format!("http://{addr}"), Some("secret"));
        let err = agent
            .invoke(AgentEndpoint::ProcessItem, json!({"id": "abc"}))
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 503);
    }
}
