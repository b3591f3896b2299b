use std::sync::Mutex;

use async_trait::async_trait;
use insights_core::PipelineError;
use serde_json::{json, Value as JsonValue};

use crate::{AgentEndpoint, AgentResponse, AgentService};

#[derive(Debug, Clone)]
enum Reply {
    Respond(AgentResponse),
    Unavailable { status: u16, raw: String },
}

/// In-process agent that records every call and answers with a canned reply.
#[derive(Debug)]
pub struct RecordingAgent {
    reply: Reply,
    misconfigured: Option<String>,
    calls: Mutex<Vec<(AgentEndpoint, JsonValue)>>,
}

impl Default for RecordingAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingAgent {
    /// Replies `200 {"success": true}` to everything.
    pub fn new() -> Self {
        Self::responding(200, json!({"success": true}))
    }

    pub fn responding(status: u16, body: JsonValue) -> Self {
        Self {
            reply: Reply::Respond(AgentResponse { status, body }),
            misconfigured: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every call fails as if the agent returned an unparseable body.
    pub fn unavailable(status: u16, raw: impl Into<String>) -> Self {
        Self {
            reply: Reply::Unavailable {
                status,
                raw: raw.into(),
            },
            misconfigured: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn misconfigured(reason: impl Into<String>) -> Self {
        Self {
            misconfigured: Some(reason.into()),
            ..Self::new()
        }
    }

    pub fn calls(&self) -> Vec<(AgentEndpoint, JsonValue)> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl AgentService for RecordingAgent {
    fn check_ready(&self) -> Result<(), PipelineError> {
        match &self.misconfigured {
            Some(reason) => Err(PipelineError::Misconfigured(reason.clone())),
            None => Ok(()),
        }
    }

    async fn invoke(
        &self,
        endpoint: AgentEndpoint,
        body: JsonValue,
    ) -> Result<AgentResponse, PipelineError> {
        self.check_ready()?;
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((endpoint, body));
        match &self.reply {
            Reply::Respond(resp) => Ok(resp.clone()),
            Reply::Unavailable { status, raw } => Err(PipelineError::upstream(*status, raw)),
        }
    }
}
