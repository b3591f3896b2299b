use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::payload::{RETURN_STATUS_KEY, SINGLE_STEP_KEY};
use crate::status::names;
use crate::PipelineError;

/// One discovered article tracked through the enrichment pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub url: String,
    pub status_code: i32,
    pub payload: JsonValue,
    pub current_run_id: Option<Uuid>,
    pub failure_count: i32,
    pub last_failed_step: Option<String>,
    /// Error reported by the most recent failed attempt.
    pub last_error_message: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub priority_requested_at: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn source_slug(&self) -> Option<&str> {
        self.payload
            .get("source_slug")
            .and_then(JsonValue::as_str)
            .filter(|slug| !slug.is_empty())
    }

    /// Status the agent should leave the item in once the dispatched step finishes.
    pub fn return_status_hint(&self) -> Option<i32> {
        self.payload
            .get(RETURN_STATUS_KEY)
            .and_then(JsonValue::as_i64)
            .and_then(|code| i32::try_from(code).ok())
    }

    pub fn single_step_hint(&self) -> Option<EnrichStep> {
        self.payload
            .get(SINGLE_STEP_KEY)
            .and_then(JsonValue::as_str)
            .and_then(|step| step.parse().ok())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewQueueItem {
    pub url: String,
    pub status_code: i32,
    #[serde(default)]
    pub payload: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(PipelineError::Validation(format!(
                "unknown pipeline run status {other}"
            ))),
        }
    }
}

/// One enrichment attempt against a queue item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub queue_id: Uuid,
    pub trigger: String,
    pub status: RunStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichStep {
    Summarize,
    Tag,
    Thumbnail,
}

impl EnrichStep {
    pub const ALL: [EnrichStep; 3] = [Self::Summarize, Self::Tag, Self::Thumbnail];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Summarize => "summarize",
            Self::Tag => "tag",
            Self::Thumbnail => "thumbnail",
        }
    }

    /// Status an item enters when this step is (re)dispatched.
    pub fn entry_status_name(self) -> &'static str {
        match self {
            Self::Summarize => names::TO_SUMMARIZE,
            Self::Tag => names::TO_TAG,
            Self::Thumbnail => names::TO_THUMBNAIL,
        }
    }

    /// Agent whose current prompt version drives this step.
    pub fn agent_name(self) -> &'static str {
        match self {
            Self::Summarize => "summarizer",
            Self::Tag => "tagger",
            Self::Thumbnail => "thumbnail-generator",
        }
    }
}

impl fmt::Display for EnrichStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrichStep {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| PipelineError::UnknownStep(s.to_string()))
    }
}

/// Lifecycle position of a prompt version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "DEV")]
    Dev,
    #[serde(rename = "TST")]
    Tst,
    #[serde(rename = "PRD")]
    Prd,
    #[serde(rename = "RET")]
    Ret,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dev => "DEV",
            Self::Tst => "TST",
            Self::Prd => "PRD",
            Self::Ret => "RET",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEV" => Ok(Self::Dev),
            "TST" => Ok(Self::Tst),
            "PRD" => Ok(Self::Prd),
            "RET" => Ok(Self::Ret),
            other => Err(PipelineError::Validation(format!("unknown prompt stage {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptVersion {
    pub id: Uuid,
    pub agent_name: String,
    pub version: String,
    pub prompt_text: String,
    pub model_id: Option<String>,
    pub stage: Stage,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deployed_at: Option<DateTime<Utc>>,
    pub retired_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPromptVersion {
    pub agent_name: String,
    pub version: String,
    pub prompt_text: String,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}
