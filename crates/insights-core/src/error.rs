use thiserror::Error;

/// Maximum number of characters of an upstream body echoed back in an error.
const PREVIEW_CHARS: usize = 100;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Validation(String),
    #[error("unknown enrichment step: {0}")]
    UnknownStep(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
    #[error("agent API unavailable: {preview}")]
    UpstreamUnavailable { status: u16, preview: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("misconfigured: {0}")]
    Misconfigured(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_transition(
        entity: &'static str,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        Self::InvalidTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn upstream(status: u16, raw: &str) -> Self {
        Self::UpstreamUnavailable {
            status,
            preview: upstream_preview(raw),
        }
    }

    /// Malformed requests, including unknown step names.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::UnknownStep(_))
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::UnknownStep(_) => 400,
            Self::NotFound { .. } => 404,
            Self::InvalidTransition { .. } | Self::Conflict(_) => 409,
            Self::UpstreamUnavailable { status, .. } => {
                if *status >= 500 {
                    *status
                } else {
                    503
                }
            }
            Self::Misconfigured(_) | Self::Storage(_) => 500,
        }
    }
}

/// Collapse whitespace and cut an upstream body down to a short, single-line preview.
pub fn upstream_preview(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= PREVIEW_CHARS {
        return collapsed;
    }
    let mut cut = collapsed.chars().take(PREVIEW_CHARS).collect::<String>();
    cut.push_str("...");
    cut
}
