//! Core domain model for the insights ingestion pipeline: queue items, pipeline runs,
//! prompt versions, the status catalogue and the error taxonomy shared by every crate.

mod error;
pub mod health;
mod model;
mod payload;
mod status;

pub use error::{upstream_preview, PipelineError};
pub use model::{
    EnrichStep, NewPromptVersion, NewQueueItem, PipelineRun, PromptVersion, QueueItem, RunStatus,
    Stage,
};
pub use payload::{PayloadPatch, MANUAL_OVERRIDE_KEY, RETURN_STATUS_KEY, SINGLE_STEP_KEY};
pub use status::{names, StatusBand, StatusCode, StatusRegistry};

pub const CRATE_NAME: &str = "insights-core";
