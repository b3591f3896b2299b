//! Enrichment orchestration, run tracking, prompt staging and retry scheduling.

pub mod config;
mod health;
mod orchestrator;
mod prompts;
pub mod retry;
mod runs;
mod scheduler;

pub use config::{Catalogue, PipelineConfig};
pub use health::source_health;
pub use orchestrator::{
    Dispatch, FinishOutcome, Orchestrator, PriorityDispatch, StepResult, SYSTEM_ACTOR,
};
pub use prompts::PromptRegistry;
pub use retry::{RetryPolicies, RetryPolicy};
pub use runs::RunTracker;
pub use scheduler::{maybe_build_scheduler, RetryScheduler, RetrySummary, RETRY_ACTOR};

pub const CRATE_NAME: &str = "insights-pipeline";
