use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use insights_agent::{AgentService, HttpAgentClient};
use insights_pipeline::{
    source_health, Catalogue, Orchestrator, PipelineConfig, PromptRegistry, RetryScheduler,
    SYSTEM_ACTOR,
};
use insights_storage::{open_store, PgStore};
use serde_json::Value as JsonValue;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "insights-cli")]
#[command(about = "BFSI insights pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Load the status catalogue into `status_lookup`.
    Seed,
    /// Run the HTTP API (and the retry scheduler when enabled).
    Serve,
    /// Run one retry pass and print its summary.
    Retry,
    /// Re-run a single enrichment step for an item.
    RunStep {
        step: String,
        id: Uuid,
        #[arg(long, default_value = SYSTEM_ACTOR)]
        created_by: String,
    },
    /// Restart full enrichment for an item.
    Reenrich {
        id: Uuid,
        #[arg(long, default_value = SYSTEM_ACTOR)]
        created_by: String,
    },
    /// Ask the agent to process an item ahead of the queue.
    Prioritize { id: Uuid },
    /// Move a prompt version one stage forward.
    Promote { id: Uuid },
    /// Make a prompt version current again.
    Rollback { id: Uuid },
    /// Print per-source health.
    SourceHealth,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,insights_pipeline=info,insights_web=info,insights_storage=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Migrate => {
            PgStore::connect(&config.database_url).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Seed => {
            let catalogue = Catalogue::load(&config.catalogue_path).await?;
            let store = open_store(&config.database_url).await?;
            let written = store.upsert_statuses(&catalogue.statuses).await?;
            println!("seeded {written} statuses from {}", config.catalogue_path.display());
        }
        Commands::Serve => insights_web::serve(config).await?,
        Commands::Retry => {
            let orchestrator = orchestrator(&config).await?;
            let policies = Catalogue::load(&config.catalogue_path).await?.retry_policies();
            let scheduler = RetryScheduler::new(
                orchestrator,
                policies,
                config.retry_batch_limit,
                config.stall_after(),
            );
            let summary = scheduler.tick(Utc::now()).await?;
            info!(?summary, "retry pass finished");
            print_json(serde_json::to_value(summary)?)?;
        }
        Commands::RunStep { step, id, created_by } => {
            let orchestrator = orchestrator(&config).await?;
            let dispatch = orchestrator.run_step(&step, id, &created_by).await?;
            print_json(serde_json::to_value(dispatch)?)?;
        }
        Commands::Reenrich { id, created_by } => {
            let orchestrator = orchestrator(&config).await?;
            let dispatch = orchestrator.reenrich(id, &created_by).await?;
            print_json(serde_json::to_value(dispatch)?)?;
        }
        Commands::Prioritize { id } => {
            let orchestrator = orchestrator(&config).await?;
            let dispatch = orchestrator.prioritize(id).await?;
            print_json(serde_json::to_value(dispatch)?)?;
        }
        Commands::Promote { id } => {
            let prompts = PromptRegistry::new(open_store(&config.database_url).await?);
            print_json(serde_json::to_value(prompts.promote(id).await?)?)?;
        }
        Commands::Rollback { id } => {
            let prompts = PromptRegistry::new(open_store(&config.database_url).await?);
            print_json(serde_json::to_value(prompts.rollback(id).await?)?)?;
        }
        Commands::SourceHealth => {
            let store = open_store(&config.database_url).await?;
            let health = source_health(store.as_ref(), Utc::now()).await?;
            print_json(serde_json::to_value(health)?)?;
        }
    }

    Ok(())
}

async fn orchestrator(config: &PipelineConfig) -> Result<Orchestrator> {
    let store = open_store(&config.database_url).await?;
    let agent: Arc<dyn AgentService> = Arc::new(HttpAgentClient::new(config.agent_client_config())?);
    Ok(Orchestrator::new(store, agent))
}

fn print_json(value: JsonValue) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
