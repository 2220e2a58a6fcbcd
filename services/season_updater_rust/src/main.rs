//! Season updater service
//!
//! Runs one update batch or audit for a season and exits with the report's
//! status code:
//!
//! - `update --season S [--predictor P]`: reconstruct, predict, audit, promote
//! - `audit --season S`: read-only consistency audit

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use hoopcast_core::db::{create_pool, schema, DbPoolConfig, PgStore};
use hoopcast_core::{BatchRequest, CancelToken, PipelineConfig, UpdateOrchestrator};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "season_updater")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Incremental season state and prediction updates", long_about = None)]
struct Cli {
    /// Pipeline configuration file (JSON)
    #[arg(long, env = "PIPELINE_CONFIG", default_value = "pipeline.json", global = true)]
    config: PathBuf,

    /// Create missing tables before running
    #[arg(long, global = true)]
    bootstrap_schema: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring a season's states, features and predictions up to date
    Update {
        #[arg(long)]
        season: String,

        /// Only run this registered predictor
        #[arg(long)]
        predictor: Option<String>,
    },

    /// Check a season's committed data without writing
    Audit {
        #[arg(long)]
        season: String,
    },
}

#[tokio::main]
async fn main() {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let code = match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            error!("Season updater failed: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let config = PipelineConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;

    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL must be set in the environment or config")?;
    let pool_config = DbPoolConfig::from_env(DbPoolConfig::for_workers(config.max_workers));
    let pool = create_pool(&database_url, &pool_config).await?;

    if cli.bootstrap_schema {
        schema::bootstrap(&pool).await?;
    }

    let store = Arc::new(PgStore::new(pool));
    let orchestrator = UpdateOrchestrator::with_backend(config, store);

    match cli.command {
        Commands::Update { season, predictor } => {
            let mut request = BatchRequest::season(season);
            if let Some(predictor) = predictor {
                request = request.with_predictor(predictor);
            }

            let cancel = CancelToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, finishing in-flight games");
                    on_signal.cancel();
                }
            });

            info!(season = %request.season_id, predictor = ?request.predictor, "Running update batch");
            let report = orchestrator.run_batch(&request, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(report.exit_code())
        }
        Commands::Audit { season } => {
            info!(season = %season, "Running audit");
            let report = orchestrator.audit_season(&season).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(if report.has_fatal() { 2 } else { 0 })
        }
    }
}
