//! Hoopcast Core - season state reconstruction and prediction updates.
//!
//! This crate provides:
//! - Event-to-state reconstruction of play-by-play logs
//! - Live win probability from a game state
//! - Feature computation with league-prior fallback
//! - Predictor registry over versioned model artifacts (Baseline, Linear, Tree, MLP)
//! - Incremental, failure-isolated season update batches
//! - Season consistency audit and the promotion gate
//! - In-memory and PostgreSQL stores

pub mod audit;
pub mod config;
pub mod db;
pub mod error;
pub mod features;
pub mod models;
pub mod orchestrator;
pub mod predictors;
pub mod providers;
pub mod reconstruction;
pub mod store;
pub mod win_prob;

pub use audit::{run_audit, AuditReport, AuditThresholds, GateDecision, PromotionGate, SeasonStats};
pub use config::{PipelineConfig, PredictorConfig};
pub use error::{ConfigError, FeatureError, IngestionError, ModelLoadError, PipelineError};
pub use features::{FeatureEngine, HistoricalAggregates, LeaguePrior};
pub use orchestrator::{BatchReport, BatchRequest, CancelToken, UpdateOrchestrator};
pub use predictors::{Predictor, PredictorKind, PredictorRegistry};
pub use reconstruction::{reconstruct_batch, reconstruct_game};
pub use store::{MemoryStore, PipelineStore};
pub use win_prob::{live_home_win_prob, win_prob_timeline};
