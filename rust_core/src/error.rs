//! Domain error types.
//!
//! Every error names the unit it affects (game, predictor, season) so that a
//! failure in one unit can be reported without touching any other.

use crate::models::AsOf;
use thiserror::Error;

/// Event log for a single game cannot be replayed.
///
/// Scope: one game. The batch continues with the next game.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestionError {
    #[error("game {game_id}: sequence gap, expected {expected} but found {found}")]
    SequenceGap {
        game_id: String,
        expected: u64,
        found: u64,
    },

    #[error("game {game_id}: sequence inversion, {found} follows {previous}")]
    SequenceInversion {
        game_id: String,
        previous: u64,
        found: u64,
    },

    #[error("game {game_id}: event {sequence} belongs to game {event_game_id}")]
    ForeignEvent {
        game_id: String,
        event_game_id: String,
        sequence: u64,
    },
}

impl IngestionError {
    pub fn game_id(&self) -> &str {
        match self {
            IngestionError::SequenceGap { game_id, .. }
            | IngestionError::SequenceInversion { game_id, .. }
            | IngestionError::ForeignEvent { game_id, .. } => game_id,
        }
    }
}

/// Features for a (game, predictor) pair cannot be produced or selected.
///
/// Scope: one game for one predictor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeatureError {
    #[error("game {game_id}: no game states to compute features from")]
    NoStates { game_id: String },

    #[error("game {game_id}: no game state at as-of point {as_of}")]
    AsOfNotFound { game_id: String, as_of: AsOf },

    #[error("game {game_id}: feature '{feature}' required but not computed")]
    MissingFeature { game_id: String, feature: String },

    #[error("game {game_id}: league-average fallback used for {teams:?} but predictor requires real history")]
    FallbackRejected { game_id: String, teams: Vec<String> },
}

/// A predictor artifact cannot be loaded.
///
/// Scope: the whole predictor for the current batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelLoadError {
    #[error("predictor {predictor}: no artifact configured")]
    MissingArtifact { predictor: String },

    #[error("predictor {predictor}: cannot read artifact {path}: {reason}")]
    Io {
        predictor: String,
        path: String,
        reason: String,
    },

    #[error("predictor {predictor}: corrupt artifact: {reason}")]
    Corrupt { predictor: String, reason: String },

    #[error("predictor {predictor}: artifact version {found} does not match configured {expected}")]
    VersionMismatch {
        predictor: String,
        expected: String,
        found: String,
    },

    #[error("predictor {predictor}: artifact is a {found} model, configured as {expected}")]
    KindMismatch {
        predictor: String,
        expected: String,
        found: String,
    },
}

impl ModelLoadError {
    pub fn predictor(&self) -> &str {
        match self {
            ModelLoadError::MissingArtifact { predictor }
            | ModelLoadError::Io { predictor, .. }
            | ModelLoadError::Corrupt { predictor, .. }
            | ModelLoadError::VersionMismatch { predictor, .. }
            | ModelLoadError::KindMismatch { predictor, .. } => predictor,
        }
    }
}

/// Batch-level failures: the request itself cannot be served.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("season {0} is not in the configured valid seasons")]
    UnknownSeason(String),

    #[error("predictor {0} is not registered")]
    UnknownPredictor(String),

    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

/// Configuration file or environment is unusable.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
