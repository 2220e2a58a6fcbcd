//! Persisted pipeline state.
//!
//! [`PipelineStore`] is the seam between the orchestrator and storage. Every
//! write is either append-only (predictions) or an atomic replace of a whole
//! unit (a game's states, a feature vector at one as-of point).

use crate::models::{
    AsOf, FeatureVector, Game, GameId, GameState, GameStatus, Prediction, PredictionKey,
};
use anyhow::Result;
use async_trait::async_trait;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub mod memory;

pub use memory::MemoryStore;

/// Everything a work unit writes for one game, applied all-or-nothing
#[derive(Debug, Clone)]
pub struct GameCommit {
    /// Game row carrying the status derived by reconstruction
    pub game: Game,
    /// Events the states were reconstructed from
    pub event_count: usize,
    pub fingerprint: String,
    /// Replaces the game's stored states wholesale
    pub states: Vec<GameState>,
    /// Each replaces the stored vector at the same as-of point
    pub features: Vec<FeatureVector>,
    /// Appended, never inactive rows overwritten
    pub predictions: Vec<Prediction>,
}

/// What is already stored for a game
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedGame {
    pub game_id: GameId,
    pub status: GameStatus,
    pub event_count: usize,
    pub state_count: usize,
    pub fingerprint: Option<String>,
    pub final_features: Option<FeatureVector>,
}

/// Prediction keys already produced for a season
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    satisfied: FxHashSet<PredictionKey>,
}

impl Checkpoint {
    pub fn from_keys(keys: impl IntoIterator<Item = PredictionKey>) -> Self {
        Self {
            satisfied: keys.into_iter().collect(),
        }
    }

    pub fn is_satisfied(&self, key: &PredictionKey) -> bool {
        self.satisfied.contains(key)
    }

    pub fn len(&self) -> usize {
        self.satisfied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.satisfied.is_empty()
    }
}

/// Version of a predictor whose rows should be served
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionTarget {
    pub predictor: String,
    pub version: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionOutcome {
    /// (game, predictor) pairs whose active row changed
    pub activated: usize,
    /// Pairs already serving the target row
    pub unchanged: usize,
}

/// Audit view of one game
#[derive(Debug, Clone, PartialEq)]
pub struct GameAuditRecord {
    pub game: Game,
    pub state_count: usize,
    pub final_state_count: usize,
    pub flagged_state_count: usize,
    pub final_features: Option<FeatureVector>,
    /// Predictors with at least one stored row for the game
    pub predictors: BTreeSet<String>,
}

impl GameAuditRecord {
    pub fn from_parts(
        game: Game,
        states: &[GameState],
        final_features: Option<FeatureVector>,
        predictors: BTreeSet<String>,
    ) -> Self {
        Self {
            game,
            state_count: states.len(),
            final_state_count: states.iter().filter(|s| s.is_final_state).count(),
            flagged_state_count: states.iter().filter(|s| s.is_flagged()).count(),
            final_features,
            predictors,
        }
    }
}

/// Stored prediction rows for one predictor across a season
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionCounts {
    pub rows: usize,
    pub active: usize,
    /// Distinct games with at least one row
    pub games: usize,
}

/// Read model consumed by the audit
#[derive(Debug, Clone, Default)]
pub struct SeasonSnapshot {
    pub season_id: String,
    pub games: Vec<GameAuditRecord>,
    /// Keyed by predictor name
    pub predictions: BTreeMap<String, PredictionCounts>,
}

/// Pick the row a (game, predictor) pair should serve at `version`: the
/// final-game row when one exists, otherwise the newest.
pub fn promotion_candidate<'a>(
    rows: impl Iterator<Item = (usize, &'a Prediction)>,
    version: &str,
) -> Option<usize> {
    rows.filter(|(_, p)| p.model_version == version)
        .max_by_key(|(idx, p)| (p.as_of == AsOf::Final, p.created_at, *idx))
        .map(|(idx, _)| idx)
}

#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Keys of every prediction stored for the season
    async fn load_checkpoint(&self, season_id: &str) -> Result<Checkpoint>;

    async fn load_committed_game(&self, game_id: &str) -> Result<Option<CommittedGame>>;

    /// Apply a game's commit atomically
    async fn commit_game(&self, commit: GameCommit) -> Result<()>;

    /// Flip `active` to each target's candidate row for every game in the season
    async fn promote(
        &self,
        season_id: &str,
        targets: &[PromotionTarget],
    ) -> Result<PromotionOutcome>;

    async fn season_snapshot(&self, season_id: &str) -> Result<SeasonSnapshot>;

    async fn predictions_for_game(&self, game_id: &str) -> Result<Vec<Prediction>>;
}
