//! In-memory backend.
//!
//! Implements the store and every provider trait over a single lock, so a
//! whole pipeline can run without a database (tests, dry runs).

use super::{
    promotion_candidate, Checkpoint, CommittedGame, GameAuditRecord, GameCommit, PipelineStore,
    PredictionCounts, PromotionOutcome, PromotionTarget, SeasonSnapshot,
};
use crate::features::{HistoricalAggregates, TeamGameLine};
use crate::models::{AsOf, Event, FeatureVector, Game, GameId, GameState, Prediction, Season, Team};
use crate::providers::{EventSource, HistoryProvider, ScheduleProvider};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Clone)]
struct CommitMeta {
    event_count: usize,
    fingerprint: String,
}

#[derive(Default)]
struct Inner {
    seasons: FxHashMap<String, Season>,
    teams: FxHashMap<String, Vec<Team>>,
    games: BTreeMap<GameId, Game>,
    events: FxHashMap<GameId, Vec<Event>>,
    history: FxHashMap<String, HistoricalAggregates>,
    states: FxHashMap<GameId, Vec<GameState>>,
    commits: FxHashMap<GameId, CommitMeta>,
    features: FxHashMap<GameId, BTreeMap<AsOf, FeatureVector>>,
    /// Append-only, in insertion order
    predictions: Vec<Prediction>,
    failing_commits: FxHashSet<GameId>,
}

impl Inner {
    fn season_game_ids(&self, season_id: &str) -> Vec<GameId> {
        self.games
            .values()
            .filter(|g| g.season_id == season_id)
            .map(|g| g.game_id.clone())
            .collect()
    }

    /// Seasons whose games feed `season_id`'s history: itself and every
    /// season that started before it
    fn history_seasons(&self, season_id: &str) -> FxHashSet<String> {
        let Some(target) = self.seasons.get(season_id) else {
            return std::iter::once(season_id.to_string()).collect();
        };
        self.seasons
            .values()
            .filter(|s| s.start_date <= target.start_date)
            .map(|s| s.season_id.clone())
            .collect()
    }

    /// History built from committed final states
    fn derived_history(&self, season_id: &str) -> HistoricalAggregates {
        let seasons = self.history_seasons(season_id);
        let mut history = HistoricalAggregates::new(season_id);
        for game in self.games.values().filter(|g| seasons.contains(&g.season_id)) {
            let Some(last) = self
                .states
                .get(&game.game_id)
                .and_then(|states| states.iter().rev().find(|s| s.is_final_state))
            else {
                continue;
            };
            let sides = [
                (&game.home_team, last.home.score, last.away.score, last.home.possessions()),
                (&game.away_team, last.away.score, last.home.score, last.away.possessions()),
            ];
            for (team, points_for, points_against, possessions) in sides {
                history.push(
                    team.clone(),
                    TeamGameLine {
                        game_id: game.game_id.clone(),
                        game_date: game.game_date,
                        points_for,
                        points_against,
                        possessions,
                    },
                );
            }
        }
        history
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_season(&self, season: Season) {
        self.inner
            .write()
            .seasons
            .insert(season.season_id.clone(), season);
    }

    pub fn insert_teams(&self, season_id: &str, teams: Vec<Team>) {
        self.inner.write().teams.insert(season_id.to_string(), teams);
    }

    pub fn insert_game(&self, game: Game) {
        self.inner.write().games.insert(game.game_id.clone(), game);
    }

    /// Replace a game's event log
    pub fn insert_events(&self, game_id: &str, events: Vec<Event>) {
        self.inner.write().events.insert(game_id.to_string(), events);
    }

    /// Append to a game's event log
    pub fn append_events(&self, game_id: &str, events: impl IntoIterator<Item = Event>) {
        self.inner
            .write()
            .events
            .entry(game_id.to_string())
            .or_default()
            .extend(events);
    }

    /// Serve this history instead of deriving it from committed games
    pub fn set_history(&self, history: HistoricalAggregates) {
        self.inner
            .write()
            .history
            .insert(history.season_id.clone(), history);
    }

    /// Make every commit for the game fail until cleared
    pub fn fail_commits_for(&self, game_id: &str) {
        self.inner.write().failing_commits.insert(game_id.to_string());
    }

    pub fn clear_commit_failures(&self) {
        self.inner.write().failing_commits.clear();
    }

    /// Overwrite stored states directly, bypassing a commit
    pub fn overwrite_states(&self, game_id: &str, states: Vec<GameState>) {
        self.inner.write().states.insert(game_id.to_string(), states);
    }

    pub fn states(&self, game_id: &str) -> Vec<GameState> {
        self.inner
            .read()
            .states
            .get(game_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn feature_vector(&self, game_id: &str, as_of: AsOf) -> Option<FeatureVector> {
        self.inner
            .read()
            .features
            .get(game_id)
            .and_then(|by_as_of| by_as_of.get(&as_of))
            .cloned()
    }

    pub fn game(&self, game_id: &str) -> Option<Game> {
        self.inner.read().games.get(game_id).cloned()
    }

    pub fn all_predictions(&self) -> Vec<Prediction> {
        self.inner.read().predictions.clone()
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn load_checkpoint(&self, season_id: &str) -> Result<Checkpoint> {
        let inner = self.inner.read();
        Ok(Checkpoint::from_keys(
            inner
                .predictions
                .iter()
                .filter(|p| p.season_id == season_id)
                .map(Prediction::key),
        ))
    }

    async fn load_committed_game(&self, game_id: &str) -> Result<Option<CommittedGame>> {
        let inner = self.inner.read();
        let (Some(meta), Some(game)) = (inner.commits.get(game_id), inner.games.get(game_id))
        else {
            return Ok(None);
        };

        Ok(Some(CommittedGame {
            game_id: game_id.to_string(),
            status: game.status,
            event_count: meta.event_count,
            state_count: inner.states.get(game_id).map(Vec::len).unwrap_or(0),
            fingerprint: Some(meta.fingerprint.clone()),
            final_features: inner
                .features
                .get(game_id)
                .and_then(|by_as_of| by_as_of.get(&AsOf::Final))
                .cloned(),
        }))
    }

    async fn commit_game(&self, commit: GameCommit) -> Result<()> {
        let mut inner = self.inner.write();
        let game_id = commit.game.game_id.clone();

        if inner.failing_commits.contains(&game_id) {
            return Err(anyhow!("commit rejected for game {}", game_id));
        }

        let features = inner.features.entry(game_id.clone()).or_default();
        for vector in commit.features {
            features.insert(vector.as_of, vector);
        }
        inner.states.insert(game_id.clone(), commit.states);
        inner.commits.insert(
            game_id.clone(),
            CommitMeta {
                event_count: commit.event_count,
                fingerprint: commit.fingerprint,
            },
        );
        let appended = commit.predictions.len();
        inner.predictions.extend(commit.predictions);
        inner.games.insert(game_id.clone(), commit.game);

        debug!(game_id = %game_id, predictions = appended, "Committed game");
        Ok(())
    }

    async fn promote(
        &self,
        season_id: &str,
        targets: &[PromotionTarget],
    ) -> Result<PromotionOutcome> {
        let mut inner = self.inner.write();
        let mut outcome = PromotionOutcome::default();

        for game_id in inner.season_game_ids(season_id) {
            for target in targets {
                let rows: Vec<usize> = inner
                    .predictions
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.game_id == game_id && p.predictor == target.predictor)
                    .map(|(idx, _)| idx)
                    .collect();

                let Some(chosen) = promotion_candidate(
                    rows.iter().map(|idx| (*idx, &inner.predictions[*idx])),
                    &target.version,
                ) else {
                    continue;
                };

                let already = rows
                    .iter()
                    .all(|idx| inner.predictions[*idx].active == (*idx == chosen));
                if already {
                    outcome.unchanged += 1;
                    continue;
                }

                for idx in rows {
                    inner.predictions[idx].active = idx == chosen;
                }
                outcome.activated += 1;
            }
        }

        Ok(outcome)
    }

    async fn season_snapshot(&self, season_id: &str) -> Result<SeasonSnapshot> {
        let inner = self.inner.read();
        let games = inner
            .games
            .values()
            .filter(|g| g.season_id == season_id)
            .map(|game| {
                let states = inner
                    .states
                    .get(&game.game_id)
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);
                let final_features = inner
                    .features
                    .get(&game.game_id)
                    .and_then(|by_as_of| by_as_of.get(&AsOf::Final))
                    .cloned();
                let predictors: BTreeSet<String> = inner
                    .predictions
                    .iter()
                    .filter(|p| p.game_id == game.game_id)
                    .map(|p| p.predictor.clone())
                    .collect();
                GameAuditRecord::from_parts(game.clone(), states, final_features, predictors)
            })
            .collect();

        let mut predictions: BTreeMap<String, PredictionCounts> = BTreeMap::new();
        let mut seen: FxHashSet<(&str, &str)> = FxHashSet::default();
        for p in inner.predictions.iter().filter(|p| p.season_id == season_id) {
            let counts = predictions.entry(p.predictor.clone()).or_default();
            counts.rows += 1;
            if p.active {
                counts.active += 1;
            }
            if seen.insert((p.predictor.as_str(), p.game_id.as_str())) {
                counts.games += 1;
            }
        }

        Ok(SeasonSnapshot {
            season_id: season_id.to_string(),
            games,
            predictions,
        })
    }

    async fn predictions_for_game(&self, game_id: &str) -> Result<Vec<Prediction>> {
        Ok(self
            .inner
            .read()
            .predictions
            .iter()
            .filter(|p| p.game_id == game_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl EventSource for MemoryStore {
    async fn get_events(&self, game_id: &str) -> Result<Vec<Event>> {
        Ok(self
            .inner
            .read()
            .events
            .get(game_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl ScheduleProvider for MemoryStore {
    async fn get_season(&self, season_id: &str) -> Result<Option<Season>> {
        Ok(self.inner.read().seasons.get(season_id).cloned())
    }

    async fn get_games(&self, season_id: &str) -> Result<Vec<Game>> {
        let inner = self.inner.read();
        Ok(inner
            .games
            .values()
            .filter(|g| g.season_id == season_id)
            .cloned()
            .collect())
    }

    async fn get_teams(&self, season_id: &str) -> Result<Vec<Team>> {
        Ok(self
            .inner
            .read()
            .teams
            .get(season_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl HistoryProvider for MemoryStore {
    async fn get_history(&self, season_id: &str) -> Result<HistoricalAggregates> {
        let inner = self.inner.read();
        Ok(match inner.history.get(season_id) {
            Some(history) => history.clone(),
            None => inner.derived_history(season_id),
        })
    }
}
