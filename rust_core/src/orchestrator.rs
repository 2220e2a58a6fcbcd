//! Season update orchestrator.
//!
//! A batch runs in four phases:
//! 1. prefetch: season, games, teams, history and every game's events
//! 2. units: one per game, bounded by `max_workers`; each reconstructs,
//!    computes features, predicts the unsatisfied keys and commits once
//! 3. audit over the committed season
//! 4. promotion, only when the gate is open
//!
//! Failures stay inside their unit. An ingestion, fetch or commit error
//! costs one game; a feature error costs one (game, predictor) pair.

use crate::audit::{run_audit, AuditReport, GateDecision, PromotionGate};
use crate::config::PipelineConfig;
use crate::error::{FeatureError, PipelineError};
use crate::features::{FeatureEngine, HistoricalAggregates};
use crate::models::{AsOf, Event, FeatureVector, Game, GameId, GameStatus, Prediction, PredictionKey};
use crate::predictors::{FileModelLoader, ModelLoader, Predictor, PredictorRegistry};
use crate::providers::{EventSource, HistoryProvider, ScheduleProvider};
use crate::reconstruction::{fingerprint, reconstruct_game};
use crate::store::{Checkpoint, CommittedGame, GameCommit, PipelineStore, PromotionOutcome};
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// ============================================================================
// Requests, cancellation & reports
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub season_id: String,
    /// Restrict the batch to one registered predictor
    #[serde(default)]
    pub predictor: Option<String>,
}

impl BatchRequest {
    pub fn season(season_id: impl Into<String>) -> Self {
        Self {
            season_id: season_id.into(),
            predictor: None,
        }
    }

    pub fn with_predictor(mut self, predictor: impl Into<String>) -> Self {
        self.predictor = Some(predictor.into());
        self
    }
}

/// Stops a batch from scheduling further games once set
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            warn!("Batch cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Where in a unit a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStage {
    Fetch,
    Ingestion,
    Features,
    Predict,
    Commit,
}

impl UnitStage {
    /// Stages whose failure leaves a game unprocessed
    pub fn is_game_level(&self) -> bool {
        !matches!(self, UnitStage::Predict)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitError {
    pub game_id: GameId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predictor: Option<String>,
    pub stage: UnitStage,
    pub message: String,
}

impl UnitError {
    fn game(game_id: &str, stage: UnitStage, message: impl ToString) -> Self {
        Self {
            game_id: game_id.to_string(),
            predictor: None,
            stage,
            message: message.to_string(),
        }
    }

    fn pair(game_id: &str, predictor: &str, stage: UnitStage, message: impl ToString) -> Self {
        Self {
            game_id: game_id.to_string(),
            predictor: Some(predictor.to_string()),
            stage,
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFailure {
    pub predictor: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub season_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub games_total: usize,
    /// Games whose unit ran to completion (committed or already current)
    pub games_processed: usize,
    pub games_committed: usize,
    /// Prediction keys written by this batch
    pub written: Vec<PredictionKey>,
    pub unit_errors: Vec<UnitError>,
    pub model_errors: Vec<ModelFailure>,
    pub audit: AuditReport,
    pub gate: GateDecision,
    /// None when promotion was blocked or skipped
    pub promotion: Option<PromotionOutcome>,
}

impl BatchReport {
    /// 2 on a fatal audit, 1 on any game-level or model-load failure or a
    /// cancelled batch, else 0
    pub fn exit_code(&self) -> i32 {
        if self.audit.has_fatal() {
            2
        } else if self.cancelled
            || !self.model_errors.is_empty()
            || self.unit_errors.iter().any(|e| e.stage.is_game_level())
        {
            1
        } else {
            0
        }
    }

    pub fn errors_for_game<'a>(&'a self, game_id: &'a str) -> impl Iterator<Item = &'a UnitError> {
        self.unit_errors.iter().filter(move |e| e.game_id == game_id)
    }
}

// ============================================================================
// Work unit (pure, runs on the blocking pool)
// ============================================================================

struct UnitInput {
    game: Game,
    events: Vec<Event>,
    committed: Option<CommittedGame>,
    season_id: String,
    history: Arc<HistoricalAggregates>,
    predictors: Arc<Vec<Arc<dyn Predictor>>>,
    checkpoint: Arc<Checkpoint>,
    engine: FeatureEngine,
    live_predictions: bool,
    recompute_features: bool,
}

#[derive(Default)]
struct UnitPlan {
    commit: Option<GameCommit>,
    written: Vec<PredictionKey>,
    errors: Vec<UnitError>,
}

/// Point a game's predictions refer to, if it is eligible for any
fn prediction_point(status: GameStatus, last_sequence: Option<u64>, live: bool) -> Option<AsOf> {
    match (status, last_sequence) {
        (GameStatus::Final, Some(_)) => Some(AsOf::Final),
        (GameStatus::InProgress, Some(seq)) if live => Some(AsOf::Event(seq)),
        _ => None,
    }
}

fn plan_unit(input: &UnitInput) -> Result<UnitPlan, UnitError> {
    let game_id = input.game.game_id.as_str();

    let recon = reconstruct_game(&input.game, &input.events)
        .map_err(|e| UnitError::game(game_id, UnitStage::Ingestion, e))?;
    let fp = fingerprint(&recon.states)
        .map_err(|e| UnitError::game(game_id, UnitStage::Ingestion, e))?;

    let states_current = input.committed.as_ref().is_some_and(|c| {
        c.fingerprint.as_deref() == Some(fp.as_str())
            && c.event_count == input.events.len()
            && c.state_count == recon.states.len()
            && c.status == recon.status
    });

    let mut plan = UnitPlan::default();
    let mut features: Vec<FeatureVector> = Vec::new();
    let mut predictions: Vec<Prediction> = Vec::new();

    let as_of = prediction_point(
        recon.status,
        recon.last_state().map(|s| s.sequence),
        input.live_predictions,
    );

    if let Some(as_of) = as_of {
        let stored = match (&input.committed, as_of) {
            (Some(committed), AsOf::Final) if states_current && !input.recompute_features => {
                committed.final_features.clone()
            }
            _ => None,
        };

        // Vectors that fell back to the prior are recomputed against the
        // current history and recommitted only when they change.
        let vector = match stored {
            Some(vector) if !vector.uses_fallback() => {
                debug!(game_id, "Reusing stored final feature vector");
                Some(vector)
            }
            stored => match input
                .engine
                .compute(&input.game, &recon.states, &input.history, as_of)
            {
                Ok(vector) => {
                    if stored.as_ref() != Some(&vector) {
                        features.push(vector.clone());
                    }
                    Some(vector)
                }
                Err(e) => {
                    plan.errors
                        .push(UnitError::game(game_id, UnitStage::Features, e));
                    None
                }
            },
        };

        if let Some(vector) = vector {
            for predictor in input.predictors.iter() {
                let key = PredictionKey {
                    game_id: game_id.to_string(),
                    predictor: predictor.name().to_string(),
                    model_version: predictor.version().to_string(),
                    as_of,
                };
                if input.checkpoint.is_satisfied(&key) {
                    continue;
                }

                match predictor.predict(&vector) {
                    Ok(output) => {
                        predictions.push(Prediction {
                            prediction_id: Uuid::new_v4(),
                            game_id: key.game_id.clone(),
                            season_id: input.season_id.clone(),
                            predictor: key.predictor.clone(),
                            model_version: key.model_version.clone(),
                            as_of,
                            home_score: output.home_score,
                            away_score: output.away_score,
                            margin: output.margin,
                            home_win_prob: output.home_win_prob,
                            active: false,
                            created_at: Utc::now(),
                        });
                        plan.written.push(key);
                    }
                    Err(e) => plan.errors.push(predict_error(game_id, predictor.name(), e)),
                }
            }
        }
    }

    if states_current && features.is_empty() && predictions.is_empty() {
        debug!(game_id, "Game already current, nothing to commit");
        return Ok(plan);
    }

    let mut game = input.game.clone();
    game.status = recon.status;
    plan.commit = Some(GameCommit {
        game,
        event_count: input.events.len(),
        fingerprint: fp,
        states: recon.states,
        features,
        predictions,
    });
    Ok(plan)
}

fn predict_error(game_id: &str, predictor: &str, e: FeatureError) -> UnitError {
    UnitError::pair(game_id, predictor, UnitStage::Predict, e)
}

/// Result of one unit after its commit
struct UnitOutcome {
    game_id: GameId,
    completed: bool,
    committed: bool,
    written: Vec<PredictionKey>,
    errors: Vec<UnitError>,
}

impl UnitOutcome {
    fn failed(game_id: GameId, error: UnitError) -> Self {
        Self {
            game_id,
            completed: false,
            committed: false,
            written: Vec::new(),
            errors: vec![error],
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct UpdateOrchestrator {
    config: PipelineConfig,
    registry: PredictorRegistry,
    loader: Arc<dyn ModelLoader>,
    engine: FeatureEngine,
    store: Arc<dyn PipelineStore>,
    events: Arc<dyn EventSource>,
    schedule: Arc<dyn ScheduleProvider>,
    history: Arc<dyn HistoryProvider>,
}

impl UpdateOrchestrator {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn PipelineStore>,
        events: Arc<dyn EventSource>,
        schedule: Arc<dyn ScheduleProvider>,
        history: Arc<dyn HistoryProvider>,
    ) -> Self {
        let registry = PredictorRegistry::from_configs(config.predictors.clone());
        let engine = FeatureEngine::new(config.league_prior, config.min_history_games);
        Self {
            config,
            registry,
            loader: Arc::new(FileModelLoader::new()),
            engine,
            store,
            events,
            schedule,
            history,
        }
    }

    /// One backend serving the store and every provider
    pub fn with_backend<B>(config: PipelineConfig, backend: Arc<B>) -> Self
    where
        B: PipelineStore + EventSource + ScheduleProvider + HistoryProvider + 'static,
    {
        Self::new(
            config,
            backend.clone(),
            backend.clone(),
            backend.clone(),
            backend,
        )
    }

    pub fn with_loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn registry(&self) -> &PredictorRegistry {
        &self.registry
    }

    fn check_season(&self, season_id: &str) -> Result<(), PipelineError> {
        if self.config.is_valid_season(season_id) {
            Ok(())
        } else {
            Err(PipelineError::UnknownSeason(season_id.to_string()))
        }
    }

    /// Names of the predictors a request covers
    fn selected_predictors(&self, filter: Option<&str>) -> Vec<String> {
        match filter {
            Some(name) => vec![name.to_string()],
            None => self.registry.names(),
        }
    }

    pub async fn run_batch(
        &self,
        request: &BatchRequest,
        cancel: &CancelToken,
    ) -> Result<BatchReport, PipelineError> {
        let started_at = Utc::now();
        let season_id = request.season_id.as_str();
        self.check_season(season_id)?;

        let loaded = self
            .registry
            .load_all(self.loader.as_ref(), request.predictor.as_deref())?;
        let model_errors: Vec<ModelFailure> = loaded
            .errors
            .iter()
            .map(|e| ModelFailure {
                predictor: e.predictor().to_string(),
                message: e.to_string(),
            })
            .collect();

        // Phase 1: prefetch
        let season = self
            .schedule
            .get_season(season_id)
            .await?
            .ok_or_else(|| PipelineError::UnknownSeason(season_id.to_string()))?;
        let games = self.schedule.get_games(season_id).await?;
        let teams = self.schedule.get_teams(season_id).await?;
        let history = Arc::new(self.history.get_history(season_id).await?);
        let checkpoint = Arc::new(self.store.load_checkpoint(season_id).await?);

        let mut unit_errors: Vec<UnitError> = Vec::new();
        let mut event_counts: FxHashMap<GameId, usize> = FxHashMap::default();
        let mut units: Vec<(Game, Vec<Event>)> = Vec::with_capacity(games.len());
        for game in &games {
            match self.events.get_events(&game.game_id).await {
                Ok(events) => {
                    event_counts.insert(game.game_id.clone(), events.len());
                    if events.is_empty() {
                        debug!(game_id = %game.game_id, "No events yet, skipping");
                    } else {
                        units.push((game.clone(), events));
                    }
                }
                Err(e) => {
                    warn!(game_id = %game.game_id, error = %e, "Event fetch failed");
                    unit_errors.push(UnitError::game(&game.game_id, UnitStage::Fetch, format!("{:#}", e)));
                }
            }
        }

        info!(
            season_id,
            games = games.len(),
            units = units.len(),
            predictors = loaded.predictors.len(),
            satisfied = checkpoint.len(),
            "Starting batch"
        );

        // Phase 2: units
        let predictors = Arc::new(loaded.predictors.clone());
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut tasks: JoinSet<UnitOutcome> = JoinSet::new();
        let mut cancelled = false;

        for (game, events) in units {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => return Err(PipelineError::Infrastructure(e.into())),
            };
            // A cancel may arrive while waiting for a free worker
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let store = self.store.clone();
            let input = UnitInput {
                game,
                events,
                committed: None,
                season_id: season_id.to_string(),
                history: history.clone(),
                predictors: predictors.clone(),
                checkpoint: checkpoint.clone(),
                engine: self.engine.clone(),
                live_predictions: self.config.live_predictions,
                recompute_features: self.config.recompute_features,
            };

            let unit_game_id = input.game.game_id.clone();
            tasks.spawn(async move {
                let _permit = permit;
                // A panic inside the unit surfaces here as a JoinError
                match tokio::spawn(run_unit(store, input)).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(game_id = %unit_game_id, error = %e, "Unit task aborted");
                        let error = UnitError::game(&unit_game_id, UnitStage::Commit, e);
                        UnitOutcome::failed(unit_game_id, error)
                    }
                }
            });
        }

        let mut written: Vec<PredictionKey> = Vec::new();
        let mut games_processed = 0;
        let mut games_committed = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    if outcome.completed {
                        games_processed += 1;
                    }
                    if outcome.committed {
                        games_committed += 1;
                    }
                    written.extend(outcome.written);
                    unit_errors.extend(outcome.errors);
                    debug!(game_id = %outcome.game_id, "Unit finished");
                }
                Err(e) => error!(error = %e, "Unit task failed to join"),
            }
        }
        written.sort();
        unit_errors.sort_by(|a, b| {
            (a.game_id.as_str(), a.predictor.as_deref(), a.stage)
                .cmp(&(b.game_id.as_str(), b.predictor.as_deref(), b.stage))
        });

        // Phase 3: audit
        let snapshot = self.store.season_snapshot(season_id).await?;
        let audit = run_audit(
            &season,
            &teams,
            &snapshot,
            &event_counts,
            &self.config.audit,
            &self.selected_predictors(request.predictor.as_deref()),
        );
        let gate = PromotionGate::evaluate(&audit);

        // Phase 4: promotion
        let promotion = match gate {
            GateDecision::Open if cancelled => {
                warn!(season_id, "Batch cancelled, promotion skipped");
                None
            }
            GateDecision::Open => Some(
                self.store
                    .promote(season_id, &loaded.promotion_targets())
                    .await?,
            ),
            GateDecision::Blocked { fatal } => {
                warn!(season_id, fatal, "Promotion blocked by audit");
                None
            }
        };

        let report = BatchReport {
            season_id: season_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            cancelled,
            games_total: games.len(),
            games_processed,
            games_committed,
            written,
            unit_errors,
            model_errors,
            audit,
            gate,
            promotion,
        };

        info!(
            season_id,
            processed = report.games_processed,
            committed = report.games_committed,
            written = report.written.len(),
            errors = report.unit_errors.len(),
            exit_code = report.exit_code(),
            "Batch finished"
        );
        Ok(report)
    }

    /// Audit a season's committed data without changing anything
    pub async fn audit_season(&self, season_id: &str) -> Result<AuditReport, PipelineError> {
        self.check_season(season_id)?;

        let season = self
            .schedule
            .get_season(season_id)
            .await?
            .ok_or_else(|| PipelineError::UnknownSeason(season_id.to_string()))?;
        let teams = self.schedule.get_teams(season_id).await?;
        let snapshot = self.store.season_snapshot(season_id).await?;

        let mut event_counts: FxHashMap<GameId, usize> = FxHashMap::default();
        for record in &snapshot.games {
            match self.events.get_events(&record.game.game_id).await {
                Ok(events) => {
                    event_counts.insert(record.game.game_id.clone(), events.len());
                }
                Err(e) => warn!(
                    game_id = %record.game.game_id,
                    error = %e,
                    "Event fetch failed, skipping state count check"
                ),
            }
        }

        Ok(run_audit(
            &season,
            &teams,
            &snapshot,
            &event_counts,
            &self.config.audit,
            &self.selected_predictors(None),
        ))
    }
}

async fn run_unit(store: Arc<dyn PipelineStore>, mut input: UnitInput) -> UnitOutcome {
    let game_id = input.game.game_id.clone();
    let mut outcome = UnitOutcome {
        game_id: game_id.clone(),
        completed: false,
        committed: false,
        written: Vec::new(),
        errors: Vec::new(),
    };

    match store.load_committed_game(&game_id).await {
        Ok(committed) => input.committed = committed,
        Err(e) => {
            outcome
                .errors
                .push(UnitError::game(&game_id, UnitStage::Fetch, format!("{:#}", e)));
            return outcome;
        }
    }

    let plan = match tokio::task::spawn_blocking(move || plan_unit(&input)).await {
        Ok(Ok(plan)) => plan,
        Ok(Err(e)) => {
            warn!(game_id = %game_id, stage = ?e.stage, error = %e.message, "Unit failed");
            outcome.errors.push(e);
            return outcome;
        }
        Err(e) => {
            outcome
                .errors
                .push(UnitError::game(&game_id, UnitStage::Ingestion, e));
            return outcome;
        }
    };
    outcome.errors.extend(plan.errors);

    if let Some(commit) = plan.commit {
        if let Err(e) = store.commit_game(commit).await {
            warn!(game_id = %game_id, error = %e, "Commit failed");
            outcome
                .errors
                .push(UnitError::game(&game_id, UnitStage::Commit, format!("{:#}", e)));
            return outcome;
        }
        outcome.committed = true;
    }

    outcome.completed = true;
    outcome.written = plan.written;
    outcome
}
