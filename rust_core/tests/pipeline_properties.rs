//! Integration tests for season update batches
//!
//! Every test runs the full orchestrator against the in-memory backend.

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use hoopcast_core::audit::AuditCheck;
use hoopcast_core::config::PredictorConfig;
use hoopcast_core::error::{FeatureError, ModelLoadError, PipelineError};
use hoopcast_core::features::{HistoricalAggregates, TeamGameLine};
use hoopcast_core::models::{
    AsOf, Event, FallbackReason, FeatureVector, Game, GameStatus, Prediction, Season, Team,
};
use hoopcast_core::orchestrator::{BatchReport, BatchRequest, CancelToken, UnitStage};
use hoopcast_core::predictors::{
    FileModelLoader, ModelLoader, Predictor, PredictorKind, PredictorOutput,
};
use hoopcast_core::store::{
    Checkpoint, CommittedGame, GameCommit, PipelineStore, PromotionOutcome, PromotionTarget,
    SeasonSnapshot,
};
use hoopcast_core::{GateDecision, MemoryStore, PipelineConfig, UpdateOrchestrator};
use serde_json::{json, Value};
use std::sync::Arc;

const SEASON: &str = "2024-2025";
const PRIOR_SEASON: &str = "2023-2024";

// ============================================================================
// Fixtures
// ============================================================================

fn nov(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 11, day).unwrap()
}

fn game(id: &str, home: &str, away: &str, day: u32) -> Game {
    Game {
        game_id: id.to_string(),
        season_id: SEASON.to_string(),
        home_team: home.to_string(),
        away_team: away.to_string(),
        game_date: nov(day),
        status: GameStatus::Scheduled,
    }
}

/// Play-by-play with quarter breaks every 112 events; a finished log ends
/// with a game-end event at sequence `n`.
fn game_log(game: &Game, n: u64, finished: bool) -> Vec<Event> {
    const PER_QUARTER: u64 = 112;
    (1..=n)
        .map(|seq| {
            let quarter = ((seq - 1) / PER_QUARTER + 1).min(4) as u8;
            let clock = 720 - (((seq - 1) % PER_QUARTER) * 700 / PER_QUARTER) as u32;
            if finished && seq == n {
                return Event::new(&game.game_id, seq, 4, 0, "game_end", None, Value::Null);
            }
            if seq % PER_QUARTER == 0 && seq / PER_QUARTER < 4 {
                return Event::new(&game.game_id, seq, quarter, 0, "period_boundary", None, Value::Null);
            }
            let (kind, team, payload) = match seq % 5 {
                0 => ("shot", &game.home_team, json!({"made": true, "points": 2})),
                1 => ("shot", &game.away_team, json!({"made": true, "points": 3})),
                2 => ("shot", &game.home_team, json!({"made": false, "points": 2})),
                3 => ("rebound", &game.away_team, json!({"offensive": false})),
                _ => ("free_throw", &game.home_team, json!({"made": true})),
            };
            Event::new(&game.game_id, seq, quarter, clock, kind, Some(team.as_str()), payload)
        })
        .collect()
}

fn seed(store: &MemoryStore, games: &[(Game, Vec<Event>)]) {
    seed_season(
        store,
        Season {
            season_id: SEASON.to_string(),
            start_date: NaiveDate::from_ymd_opt(2024, 10, 22).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2025, 6, 30).unwrap(),
        },
        games,
    );
}

fn seed_season(store: &MemoryStore, season: Season, games: &[(Game, Vec<Event>)]) {
    let season_id = season.season_id.clone();
    store.insert_season(season);

    let mut team_ids: Vec<String> = games
        .iter()
        .flat_map(|(g, _)| [g.home_team.clone(), g.away_team.clone()])
        .collect();
    team_ids.sort();
    team_ids.dedup();
    store.insert_teams(
        &season_id,
        team_ids
            .into_iter()
            .map(|id| Team {
                abbreviation: id.clone(),
                name: format!("{} basketball", id),
                team_id: id,
            })
            .collect(),
    );

    for (g, events) in games {
        store.insert_game(g.clone());
        store.insert_events(&g.game_id, events.clone());
    }
}

fn baseline(version: &str) -> Value {
    json!({"name": "Baseline", "kind": "baseline", "version": version})
}

fn config(predictors: Vec<Value>) -> PipelineConfig {
    serde_json::from_value(json!({
        "valid_seasons": [SEASON],
        "predictors": predictors,
        "max_workers": 2
    }))
    .unwrap()
}

/// Predictor that refuses league-prior inputs
struct StrictPredictor {
    version: String,
    schema: Vec<String>,
}

impl Predictor for StrictPredictor {
    fn name(&self) -> &str {
        "Strict"
    }

    fn kind(&self) -> PredictorKind {
        PredictorKind::Linear
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn schema(&self) -> &[String] {
        &self.schema
    }

    fn allow_fallback(&self) -> bool {
        false
    }

    fn predict(&self, features: &FeatureVector) -> Result<PredictorOutput, FeatureError> {
        let inputs = features.select(&self.schema, self.allow_fallback())?;
        Ok(PredictorOutput {
            home_score: inputs[0],
            away_score: inputs[1],
            margin: inputs[0] - inputs[1],
            home_win_prob: 0.5,
        })
    }
}

struct TestLoader;

impl ModelLoader for TestLoader {
    fn load(&self, config: &PredictorConfig) -> Result<Arc<dyn Predictor>, ModelLoadError> {
        if config.name == "Strict" {
            return Ok(Arc::new(StrictPredictor {
                version: config.version.clone(),
                schema: vec!["home_ppg".to_string(), "away_ppg".to_string()],
            }));
        }
        FileModelLoader::new().load(config)
    }
}

fn orchestrator(store: &Arc<MemoryStore>, config: PipelineConfig) -> UpdateOrchestrator {
    UpdateOrchestrator::with_backend(config, store.clone()).with_loader(Arc::new(TestLoader))
}

async fn run(store: &Arc<MemoryStore>, config: PipelineConfig) -> BatchReport {
    orchestrator(store, config)
        .run_batch(&BatchRequest::season(SEASON), &CancelToken::new())
        .await
        .unwrap()
}

/// Six October games of history for each team
fn preseason_history(teams: &[&str]) -> HistoricalAggregates {
    let mut history = HistoricalAggregates::new(SEASON);
    for day in 1..=6 {
        for (i, team) in teams.iter().enumerate() {
            history.push(
                *team,
                TeamGameLine {
                    game_id: format!("pre-{}-{}", team, day),
                    game_date: NaiveDate::from_ymd_opt(2024, 10, day).unwrap(),
                    points_for: 100 + 4 * i as u16 + day as u16,
                    points_against: 108,
                    possessions: 97.5,
                },
            );
        }
    }
    history
}

/// Six finished BOS-NYK games in January of the previous season
fn seed_prior_season(store: &MemoryStore) {
    let games: Vec<(Game, Vec<Event>)> = (1..=6)
        .map(|day| {
            let g = Game {
                game_id: format!("old-{}", day),
                season_id: PRIOR_SEASON.to_string(),
                home_team: "BOS".to_string(),
                away_team: "NYK".to_string(),
                game_date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
                status: GameStatus::Scheduled,
            };
            let events = game_log(&g, 450, true);
            (g, events)
        })
        .collect();
    seed_season(
        store,
        Season {
            season_id: PRIOR_SEASON.to_string(),
            start_date: NaiveDate::from_ymd_opt(2023, 10, 24).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
        },
        &games,
    );
}

fn two_season_config() -> PipelineConfig {
    let mut config = config(vec![baseline("v1")]);
    config.valid_seasons.push(PRIOR_SEASON.to_string());
    config
}

fn single_final_game(id: &str) -> (Game, Vec<Event>) {
    let g = game(id, "BOS", "NYK", 1);
    let events = game_log(&g, 450, true);
    (g, events)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_450_event_game_end_to_end() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, &[single_final_game("g1")]);

    let report = run(&store, config(vec![baseline("v1")])).await;

    let states = store.states("g1");
    assert_eq!(states.len(), 450);
    let last = states.last().unwrap();
    assert!(last.is_final_state);
    assert_eq!(last.margin, last.home.score as i32 - last.away.score as i32);
    assert_eq!(store.game("g1").unwrap().status, GameStatus::Final);

    assert_eq!(report.audit.fatal_count(), 0);
    assert_eq!(report.gate, GateDecision::Open);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.written.len(), 1);
    assert_eq!(report.promotion.unwrap().activated, 1);

    let rows = store.predictions_for_game("g1").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].active);
    assert_eq!(rows[0].as_of, AsOf::Final);
    assert!((rows[0].margin - (rows[0].home_score - rows[0].away_score)).abs() < 1e-9);
}

#[tokio::test]
async fn test_missing_history_is_recorded_as_warning() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, &[single_final_game("g1")]);

    let report = run(&store, config(vec![baseline("v1")])).await;

    let vector = store.feature_vector("g1", AsOf::Final).unwrap();
    assert_eq!(vector.fallbacks.len(), 2);
    assert!(vector
        .fallbacks
        .iter()
        .all(|f| f.reason == FallbackReason::NoHistory));

    let fallback: Vec<_> = report.audit.by_check(AuditCheck::FeatureFallback).collect();
    assert!(fallback.iter().any(|v| v.team_id.as_deref() == Some("BOS")));
    assert!(fallback.iter().any(|v| v.team_id.as_deref() == Some("NYK")));
    assert!(report.audit.warning_count() >= 2);
    assert!(!report.audit.has_fatal());
}

#[tokio::test]
async fn test_history_replaces_prior() {
    let store = Arc::new(MemoryStore::new());
    let g = game("g9", "BOS", "NYK", 20);
    let events = game_log(&g, 450, true);
    seed(&store, &[(g, events)]);

    let mut history = HistoricalAggregates::new(SEASON);
    for day in 1..=6 {
        for (team, points_for) in [("BOS", 118), ("NYK", 104)] {
            history.push(
                team,
                TeamGameLine {
                    game_id: format!("past-{}-{}", team, day),
                    game_date: nov(day),
                    points_for,
                    points_against: 110,
                    possessions: 98.0,
                },
            );
        }
    }
    store.set_history(history);

    run(&store, config(vec![baseline("v1")])).await;

    let vector = store.feature_vector("g9", AsOf::Final).unwrap();
    assert!(!vector.uses_fallback());
    assert_eq!(vector.get("home_ppg"), Some(118.0));
    assert_eq!(vector.get("away_ppg"), Some(104.0));
}

#[tokio::test]
async fn test_states_match_events_in_sequence_order() {
    let store = Arc::new(MemoryStore::new());
    let (g, events) = single_final_game("g1");
    let live = game("g2", "LAL", "GSW", 1);
    let live_events = game_log(&live, 137, false);
    seed(&store, &[(g, events.clone()), (live, live_events.clone())]);

    run(&store, config(vec![baseline("v1")])).await;

    for (game_id, events) in [("g1", &events), ("g2", &live_events)] {
        let states = store.states(game_id);
        assert_eq!(states.len(), events.len());
        let sequences: Vec<u64> = states.iter().map(|s| s.sequence).collect();
        let expected: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, expected);
    }
    assert_eq!(store.game("g2").unwrap().status, GameStatus::InProgress);
}

#[tokio::test]
async fn test_rerun_is_a_no_op() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, &[single_final_game("g1")]);

    run(&store, config(vec![baseline("v1")])).await;
    let states_before = store.states("g1");
    let rows_before = store.predictions_for_game("g1").await.unwrap();

    let second = run(&store, config(vec![baseline("v1")])).await;

    assert!(second.written.is_empty());
    assert_eq!(second.games_committed, 0);
    assert_eq!(second.games_processed, 1);
    assert_eq!(second.promotion.unwrap().unchanged, 1);
    assert_eq!(store.states("g1"), states_before);
    assert_eq!(store.predictions_for_game("g1").await.unwrap(), rows_before);
}

#[tokio::test]
async fn test_failures_stay_inside_their_game() {
    let store = Arc::new(MemoryStore::new());
    let healthy = single_final_game("g1");

    let gapped_game = game("g2", "LAL", "GSW", 2);
    let mut gapped = game_log(&gapped_game, 450, true);
    gapped.remove(9);

    let rejected_game = game("g3", "NYK", "BOS", 3);
    let rejected = game_log(&rejected_game, 450, true);

    seed(
        &store,
        &[healthy, (gapped_game, gapped), (rejected_game, rejected)],
    );
    store.fail_commits_for("g3");

    let report = run(&store, config(vec![baseline("v1")])).await;

    let g2: Vec<_> = report.errors_for_game("g2").collect();
    assert_eq!(g2.len(), 1);
    assert_eq!(g2[0].stage, UnitStage::Ingestion);
    let g3: Vec<_> = report.errors_for_game("g3").collect();
    assert_eq!(g3.len(), 1);
    assert_eq!(g3[0].stage, UnitStage::Commit);

    assert_eq!(store.states("g1").len(), 450);
    assert!(store.states("g2").is_empty());
    assert!(store.states("g3").is_empty());
    assert_eq!(store.game("g3").unwrap().status, GameStatus::Scheduled);

    // Unprocessed games only warn, so the healthy game is still promoted
    assert!(!report.audit.has_fatal());
    assert_eq!(report.gate, GateDecision::Open);
    let rows = store.predictions_for_game("g1").await.unwrap();
    assert!(rows.iter().any(|p| p.active));
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_predictors_fail_independently() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, &[single_final_game("g1")]);

    let report = run(
        &store,
        config(vec![
            baseline("v1"),
            json!({"name": "Strict", "kind": "linear", "version": "s1"}),
            json!({"name": "Linear", "kind": "linear", "version": "l1"}),
        ]),
    )
    .await;

    // Linear has no artifact and never loads
    assert_eq!(report.model_errors.len(), 1);
    assert_eq!(report.model_errors[0].predictor, "Linear");

    // Strict loads but rejects the league-prior features of this game
    let errors: Vec<_> = report.errors_for_game("g1").collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].predictor.as_deref(), Some("Strict"));
    assert_eq!(errors[0].stage, UnitStage::Predict);

    let rows = store.predictions_for_game("g1").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].predictor, "Baseline");
    assert!(rows[0].active);

    assert!(report
        .audit
        .by_check(AuditCheck::MissingPredictions)
        .any(|v| v.message.contains("Strict")));
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_new_version_appends_and_takes_over() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, &[single_final_game("g1")]);

    run(&store, config(vec![baseline("v1")])).await;
    let v1_row = store.predictions_for_game("g1").await.unwrap().remove(0);

    let report = run(&store, config(vec![baseline("v2")])).await;
    assert_eq!(report.written.len(), 1);
    assert_eq!(report.written[0].model_version, "v2");

    let rows = store.predictions_for_game("g1").await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows.iter().filter(|p| p.active).count(), 1);
    assert!(rows.iter().any(|p| p.active && p.model_version == "v2"));

    let counts = report.audit.stats.predictions["Baseline"];
    assert_eq!((counts.rows, counts.active, counts.games), (2, 1, 1));
    assert_eq!(report.audit.stats.games_by_status.get("final"), Some(&1));
    assert_eq!(report.audit.stats.game_days, 1);

    let kept = rows.iter().find(|p| p.model_version == "v1").unwrap();
    assert_eq!(kept.prediction_id, v1_row.prediction_id);
    assert_eq!(kept.home_score, v1_row.home_score);
    assert!(!kept.active);
}

#[tokio::test]
async fn test_truncated_states_block_promotion() {
    let store = Arc::new(MemoryStore::new());
    let broken = single_final_game("g1");
    let other_game = game("g2", "LAL", "GSW", 2);
    let other_events = game_log(&other_game, 450, true);
    seed(&store, &[broken, (other_game, other_events)]);

    run(&store, config(vec![baseline("v1")])).await;

    let mut states = store.states("g1");
    states.pop();
    store.overwrite_states("g1", states);
    store.fail_commits_for("g1");

    let audit = orchestrator(&store, config(vec![baseline("v1")]))
        .audit_season(SEASON)
        .await
        .unwrap();
    assert!(audit.has_fatal());

    let report = run(&store, config(vec![baseline("v2")])).await;

    let mismatch: Vec<_> = report.audit.by_check(AuditCheck::StateCount).collect();
    assert!(mismatch
        .iter()
        .any(|v| v.game_id.as_deref() == Some("g1")
            && v.message.contains("450 events but 449 committed states")));
    assert_eq!(report.gate, GateDecision::Blocked { fatal: 2 });
    assert!(report.promotion.is_none());
    assert_eq!(report.exit_code(), 2);

    // g2 got its v2 row, but it waits behind the gate
    let rows = store.predictions_for_game("g2").await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().any(|p| p.active && p.model_version == "v1"));
    assert!(rows.iter().any(|p| !p.active && p.model_version == "v2"));
}

#[tokio::test]
async fn test_cancelled_batch_schedules_nothing_new() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, &[single_final_game("g1")]);

    run(&store, config(vec![baseline("v1")])).await;

    let cancel = CancelToken::new();
    cancel.cancel();
    let report = orchestrator(&store, config(vec![baseline("v2")]))
        .run_batch(&BatchRequest::season(SEASON), &cancel)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.games_processed, 0);
    assert!(report.written.is_empty());
    assert!(report.promotion.is_none());
    assert_eq!(report.exit_code(), 1);

    // Work committed before the cancel is untouched
    assert_eq!(store.states("g1").len(), 450);
    let rows = store.predictions_for_game("g1").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].active);
}

#[tokio::test]
async fn test_live_game_predicted_then_finalized() {
    let store = Arc::new(MemoryStore::new());
    let g = game("g1", "BOS", "NYK", 1);
    let full = game_log(&g, 450, true);
    seed(&store, &[(g, full[..200].to_vec())]);

    let mut live_config = config(vec![baseline("v1")]);
    live_config.live_predictions = true;

    let first = run(&store, live_config.clone()).await;
    assert_eq!(first.written.len(), 1);
    assert_eq!(first.written[0].as_of, AsOf::Event(200));
    assert_eq!(store.game("g1").unwrap().status, GameStatus::InProgress);

    store.append_events("g1", full[200..].to_vec());
    let second = run(&store, live_config).await;
    assert_eq!(second.written.len(), 1);
    assert_eq!(second.written[0].as_of, AsOf::Final);

    let rows = store.predictions_for_game("g1").await.unwrap();
    assert_eq!(rows.len(), 2);
    let active: Vec<_> = rows.iter().filter(|p| p.active).collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].as_of, AsOf::Final);
}

#[tokio::test]
async fn test_live_game_without_live_predictions_only_commits_states() {
    let store = Arc::new(MemoryStore::new());
    let g = game("g1", "BOS", "NYK", 1);
    let events = game_log(&g, 120, false);
    seed(&store, &[(g, events)]);

    let report = run(&store, config(vec![baseline("v1")])).await;

    assert!(report.written.is_empty());
    assert_eq!(report.games_committed, 1);
    assert_eq!(store.states("g1").len(), 120);
    assert!(store.predictions_for_game("g1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_season_and_predictor_are_rejected() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, &[single_final_game("g1")]);
    let orchestrator = orchestrator(&store, config(vec![baseline("v1")]));

    let season = orchestrator
        .run_batch(&BatchRequest::season("1999-2000"), &CancelToken::new())
        .await;
    assert!(matches!(season, Err(PipelineError::UnknownSeason(s)) if s == "1999-2000"));

    let predictor = orchestrator
        .run_batch(
            &BatchRequest::season(SEASON).with_predictor("Elo"),
            &CancelToken::new(),
        )
        .await;
    assert!(matches!(predictor, Err(PipelineError::UnknownPredictor(p)) if p == "Elo"));
}

#[tokio::test]
async fn test_prior_season_history_feeds_new_season() {
    let store = Arc::new(MemoryStore::new());
    seed_prior_season(&store);
    let games: Vec<_> = (0..6)
        .map(|i| {
            let g = game(&format!("new-{}", i), "BOS", "NYK", i + 1);
            let events = game_log(&g, 450, true);
            (g, events)
        })
        .collect();
    seed(&store, &games);

    let prior = orchestrator(&store, two_season_config())
        .run_batch(&BatchRequest::season(PRIOR_SEASON), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(prior.games_committed, 6);

    let report = run(&store, two_season_config()).await;

    for (g, _) in &games {
        let vector = store.feature_vector(&g.game_id, AsOf::Final).unwrap();
        assert!(vector.fallbacks.is_empty(), "{} fell back: {:?}", g.game_id, vector.fallbacks);
    }
    assert_eq!(report.audit.by_check(AuditCheck::FeatureFallback).count(), 0);

    // Only prior-season games count for the first game of the season
    let first = store.feature_vector("new-0", AsOf::Final).unwrap();
    let last_old = store.states("old-1");
    let bos_points = last_old.last().unwrap().home.score as f64;
    assert_eq!(first.get("home_ppg"), Some(bos_points));
}

#[tokio::test]
async fn test_fallback_vectors_refresh_when_history_arrives() {
    let store = Arc::new(MemoryStore::new());
    seed_prior_season(&store);
    seed(&store, &[single_final_game("g1")]);

    run(&store, two_season_config()).await;
    let before = store.feature_vector("g1", AsOf::Final).unwrap();
    assert_eq!(before.fallbacks.len(), 2);
    let rows_before = store.predictions_for_game("g1").await.unwrap();

    orchestrator(&store, two_season_config())
        .run_batch(&BatchRequest::season(PRIOR_SEASON), &CancelToken::new())
        .await
        .unwrap();

    let report = run(&store, two_season_config()).await;
    let after = store.feature_vector("g1", AsOf::Final).unwrap();
    assert!(!after.uses_fallback());
    assert_eq!(report.games_committed, 1);
    assert!(report.written.is_empty());
    assert_eq!(report.audit.by_check(AuditCheck::FeatureFallback).count(), 0);

    // Stored predictions are never rewritten
    assert_eq!(store.predictions_for_game("g1").await.unwrap(), rows_before);
}

/// Store whose commit for one game panics
struct CrashingStore {
    inner: Arc<MemoryStore>,
    crash_on: &'static str,
}

#[async_trait]
impl PipelineStore for CrashingStore {
    async fn load_checkpoint(&self, season_id: &str) -> Result<Checkpoint> {
        self.inner.load_checkpoint(season_id).await
    }

    async fn load_committed_game(&self, game_id: &str) -> Result<Option<CommittedGame>> {
        self.inner.load_committed_game(game_id).await
    }

    async fn commit_game(&self, commit: GameCommit) -> Result<()> {
        if commit.game.game_id == self.crash_on {
            panic!("storage driver crashed");
        }
        self.inner.commit_game(commit).await
    }

    async fn promote(
        &self,
        season_id: &str,
        targets: &[PromotionTarget],
    ) -> Result<PromotionOutcome> {
        self.inner.promote(season_id, targets).await
    }

    async fn season_snapshot(&self, season_id: &str) -> Result<SeasonSnapshot> {
        self.inner.season_snapshot(season_id).await
    }

    async fn predictions_for_game(&self, game_id: &str) -> Result<Vec<Prediction>> {
        self.inner.predictions_for_game(game_id).await
    }
}

#[tokio::test]
async fn test_panicking_unit_is_charged_to_its_game() {
    let store = Arc::new(MemoryStore::new());
    let other = game("g2", "LAL", "GSW", 2);
    let other_events = game_log(&other, 450, true);
    seed(&store, &[single_final_game("g1"), (other, other_events)]);

    let crashing = Arc::new(CrashingStore {
        inner: store.clone(),
        crash_on: "g2",
    });
    let report = UpdateOrchestrator::new(
        config(vec![baseline("v1")]),
        crashing,
        store.clone(),
        store.clone(),
        store.clone(),
    )
    .with_loader(Arc::new(TestLoader))
    .run_batch(&BatchRequest::season(SEASON), &CancelToken::new())
    .await
    .unwrap();

    let errors: Vec<_> = report.errors_for_game("g2").collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].stage, UnitStage::Commit);
    assert!(errors[0].message.contains("panic"), "{}", errors[0].message);
    assert_eq!(report.games_total, 2);
    assert_eq!(report.games_processed, 1);
    assert_eq!(report.exit_code(), 1);

    assert_eq!(store.states("g1").len(), 450);
    assert!(store.states("g2").is_empty());
}

#[tokio::test]
async fn test_removing_a_predictor_leaves_others_unchanged() {
    let other = game("g2", "LAL", "GSW", 2);
    let other_events = game_log(&other, 450, true);
    let games = [single_final_game("g1"), (other, other_events)];
    let history = preseason_history(&["BOS", "NYK", "LAL", "GSW"]);

    let both = Arc::new(MemoryStore::new());
    seed(&both, &games);
    both.set_history(history.clone());
    let report = run(
        &both,
        config(vec![
            baseline("v1"),
            json!({"name": "Strict", "kind": "linear", "version": "s1"}),
        ]),
    )
    .await;
    assert!(report.unit_errors.is_empty(), "{:?}", report.unit_errors);
    assert_eq!(report.written.len(), 4);

    let baseline_only = Arc::new(MemoryStore::new());
    seed(&baseline_only, &games);
    baseline_only.set_history(history);
    run(&baseline_only, config(vec![baseline("v1")])).await;

    for game_id in ["g1", "g2"] {
        let with_strict: Vec<_> = both
            .predictions_for_game(game_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|p| p.predictor == "Baseline")
            .collect();
        let alone = baseline_only.predictions_for_game(game_id).await.unwrap();
        assert_eq!(with_strict.len(), 1);
        assert_eq!(alone.len(), 1);

        let (a, b) = (&with_strict[0], &alone[0]);
        assert_eq!(a.model_version, b.model_version);
        assert_eq!(a.as_of, b.as_of);
        assert_eq!(a.active, b.active);
        assert_eq!(a.home_score.to_bits(), b.home_score.to_bits());
        assert_eq!(a.away_score.to_bits(), b.away_score.to_bits());
        assert_eq!(a.margin.to_bits(), b.margin.to_bits());
        assert_eq!(a.home_win_prob.to_bits(), b.home_win_prob.to_bits());

        assert_eq!(
            both.feature_vector(game_id, AsOf::Final),
            baseline_only.feature_vector(game_id, AsOf::Final)
        );
    }
}
