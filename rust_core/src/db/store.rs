//! PostgreSQL-backed store and providers.
//!
//! Each game commit runs in one transaction. Promotion runs one
//! transaction per (game, predictor) pair so a failure leaves every pair
//! with exactly one served row or its previous one.

use super::retry::{execute_with_retry, RetryPolicy};
use crate::features::{HistoricalAggregates, TeamGameLine};
use crate::models::{
    AsOf, Event, FeatureVector, Game, GameState, GameStatus, Prediction, PredictionKey, Season,
    Team,
};
use crate::providers::{EventSource, HistoryProvider, ScheduleProvider};
use crate::store::{
    promotion_candidate, Checkpoint, CommittedGame, GameAuditRecord, GameCommit, PipelineStore,
    PredictionCounts, PromotionOutcome, PromotionTarget, SeasonSnapshot,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};
use uuid::Uuid;

/// Final score line stored alongside a commit for history queries
#[derive(Debug, Clone, Copy, PartialEq)]
struct FinalLine {
    home_score: i32,
    away_score: i32,
    home_possessions: f64,
    away_possessions: f64,
}

impl FinalLine {
    fn from_states(states: &[GameState]) -> Option<Self> {
        states
            .iter()
            .rev()
            .find(|s| s.is_final_state)
            .map(|last| Self {
                home_score: last.home.score as i32,
                away_score: last.away.score as i32,
                home_possessions: last.home.possessions(),
                away_possessions: last.away.possessions(),
            })
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn commit_once(&self, commit: &GameCommit) -> Result<()> {
        let game_id = &commit.game.game_id;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO games (game_id, season_id, home_team, away_team, game_date, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (game_id) DO UPDATE SET status = EXCLUDED.status
            "#,
        )
        .bind(game_id)
        .bind(&commit.game.season_id)
        .bind(&commit.game.home_team)
        .bind(&commit.game.away_team)
        .bind(commit.game.game_date)
        .bind(commit.game.status.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM game_states WHERE game_id = $1")
            .bind(game_id)
            .execute(&mut *tx)
            .await?;

        for (position, state) in commit.states.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO game_states (game_id, position, sequence, is_final, flagged, state)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(game_id)
            .bind(position as i32)
            .bind(state.sequence as i64)
            .bind(state.is_final_state)
            .bind(state.is_flagged())
            .bind(Json(state))
            .execute(&mut *tx)
            .await?;
        }

        let line = FinalLine::from_states(&commit.states);
        sqlx::query(
            r#"
            INSERT INTO game_commits (
                game_id, event_count, fingerprint,
                home_score, away_score, home_possessions, away_possessions, committed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (game_id) DO UPDATE SET
                event_count = EXCLUDED.event_count,
                fingerprint = EXCLUDED.fingerprint,
                home_score = EXCLUDED.home_score,
                away_score = EXCLUDED.away_score,
                home_possessions = EXCLUDED.home_possessions,
                away_possessions = EXCLUDED.away_possessions,
                committed_at = EXCLUDED.committed_at
            "#,
        )
        .bind(game_id)
        .bind(commit.event_count as i32)
        .bind(&commit.fingerprint)
        .bind(line.map(|l| l.home_score))
        .bind(line.map(|l| l.away_score))
        .bind(line.map(|l| l.home_possessions))
        .bind(line.map(|l| l.away_possessions))
        .execute(&mut *tx)
        .await?;

        for vector in &commit.features {
            sqlx::query(
                r#"
                INSERT INTO feature_vectors (game_id, as_of, uses_fallback, vector, computed_at)
                VALUES ($1, $2, $3, $4, NOW())
                ON CONFLICT (game_id, as_of) DO UPDATE SET
                    uses_fallback = EXCLUDED.uses_fallback,
                    vector = EXCLUDED.vector,
                    computed_at = EXCLUDED.computed_at
                "#,
            )
            .bind(game_id)
            .bind(vector.as_of.as_key())
            .bind(vector.uses_fallback())
            .bind(Json(vector))
            .execute(&mut *tx)
            .await?;
        }

        // Rows are never updated here; a key already present is left as is
        for prediction in &commit.predictions {
            sqlx::query(
                r#"
                INSERT INTO predictions (
                    prediction_id, game_id, season_id, predictor, model_version, as_of,
                    home_score, away_score, margin, home_win_prob, active, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, FALSE, $11)
                ON CONFLICT (game_id, predictor, model_version, as_of) DO NOTHING
                "#,
            )
            .bind(prediction.prediction_id)
            .bind(&prediction.game_id)
            .bind(&prediction.season_id)
            .bind(&prediction.predictor)
            .bind(&prediction.model_version)
            .bind(prediction.as_of.as_key())
            .bind(prediction.home_score)
            .bind(prediction.away_score)
            .bind(prediction.margin)
            .bind(prediction.home_win_prob)
            .bind(prediction.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Activate `chosen` and deactivate every other row of the pair
    async fn activate_once(&self, game_id: &str, predictor: &str, chosen: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Clear first so the partial unique index never sees two active rows
        sqlx::query(
            r#"
            UPDATE predictions SET active = FALSE
            WHERE game_id = $1 AND predictor = $2 AND active AND prediction_id <> $3
            "#,
        )
        .bind(game_id)
        .bind(predictor)
        .bind(chosen)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE predictions SET active = TRUE WHERE prediction_id = $1")
            .bind(chosen)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn season_predictions(&self, season_id: &str, predictor: &str) -> Result<Vec<Prediction>> {
        let rows = sqlx::query(
            r#"
            SELECT prediction_id, game_id, season_id, predictor, model_version, as_of,
                   home_score, away_score, margin, home_win_prob, active, created_at
            FROM predictions
            WHERE season_id = $1 AND predictor = $2
            ORDER BY game_id, created_at, prediction_id
            "#,
        )
        .bind(season_id)
        .bind(predictor)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(prediction_from_row).collect()
    }
}

fn prediction_from_row(row: &PgRow) -> Result<Prediction> {
    let as_of: String = row.try_get("as_of")?;
    Ok(Prediction {
        prediction_id: row.try_get("prediction_id")?,
        game_id: row.try_get("game_id")?,
        season_id: row.try_get("season_id")?,
        predictor: row.try_get("predictor")?,
        model_version: row.try_get("model_version")?,
        as_of: as_of.parse::<AsOf>().map_err(|e| anyhow!(e))?,
        home_score: row.try_get("home_score")?,
        away_score: row.try_get("away_score")?,
        margin: row.try_get("margin")?,
        home_win_prob: row.try_get("home_win_prob")?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn game_from_row(row: &PgRow) -> Result<Game> {
    let status: String = row.try_get("status")?;
    Ok(Game {
        game_id: row.try_get("game_id")?,
        season_id: row.try_get("season_id")?,
        home_team: row.try_get("home_team")?,
        away_team: row.try_get("away_team")?,
        game_date: row.try_get("game_date")?,
        status: status.parse::<GameStatus>().map_err(|e| anyhow!(e))?,
    })
}

fn count(row: &PgRow, column: &str) -> Result<usize> {
    Ok(row.try_get::<i64, _>(column)?.max(0) as usize)
}

#[async_trait]
impl PipelineStore for PgStore {
    async fn load_checkpoint(&self, season_id: &str) -> Result<Checkpoint> {
        let rows = sqlx::query(
            "SELECT game_id, predictor, model_version, as_of FROM predictions WHERE season_id = $1",
        )
        .bind(season_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load checkpoint")?;

        let keys = rows
            .iter()
            .map(|row| -> Result<PredictionKey> {
                let as_of: String = row.try_get("as_of")?;
                Ok(PredictionKey {
                    game_id: row.try_get("game_id")?,
                    predictor: row.try_get("predictor")?,
                    model_version: row.try_get("model_version")?,
                    as_of: as_of.parse::<AsOf>().map_err(|e| anyhow!(e))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(season_id, keys = keys.len(), "Loaded checkpoint");
        Ok(Checkpoint::from_keys(keys))
    }

    async fn load_committed_game(&self, game_id: &str) -> Result<Option<CommittedGame>> {
        let row = sqlx::query(
            r#"
            SELECT g.status, c.event_count, c.fingerprint,
                   (SELECT COUNT(*) FROM game_states s WHERE s.game_id = g.game_id) AS state_count
            FROM games g
            JOIN game_commits c ON c.game_id = g.game_id
            WHERE g.game_id = $1
            "#,
        )
        .bind(game_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let final_features = sqlx::query(
            "SELECT vector FROM feature_vectors WHERE game_id = $1 AND as_of = $2",
        )
        .bind(game_id)
        .bind(AsOf::Final.as_key())
        .fetch_optional(&self.pool)
        .await?
        .map(|r| r.try_get::<Json<FeatureVector>, _>("vector").map(|j| j.0))
        .transpose()?;

        let status: String = row.try_get("status")?;
        Ok(Some(CommittedGame {
            game_id: game_id.to_string(),
            status: status.parse::<GameStatus>().map_err(|e| anyhow!(e))?,
            event_count: row.try_get::<i32, _>("event_count")?.max(0) as usize,
            state_count: count(&row, "state_count")?,
            fingerprint: row.try_get("fingerprint")?,
            final_features,
        }))
    }

    async fn commit_game(&self, commit: GameCommit) -> Result<()> {
        let label = format!("commit {}", commit.game.game_id);
        execute_with_retry(self.retry, &label, || self.commit_once(&commit))
            .await
            .with_context(|| format!("Failed to commit game {}", commit.game.game_id))?;

        debug!(
            game_id = %commit.game.game_id,
            states = commit.states.len(),
            predictions = commit.predictions.len(),
            "Committed game"
        );
        Ok(())
    }

    async fn promote(
        &self,
        season_id: &str,
        targets: &[PromotionTarget],
    ) -> Result<PromotionOutcome> {
        let mut outcome = PromotionOutcome::default();

        for target in targets {
            let rows = self.season_predictions(season_id, &target.predictor).await?;

            let mut by_game: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
            for (idx, row) in rows.iter().enumerate() {
                by_game.entry(row.game_id.as_str()).or_default().push(idx);
            }

            for (game_id, indices) in by_game {
                let Some(chosen) = promotion_candidate(
                    indices.iter().map(|idx| (*idx, &rows[*idx])),
                    &target.version,
                ) else {
                    continue;
                };

                if indices.iter().all(|idx| rows[*idx].active == (*idx == chosen)) {
                    outcome.unchanged += 1;
                    continue;
                }

                let chosen_id = rows[chosen].prediction_id;
                let label = format!("promote {} {}", game_id, target.predictor);
                execute_with_retry(self.retry, &label, || {
                    self.activate_once(game_id, &target.predictor, chosen_id)
                })
                .await?;
                outcome.activated += 1;
            }
        }

        info!(
            season_id,
            activated = outcome.activated,
            unchanged = outcome.unchanged,
            "Promotion applied"
        );
        Ok(outcome)
    }

    async fn season_snapshot(&self, season_id: &str) -> Result<SeasonSnapshot> {
        let games = self.get_games(season_id).await?;

        let state_rows = sqlx::query(
            r#"
            SELECT s.game_id,
                   COUNT(*) AS state_count,
                   COUNT(*) FILTER (WHERE s.is_final) AS final_count,
                   COUNT(*) FILTER (WHERE s.flagged) AS flagged_count
            FROM game_states s
            JOIN games g ON g.game_id = s.game_id
            WHERE g.season_id = $1
            GROUP BY s.game_id
            "#,
        )
        .bind(season_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts: FxHashMap<String, (usize, usize, usize)> = FxHashMap::default();
        for row in &state_rows {
            counts.insert(
                row.try_get("game_id")?,
                (
                    count(row, "state_count")?,
                    count(row, "final_count")?,
                    count(row, "flagged_count")?,
                ),
            );
        }

        let feature_rows = sqlx::query(
            r#"
            SELECT f.game_id, f.vector
            FROM feature_vectors f
            JOIN games g ON g.game_id = f.game_id
            WHERE g.season_id = $1 AND f.as_of = $2
            "#,
        )
        .bind(season_id)
        .bind(AsOf::Final.as_key())
        .fetch_all(&self.pool)
        .await?;

        let mut final_features: FxHashMap<String, FeatureVector> = FxHashMap::default();
        for row in &feature_rows {
            let vector: Json<FeatureVector> = row.try_get("vector")?;
            final_features.insert(row.try_get("game_id")?, vector.0);
        }

        let predictor_rows = sqlx::query(
            "SELECT DISTINCT game_id, predictor FROM predictions WHERE season_id = $1",
        )
        .bind(season_id)
        .fetch_all(&self.pool)
        .await?;

        let mut predictors: FxHashMap<String, BTreeSet<String>> = FxHashMap::default();
        for row in &predictor_rows {
            predictors
                .entry(row.try_get("game_id")?)
                .or_default()
                .insert(row.try_get("predictor")?);
        }

        let games = games
            .into_iter()
            .map(|game| {
                let (state_count, final_state_count, flagged_state_count) =
                    counts.get(&game.game_id).copied().unwrap_or_default();
                GameAuditRecord {
                    final_features: final_features.remove(&game.game_id),
                    predictors: predictors.remove(&game.game_id).unwrap_or_default(),
                    game,
                    state_count,
                    final_state_count,
                    flagged_state_count,
                }
            })
            .collect();

        let count_rows = sqlx::query(
            r#"
            SELECT predictor,
                   COUNT(*) AS row_count,
                   COUNT(*) FILTER (WHERE active) AS active_count,
                   COUNT(DISTINCT game_id) AS game_count
            FROM predictions
            WHERE season_id = $1
            GROUP BY predictor
            "#,
        )
        .bind(season_id)
        .fetch_all(&self.pool)
        .await?;

        let mut predictions: BTreeMap<String, PredictionCounts> = BTreeMap::new();
        for row in &count_rows {
            predictions.insert(
                row.try_get("predictor")?,
                PredictionCounts {
                    rows: count(row, "row_count")?,
                    active: count(row, "active_count")?,
                    games: count(row, "game_count")?,
                },
            );
        }

        Ok(SeasonSnapshot {
            season_id: season_id.to_string(),
            games,
            predictions,
        })
    }

    async fn predictions_for_game(&self, game_id: &str) -> Result<Vec<Prediction>> {
        let rows = sqlx::query(
            r#"
            SELECT prediction_id, game_id, season_id, predictor, model_version, as_of,
                   home_score, away_score, margin, home_win_prob, active, created_at
            FROM predictions
            WHERE game_id = $1
            ORDER BY created_at, prediction_id
            "#,
        )
        .bind(game_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(prediction_from_row).collect()
    }
}

#[async_trait]
impl EventSource for PgStore {
    async fn get_events(&self, game_id: &str) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            r#"
            SELECT game_id, sequence, period, clock_seconds, event_type, team_id, player_id, payload
            FROM events
            WHERE game_id = $1
            ORDER BY event_id
            "#,
        )
        .bind(game_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to fetch events for {}", game_id))?;

        rows.iter()
            .map(|row| -> Result<Event> {
                Ok(Event {
                    game_id: row.try_get("game_id")?,
                    sequence: row.try_get::<i64, _>("sequence")? as u64,
                    period: row.try_get::<i16, _>("period")?.clamp(0, u8::MAX as i16) as u8,
                    clock_seconds: row.try_get::<i32, _>("clock_seconds")?.max(0) as u32,
                    event_type: row.try_get("event_type")?,
                    team_id: row.try_get("team_id")?,
                    player_id: row.try_get("player_id")?,
                    payload: row.try_get("payload")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ScheduleProvider for PgStore {
    async fn get_season(&self, season_id: &str) -> Result<Option<Season>> {
        let row = sqlx::query("SELECT season_id, start_date, end_date FROM seasons WHERE season_id = $1")
            .bind(season_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<Season> {
            Ok(Season {
                season_id: row.try_get("season_id")?,
                start_date: row.try_get("start_date")?,
                end_date: row.try_get("end_date")?,
            })
        })
        .transpose()
    }

    async fn get_games(&self, season_id: &str) -> Result<Vec<Game>> {
        let rows = sqlx::query(
            r#"
            SELECT game_id, season_id, home_team, away_team, game_date, status
            FROM games
            WHERE season_id = $1
            ORDER BY game_date, game_id
            "#,
        )
        .bind(season_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(game_from_row).collect()
    }

    async fn get_teams(&self, season_id: &str) -> Result<Vec<Team>> {
        let rows = sqlx::query(
            "SELECT team_id, abbreviation, name FROM teams WHERE season_id = $1 ORDER BY team_id",
        )
        .bind(season_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Team> {
                Ok(Team {
                    team_id: row.try_get("team_id")?,
                    abbreviation: row.try_get("abbreviation")?,
                    name: row.try_get("name")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl HistoryProvider for PgStore {
    async fn get_history(&self, season_id: &str) -> Result<HistoricalAggregates> {
        let rows = sqlx::query(
            r#"
            SELECT g.game_id, g.game_date, g.home_team, g.away_team,
                   c.home_score, c.away_score, c.home_possessions, c.away_possessions
            FROM games g
            JOIN game_commits c ON c.game_id = g.game_id
            JOIN seasons s ON s.season_id = g.season_id
            WHERE s.start_date <= (SELECT start_date FROM seasons WHERE season_id = $1)
              AND c.home_score IS NOT NULL
            ORDER BY g.game_date, g.game_id
            "#,
        )
        .bind(season_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load team history")?;

        let mut history = HistoricalAggregates::new(season_id);
        for row in &rows {
            let game_id: String = row.try_get("game_id")?;
            let game_date = row.try_get("game_date")?;
            let home_score = row.try_get::<i32, _>("home_score")?.clamp(0, u16::MAX as i32) as u16;
            let away_score = row.try_get::<i32, _>("away_score")?.clamp(0, u16::MAX as i32) as u16;
            let sides = [
                (
                    row.try_get::<String, _>("home_team")?,
                    home_score,
                    away_score,
                    row.try_get::<Option<f64>, _>("home_possessions")?,
                ),
                (
                    row.try_get::<String, _>("away_team")?,
                    away_score,
                    home_score,
                    row.try_get::<Option<f64>, _>("away_possessions")?,
                ),
            ];
            for (team, points_for, points_against, possessions) in sides {
                history.push(
                    team,
                    TeamGameLine {
                        game_id: game_id.clone(),
                        game_date,
                        points_for,
                        points_against,
                        possessions: possessions.unwrap_or(0.0),
                    },
                );
            }
        }

        debug!(season_id, games = rows.len(), "Loaded history");
        Ok(history)
    }
}
