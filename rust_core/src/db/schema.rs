//! Table definitions, applied with `CREATE ... IF NOT EXISTS`

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::info;

/// Statements run in order by [`bootstrap`]
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS seasons (
        season_id   TEXT PRIMARY KEY,
        start_date  DATE NOT NULL,
        end_date    DATE NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS teams (
        season_id     TEXT NOT NULL REFERENCES seasons (season_id),
        team_id       TEXT NOT NULL,
        abbreviation  TEXT NOT NULL,
        name          TEXT NOT NULL,
        PRIMARY KEY (season_id, team_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS games (
        game_id     TEXT PRIMARY KEY,
        season_id   TEXT NOT NULL REFERENCES seasons (season_id),
        home_team   TEXT NOT NULL,
        away_team   TEXT NOT NULL,
        game_date   DATE NOT NULL,
        status      TEXT NOT NULL DEFAULT 'scheduled'
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_games_season ON games (season_id)",
    // event_id records ingestion order; sequence is validated, not trusted
    r#"
    CREATE TABLE IF NOT EXISTS events (
        event_id       BIGSERIAL PRIMARY KEY,
        game_id        TEXT NOT NULL REFERENCES games (game_id),
        sequence       BIGINT NOT NULL,
        period         SMALLINT NOT NULL,
        clock_seconds  INTEGER NOT NULL,
        event_type     TEXT NOT NULL,
        team_id        TEXT,
        player_id      TEXT,
        payload        JSONB NOT NULL DEFAULT '{}'::jsonb,
        ingested_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_events_game ON events (game_id, event_id)",
    r#"
    CREATE TABLE IF NOT EXISTS game_states (
        game_id    TEXT NOT NULL REFERENCES games (game_id),
        position   INTEGER NOT NULL,
        sequence   BIGINT NOT NULL,
        is_final   BOOLEAN NOT NULL,
        flagged    BOOLEAN NOT NULL,
        state      JSONB NOT NULL,
        PRIMARY KEY (game_id, position)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS game_commits (
        game_id           TEXT PRIMARY KEY REFERENCES games (game_id),
        event_count       INTEGER NOT NULL,
        fingerprint       TEXT NOT NULL,
        home_score        INTEGER,
        away_score        INTEGER,
        home_possessions  DOUBLE PRECISION,
        away_possessions  DOUBLE PRECISION,
        committed_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS feature_vectors (
        game_id        TEXT NOT NULL REFERENCES games (game_id),
        as_of          TEXT NOT NULL,
        uses_fallback  BOOLEAN NOT NULL,
        vector         JSONB NOT NULL,
        computed_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (game_id, as_of)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS predictions (
        prediction_id  UUID PRIMARY KEY,
        game_id        TEXT NOT NULL REFERENCES games (game_id),
        season_id      TEXT NOT NULL,
        predictor      TEXT NOT NULL,
        model_version  TEXT NOT NULL,
        as_of          TEXT NOT NULL,
        home_score     DOUBLE PRECISION NOT NULL,
        away_score     DOUBLE PRECISION NOT NULL,
        margin         DOUBLE PRECISION NOT NULL,
        home_win_prob  DOUBLE PRECISION NOT NULL,
        active         BOOLEAN NOT NULL DEFAULT FALSE,
        created_at     TIMESTAMPTZ NOT NULL,
        UNIQUE (game_id, predictor, model_version, as_of)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_predictions_season ON predictions (season_id, predictor)",
    // At most one served row per (game, predictor)
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_predictions_active
        ON predictions (game_id, predictor) WHERE active
    "#,
];

/// Create any missing tables and indexes
pub async fn bootstrap(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("Failed to apply schema statement")?;
    }
    info!("Schema bootstrap complete ({} statements)", SCHEMA.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_are_idempotent() {
        for statement in SCHEMA {
            assert!(statement.contains("IF NOT EXISTS"), "{}", statement);
            assert!(!statement.trim_end().ends_with(';'));
        }
    }

    #[test]
    fn test_prediction_identity_is_unique() {
        let predictions = SCHEMA
            .iter()
            .find(|s| s.contains("CREATE TABLE IF NOT EXISTS predictions"))
            .unwrap();
        assert!(predictions.contains("UNIQUE (game_id, predictor, model_version, as_of)"));
    }
}
