//! External data sources.
//!
//! The pipeline never calls these from inside a work unit: schedule, events
//! and history are all fetched up front and handed to the units.

use crate::features::HistoricalAggregates;
use crate::models::{Event, Game, Season, Team};
use anyhow::Result;
use async_trait::async_trait;

/// Play-by-play log for a game
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Events for the game in ingestion order
    async fn get_events(&self, game_id: &str) -> Result<Vec<Event>>;
}

/// Season calendar, registered games and rosters
#[async_trait]
pub trait ScheduleProvider: Send + Sync {
    async fn get_season(&self, season_id: &str) -> Result<Option<Season>>;

    async fn get_games(&self, season_id: &str) -> Result<Vec<Game>>;

    async fn get_teams(&self, season_id: &str) -> Result<Vec<Team>>;
}

/// Completed-game lines used for trailing team features
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    /// Committed final games from `season_id` and every season that started
    /// before it. The feature engine keeps only lines dated before each game.
    async fn get_history(&self, season_id: &str) -> Result<HistoricalAggregates>;
}
