// Shared models for the Hoopcast pipeline
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod event;

pub use event::{Event, EventKind};

pub type GameId = String;
pub type TeamId = String;

/// Regulation periods in a game
pub const REGULATION_PERIODS: u8 = 4;
/// Length of a regulation quarter in seconds
pub const REGULATION_PERIOD_SECONDS: u32 = 720;
/// Length of an overtime period in seconds
pub const OVERTIME_PERIOD_SECONDS: u32 = 300;
/// Regulation game length in seconds (48 minutes)
pub const REGULATION_SECONDS: u32 = REGULATION_PERIOD_SECONDS * REGULATION_PERIODS as u32;

/// Length of the given (1-based) period in seconds
pub fn period_length(period: u8) -> u32 {
    if period <= REGULATION_PERIODS {
        REGULATION_PERIOD_SECONDS
    } else {
        OVERTIME_PERIOD_SECONDS
    }
}

// ============================================================================
// Season, Team & Game
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Season {
    /// e.g. "2024-2025"
    pub season_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl Season {
    /// Whether a date falls inside the season's calendar window (inclusive)
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start_date && date <= self.end_date
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Team {
    pub team_id: TeamId,
    pub abbreviation: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Scheduled,
    InProgress,
    Final,
}

impl GameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameStatus::Scheduled => "scheduled",
            GameStatus::InProgress => "in_progress",
            GameStatus::Final => "final",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, GameStatus::Final)
    }
}

impl FromStr for GameStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(GameStatus::Scheduled),
            "in_progress" => Ok(GameStatus::InProgress),
            "final" => Ok(GameStatus::Final),
            other => Err(format!("unknown game status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Game {
    pub game_id: GameId,
    pub season_id: String,
    pub home_team: TeamId,
    pub away_team: TeamId,
    pub game_date: NaiveDate,
    pub status: GameStatus,
}

impl Game {
    pub fn side_of(&self, team_id: &str) -> Option<TeamSide> {
        if team_id == self.home_team {
            Some(TeamSide::Home)
        } else if team_id == self.away_team {
            Some(TeamSide::Away)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamSide {
    Home,
    Away,
}

// ============================================================================
// Game State (one snapshot per folded event)
// ============================================================================

/// Cumulative box-score aggregate for one team
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamBox {
    pub score: u16,
    pub fouls: u16,
    pub technical_fouls: u16,
    pub timeouts_used: u8,
    pub field_goals_made: u16,
    pub field_goals_attempted: u16,
    pub threes_made: u16,
    pub free_throws_made: u16,
    pub free_throws_attempted: u16,
    pub offensive_rebounds: u16,
    pub defensive_rebounds: u16,
    pub turnovers: u16,
    /// Players currently on the floor
    pub lineup: BTreeSet<String>,
}

impl TeamBox {
    /// Possession estimate: FGA - OREB + TOV + 0.44 * FTA
    pub fn possessions(&self) -> f64 {
        self.field_goals_attempted as f64 - self.offensive_rebounds as f64
            + self.turnovers as f64
            + 0.44 * self.free_throws_attempted as f64
    }

    pub fn field_goal_pct(&self) -> f64 {
        if self.field_goals_attempted == 0 {
            0.0
        } else {
            self.field_goals_made as f64 / self.field_goals_attempted as f64
        }
    }
}

/// Snapshot produced by folding one event into the running aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameState {
    pub game_id: GameId,
    /// Sequence number of the event that produced this state
    pub sequence: u64,
    /// Running period counter (1-based, overtime continues past 4)
    pub period: u8,
    /// Seconds remaining in the current period
    pub clock_seconds: u32,
    /// Seconds of game time played so far
    pub elapsed_seconds: u32,
    pub home: TeamBox,
    pub away: TeamBox,
    /// home score - away score
    pub margin: i32,
    pub possessions: f64,
    /// Possessions per 48 minutes
    pub pace: f64,
    pub is_final_state: bool,
    /// Set when the producing event was not recognised
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag: Option<String>,
}

impl GameState {
    /// Seconds remaining in regulation (0 once regulation has ended)
    pub fn remaining_regulation_seconds(&self) -> u32 {
        REGULATION_SECONDS.saturating_sub(self.elapsed_seconds)
    }

    /// Fraction of regulation played (0.0 = tip-off, 1.0 = end of regulation)
    pub fn game_progress(&self) -> f64 {
        (self.elapsed_seconds as f64 / REGULATION_SECONDS as f64).clamp(0.0, 1.0)
    }

    pub fn is_flagged(&self) -> bool {
        self.flag.is_some()
    }
}

// ============================================================================
// Feature Vectors
// ============================================================================

/// Point in a game's timeline a feature vector (and prediction) refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsOf {
    /// After the game-end event
    Final,
    /// After the event with this sequence number
    Event(u64),
}

impl AsOf {
    /// Stable storage key: "final" or "event:<seq>"
    pub fn as_key(&self) -> String {
        match self {
            AsOf::Final => "final".to_string(),
            AsOf::Event(seq) => format!("event:{}", seq),
        }
    }
}

impl fmt::Display for AsOf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key())
    }
}

impl FromStr for AsOf {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "final" {
            return Ok(AsOf::Final);
        }
        s.strip_prefix("event:")
            .and_then(|seq| seq.parse().ok())
            .map(AsOf::Event)
            .ok_or_else(|| format!("invalid as-of key: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// No prior history for the team at all
    NoHistory,
    /// History exists but covers too few games
    InsufficientSample { games_played: u32 },
}

/// League-average prior substituted for a team's missing history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackRecord {
    pub team_id: TeamId,
    pub reason: FallbackReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub game_id: GameId,
    pub as_of: AsOf,
    pub values: BTreeMap<String, f64>,
    #[serde(default)]
    pub fallbacks: Vec<FallbackRecord>,
}

impl FeatureVector {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn uses_fallback(&self) -> bool {
        !self.fallbacks.is_empty()
    }
}

// ============================================================================
// Predictions
// ============================================================================

/// Identity of one prediction row: (game, predictor, version, as-of)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PredictionKey {
    pub game_id: GameId,
    pub predictor: String,
    pub model_version: String,
    pub as_of: AsOf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub prediction_id: Uuid,
    pub game_id: GameId,
    pub season_id: String,
    pub predictor: String,
    pub model_version: String,
    pub as_of: AsOf,
    pub home_score: f64,
    pub away_score: f64,
    /// home - away
    pub margin: f64,
    pub home_win_prob: f64,
    /// Whether this row is the one currently served
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Prediction {
    pub fn key(&self) -> PredictionKey {
        PredictionKey {
            game_id: self.game_id.clone(),
            predictor: self.predictor.clone(),
            model_version: self.model_version.clone(),
            as_of: self.as_of,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_season_window_inclusive() {
        let season = Season {
            season_id: "2024-2025".to_string(),
            start_date: NaiveDate::from_ymd_opt(2024, 10, 22).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2025, 6, 30).unwrap(),
        };
        assert!(season.contains(NaiveDate::from_ymd_opt(2024, 10, 22).unwrap()));
        assert!(season.contains(NaiveDate::from_ymd_opt(2025, 6, 30).unwrap()));
        assert!(!season.contains(NaiveDate::from_ymd_opt(2025, 7, 1).unwrap()));
    }

    #[test]
    fn test_as_of_key_roundtrip() {
        assert_eq!("final".parse::<AsOf>().unwrap(), AsOf::Final);
        assert_eq!("event:451".parse::<AsOf>().unwrap(), AsOf::Event(451));
        assert!("event:abc".parse::<AsOf>().is_err());
        assert_eq!(AsOf::Event(7).to_string(), "event:7");
    }

    #[test]
    fn test_period_lengths() {
        assert_eq!(period_length(1), 720);
        assert_eq!(period_length(4), 720);
        assert_eq!(period_length(5), 300);
        assert_eq!(REGULATION_SECONDS, 2880);
    }

    #[test]
    fn test_possession_estimate() {
        let team = TeamBox {
            field_goals_attempted: 88,
            offensive_rebounds: 10,
            turnovers: 14,
            free_throws_attempted: 25,
            ..Default::default()
        };
        assert!((team.possessions() - 103.0).abs() < 1e-9);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("in_progress".parse::<GameStatus>().unwrap(), GameStatus::InProgress);
        assert!("done".parse::<GameStatus>().is_err());
    }
}
