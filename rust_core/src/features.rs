//! Feature computation.
//!
//! Turns a game's reconstructed states plus trailing team history into a
//! predictor-agnostic [`FeatureVector`]. Each predictor later selects the
//! subset it declares with [`FeatureVector::select`].
//!
//! Teams with no usable history get the [`LeaguePrior`] instead, and every
//! substitution is recorded on the vector so the audit can count them.

use crate::error::FeatureError;
use crate::models::{
    AsOf, FallbackReason, FallbackRecord, FeatureVector, Game, GameState, TeamId,
};
use crate::win_prob::live_home_win_prob;
use chrono::NaiveDate;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Features derived from trailing team history
pub const HISTORY_FEATURES: &[&str] = &[
    "home_ppg",
    "away_ppg",
    "home_opp_ppg",
    "away_opp_ppg",
    "home_win_pct",
    "away_win_pct",
    "home_pace",
    "away_pace",
    "home_off_rtg",
    "away_off_rtg",
    "home_def_rtg",
    "away_def_rtg",
    "ppg_diff",
    "win_pct_diff",
    "net_rtg_diff",
];

/// Features read off the game state at the as-of point
pub const STATE_FEATURES: &[&str] = &[
    "home_score",
    "away_score",
    "margin",
    "period",
    "elapsed_seconds",
    "remaining_regulation_seconds",
    "possessions",
    "pace",
    "home_fouls",
    "away_fouls",
    "home_timeouts_used",
    "away_timeouts_used",
    "home_fg_pct",
    "away_fg_pct",
    "live_home_win_prob",
    "is_final",
];

/// Whether `name` is produced by the engine
pub fn is_known_feature(name: &str) -> bool {
    HISTORY_FEATURES.contains(&name) || STATE_FEATURES.contains(&name)
}

// ============================================================================
// History
// ============================================================================

/// One completed game from a team's perspective
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamGameLine {
    pub game_id: String,
    pub game_date: NaiveDate,
    pub points_for: u16,
    pub points_against: u16,
    /// Estimated possessions for the game
    pub possessions: f64,
}

/// Completed-game lines per team, as supplied by the history provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoricalAggregates {
    pub season_id: String,
    pub teams: FxHashMap<TeamId, Vec<TeamGameLine>>,
}

impl HistoricalAggregates {
    pub fn new(season_id: impl Into<String>) -> Self {
        Self {
            season_id: season_id.into(),
            teams: FxHashMap::default(),
        }
    }

    pub fn push(&mut self, team_id: impl Into<TeamId>, line: TeamGameLine) {
        self.teams.entry(team_id.into()).or_default().push(line);
    }

    /// Lines for games played strictly before `date`
    pub fn lines_before<'a>(
        &'a self,
        team_id: &str,
        date: NaiveDate,
    ) -> impl Iterator<Item = &'a TeamGameLine> + 'a {
        self.teams
            .get(team_id)
            .into_iter()
            .flatten()
            .filter(move |line| line.game_date < date)
    }
}

/// Per-team rates fed into the history features
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LeaguePrior {
    pub ppg: f64,
    pub opp_ppg: f64,
    pub win_pct: f64,
    pub pace: f64,
    pub off_rtg: f64,
    pub def_rtg: f64,
}

impl Default for LeaguePrior {
    /// Recent NBA league averages
    fn default() -> Self {
        Self {
            ppg: 114.2,
            opp_ppg: 114.2,
            win_pct: 0.5,
            pace: 99.0,
            off_rtg: 115.0,
            def_rtg: 115.0,
        }
    }
}

/// A team's trailing rates as fed into the history features
#[derive(Debug, Clone, Copy, PartialEq)]
struct TeamProfile {
    ppg: f64,
    opp_ppg: f64,
    win_pct: f64,
    pace: f64,
    off_rtg: f64,
    def_rtg: f64,
}

impl From<LeaguePrior> for TeamProfile {
    fn from(prior: LeaguePrior) -> Self {
        Self {
            ppg: prior.ppg,
            opp_ppg: prior.opp_ppg,
            win_pct: prior.win_pct,
            pace: prior.pace,
            off_rtg: prior.off_rtg,
            def_rtg: prior.def_rtg,
        }
    }
}

/// Observed profile over `lines`, or `None` when there are none.
/// Ratings come from `prior` when no possessions were recorded.
fn profile_from_lines<'a>(
    lines: impl Iterator<Item = &'a TeamGameLine>,
    prior: &LeaguePrior,
) -> (u32, Option<TeamProfile>) {
    let mut games = 0u32;
    let mut points_for = 0.0;
    let mut points_against = 0.0;
    let mut wins = 0u32;
    let mut possessions = 0.0;

    for line in lines {
        games += 1;
        points_for += line.points_for as f64;
        points_against += line.points_against as f64;
        possessions += line.possessions;
        if line.points_for > line.points_against {
            wins += 1;
        }
    }

    if games == 0 {
        return (0, None);
    }

    let n = games as f64;
    let (pace, off_rtg, def_rtg) = if possessions > 0.0 {
        (
            possessions / n,
            100.0 * points_for / possessions,
            100.0 * points_against / possessions,
        )
    } else {
        (prior.pace, prior.off_rtg, prior.def_rtg)
    };

    (
        games,
        Some(TeamProfile {
            ppg: points_for / n,
            opp_ppg: points_against / n,
            win_pct: wins as f64 / n,
            pace,
            off_rtg,
            def_rtg,
        }),
    )
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Debug, Clone)]
pub struct FeatureEngine {
    prior: LeaguePrior,
    min_history_games: u32,
}

impl FeatureEngine {
    pub fn new(prior: LeaguePrior, min_history_games: u32) -> Self {
        Self {
            prior,
            min_history_games,
        }
    }

    /// Trailing profile for a team, falling back to the league prior when
    /// the team has too little history before `date`.
    fn team_profile(
        &self,
        team_id: &str,
        date: NaiveDate,
        history: &HistoricalAggregates,
    ) -> (TeamProfile, Option<FallbackRecord>) {
        let (games, profile) =
            profile_from_lines(history.lines_before(team_id, date), &self.prior);

        let reason = match profile {
            None => FallbackReason::NoHistory,
            Some(profile) if games >= self.min_history_games => return (profile, None),
            Some(_) => FallbackReason::InsufficientSample {
                games_played: games,
            },
        };

        (
            self.prior.into(),
            Some(FallbackRecord {
                team_id: team_id.to_string(),
                reason,
            }),
        )
    }

    /// Compute the full feature set for one game at one point of its timeline.
    ///
    /// `states` must be the game's complete reconstructed sequence.
    pub fn compute(
        &self,
        game: &Game,
        states: &[GameState],
        history: &HistoricalAggregates,
        as_of: AsOf,
    ) -> Result<FeatureVector, FeatureError> {
        if states.is_empty() {
            return Err(FeatureError::NoStates {
                game_id: game.game_id.clone(),
            });
        }

        let state = locate_state(states, as_of).ok_or_else(|| FeatureError::AsOfNotFound {
            game_id: game.game_id.clone(),
            as_of,
        })?;

        let (home, home_fallback) = self.team_profile(&game.home_team, game.game_date, history);
        let (away, away_fallback) = self.team_profile(&game.away_team, game.game_date, history);

        let mut values = BTreeMap::new();
        let mut put = |name: &str, value: f64| {
            values.insert(name.to_string(), value);
        };

        put("home_ppg", home.ppg);
        put("away_ppg", away.ppg);
        put("home_opp_ppg", home.opp_ppg);
        put("away_opp_ppg", away.opp_ppg);
        put("home_win_pct", home.win_pct);
        put("away_win_pct", away.win_pct);
        put("home_pace", home.pace);
        put("away_pace", away.pace);
        put("home_off_rtg", home.off_rtg);
        put("away_off_rtg", away.off_rtg);
        put("home_def_rtg", home.def_rtg);
        put("away_def_rtg", away.def_rtg);
        put("ppg_diff", home.ppg - away.ppg);
        put("win_pct_diff", home.win_pct - away.win_pct);
        put(
            "net_rtg_diff",
            (home.off_rtg - home.def_rtg) - (away.off_rtg - away.def_rtg),
        );

        put("home_score", state.home.score as f64);
        put("away_score", state.away.score as f64);
        put("margin", state.margin as f64);
        put("period", state.period as f64);
        put("elapsed_seconds", state.elapsed_seconds as f64);
        put(
            "remaining_regulation_seconds",
            state.remaining_regulation_seconds() as f64,
        );
        put("possessions", state.possessions);
        put("pace", state.pace);
        put("home_fouls", state.home.fouls as f64);
        put("away_fouls", state.away.fouls as f64);
        put("home_timeouts_used", state.home.timeouts_used as f64);
        put("away_timeouts_used", state.away.timeouts_used as f64);
        put("home_fg_pct", state.home.field_goal_pct());
        put("away_fg_pct", state.away.field_goal_pct());
        put("live_home_win_prob", live_home_win_prob(state));
        put("is_final", if state.is_final_state { 1.0 } else { 0.0 });

        let fallbacks: Vec<FallbackRecord> =
            home_fallback.into_iter().chain(away_fallback).collect();

        Ok(FeatureVector {
            game_id: game.game_id.clone(),
            as_of,
            values,
            fallbacks,
        })
    }

    pub fn compute_many(
        &self,
        game: &Game,
        states: &[GameState],
        history: &HistoricalAggregates,
        as_ofs: &[AsOf],
    ) -> Vec<Result<FeatureVector, FeatureError>> {
        as_ofs
            .iter()
            .map(|as_of| self.compute(game, states, history, *as_of))
            .collect()
    }
}

fn locate_state(states: &[GameState], as_of: AsOf) -> Option<&GameState> {
    match as_of {
        AsOf::Final => states.iter().rev().find(|s| s.is_final_state),
        AsOf::Event(sequence) => states
            .binary_search_by_key(&sequence, |s| s.sequence)
            .ok()
            .map(|idx| &states[idx]),
    }
}

impl FeatureVector {
    /// Pick the predictor's schema out of the vector, in schema order.
    pub fn select(&self, schema: &[String], allow_fallback: bool) -> Result<Vec<f64>, FeatureError> {
        if !allow_fallback && self.uses_fallback() {
            return Err(FeatureError::FallbackRejected {
                game_id: self.game_id.clone(),
                teams: self.fallbacks.iter().map(|f| f.team_id.clone()).collect(),
            });
        }

        schema
            .iter()
            .map(|name| {
                self.get(name).ok_or_else(|| FeatureError::MissingFeature {
                    game_id: self.game_id.clone(),
                    feature: name.clone(),
                })
            })
            .collect()
    }
}
