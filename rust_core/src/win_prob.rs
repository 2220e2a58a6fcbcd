//! Win probability for live and predicted basketball games.
//!
//! The live model works from a reconstructed [`GameState`]:
//! - Score differential
//! - Time remaining (regulation or the current overtime period)
//! - Home court advantage, decaying as the game progresses
//! - Late-game dynamics (volatility compression, catch-up difficulty)
//!
//! Predictors use [`margin_to_win_prob`] to turn a predicted final margin
//! into a probability and [`blend_with_prior`] to fold in live state.

use crate::models::{GameState, REGULATION_PERIODS, REGULATION_SECONDS};
use rayon::prelude::*;

/// Home court advantage in points at tip-off
const HOME_ADVANTAGE_POINTS: f64 = 3.0;

/// Possessions in a full regulation game (both teams)
const POSSESSIONS_PER_GAME: f64 = 100.0;

/// Logistic slope for final margins: P(win) = logistic(margin / scale).
/// Final NBA margins have a standard deviation of roughly 12.5 points.
const MARGIN_LOGISTIC_SCALE: f64 = 7.3;

/// Logistic function for probability calculation
#[inline]
pub(crate) fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Converts a probability to log-odds.
#[inline]
fn prob_to_log_odds(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

/// Seconds left to play: the rest of regulation, or of the current overtime.
fn seconds_remaining(state: &GameState) -> f64 {
    if state.period > REGULATION_PERIODS {
        state.clock_seconds as f64
    } else {
        state.remaining_regulation_seconds() as f64
    }
}

/// Home win probability from a live game state.
///
/// Calibrated so that:
/// - 7-point lead, 8 min left → ~88%
/// - 15-point lead, 8 min left → ~97%
/// - 7-point lead, 2 min left → ~95%
pub fn live_home_win_prob(state: &GameState) -> f64 {
    if state.is_final_state {
        return match state.margin {
            m if m > 0 => 1.0,
            m if m < 0 => 0.0,
            _ => 0.5,
        };
    }

    let remaining = seconds_remaining(state);
    let time_remaining_pct = (remaining / REGULATION_SECONDS as f64).clamp(0.0, 1.0);

    // Home advantage as equivalent points, gone by the final buzzer
    let home_advantage_points = HOME_ADVANTAGE_POINTS * time_remaining_pct;
    let raw_diff = state.margin as f64;
    let score_diff = raw_diff + home_advantage_points;
    let abs_score_diff = raw_diff.abs();

    let possessions_remaining = time_remaining_pct * POSSESSIONS_PER_GAME;

    // ========== LATE-GAME DYNAMICS ==========
    let is_late_game = remaining < 600.0;
    let is_very_late = remaining < 300.0;
    let is_crunch_time = remaining < 120.0;

    let close_game_threshold = if is_late_game { 3.0 } else { 4.0 };
    let moderate_lead_threshold = if is_late_game { 6.0 } else { 8.0 };
    let is_close_game = abs_score_diff <= close_game_threshold;
    let is_moderate_lead =
        abs_score_diff > close_game_threshold && abs_score_diff <= moderate_lead_threshold;

    // Close games stay volatile late; larger leads compress
    let late_game_volatility_factor = match (is_close_game, is_moderate_lead) {
        (true, _) => {
            if is_crunch_time { 0.85 } else if is_very_late { 0.9 } else if is_late_game { 0.95 } else { 1.0 }
        }
        (false, true) => {
            if is_crunch_time { 0.65 } else if is_very_late { 0.7 } else if is_late_game { 0.8 } else { 1.0 }
        }
        (false, false) => {
            if is_crunch_time { 0.5 } else if is_very_late { 0.6 } else if is_late_game { 0.7 } else { 1.0 }
        }
    };

    let base_volatility = possessions_remaining.max(1.0).sqrt() * 2.2 * late_game_volatility_factor;

    // ========== CATCH-UP DIFFICULTY ==========
    let trailing_team_possessions = possessions_remaining / 2.0;
    let required_margin_per_poss = if trailing_team_possessions > 0.5 && abs_score_diff > 0.0 {
        abs_score_diff / trailing_team_possessions
    } else {
        0.0
    };

    let late_factor = (1.0 - time_remaining_pct).clamp(0.0, 1.0);
    let score_weight = if is_late_game && !is_close_game {
        1.2 + (abs_score_diff / 12.0).min(0.8) * late_factor
    } else if is_late_game {
        1.1 + (abs_score_diff / 15.0).min(0.4) * late_factor
    } else {
        1.0 + (abs_score_diff / 12.0).min(1.0) * (0.25 + 0.75 * late_factor)
    };

    let (difficulty_threshold, difficulty_base, difficulty_exponent): (f64, f64, f64) =
        if is_close_game {
            if is_crunch_time { (0.55, 1.35, 1.0) } else { (0.6, 1.25, 0.9) }
        } else if is_moderate_lead {
            if is_crunch_time {
                (0.4, 1.7, 1.3)
            } else if is_very_late {
                (0.45, 1.6, 1.2)
            } else if is_late_game {
                (0.5, 1.5, 1.1)
            } else {
                (0.55, 1.4, 1.0)
            }
        } else if is_crunch_time {
            (0.35, 2.0, 1.5)
        } else if is_very_late {
            (0.4, 1.8, 1.4)
        } else if is_late_game {
            (0.45, 1.7, 1.3)
        } else {
            (0.5, 1.5, 1.2)
        };

    let difficulty_factor = if required_margin_per_poss > difficulty_threshold {
        let excess = required_margin_per_poss - difficulty_threshold;
        difficulty_base.powf(excess * difficulty_exponent)
    } else {
        1.0
    };

    let min_volatility = if is_close_game {
        1.0
    } else if abs_score_diff > 10.0 {
        0.4
    } else {
        0.6
    };
    let volatility = (base_volatility / difficulty_factor).max(min_volatility);

    logistic(score_diff * score_weight / volatility)
}

/// Home win probability implied by a predicted final margin (home - away)
pub fn margin_to_win_prob(margin: f64) -> f64 {
    logistic(margin / MARGIN_LOGISTIC_SCALE)
}

/// Blend a pregame (model) probability with the live probability.
///
/// Weight on the prior starts at 0.5 and decays towards ~0.05 by the end of
/// regulation. Blending happens in log-odds space.
pub fn blend_with_prior(prior_prob: f64, live_prob: f64, game_progress: f64) -> f64 {
    let prior_prob = prior_prob.clamp(0.01, 0.99);
    let live_prob = live_prob.clamp(0.001, 0.999);
    let progress = game_progress.clamp(0.0, 1.0);

    let prior_weight = 0.5 * (-2.5 * progress).exp();
    let live_weight = 1.0 - prior_weight;

    let blended =
        prior_weight * prob_to_log_odds(prior_prob) + live_weight * prob_to_log_odds(live_prob);
    logistic(blended)
}

/// Live home win probability for every state of a game, in parallel.
pub fn win_prob_timeline(states: &[GameState]) -> Vec<f64> {
    states.par_iter().map(live_home_win_prob).collect()
}
