//! Consistency audit and promotion gate.
//!
//! The audit is a read-only pass over what is committed for a season. Fatal
//! violations close the [`PromotionGate`]; warnings are reported only.

use crate::models::{FallbackReason, GameId, Season, Team};
use crate::store::{GameAuditRecord, PredictionCounts, SeasonSnapshot};
use chrono::{DateTime, NaiveDate, Utc};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCheck {
    FinalState,
    StateCount,
    RosterCoverage,
    DateWindow,
    FeatureFallback,
    UnrecognizedEvents,
    MissingFeatures,
    MissingPredictions,
}

impl AuditCheck {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCheck::FinalState => "final_state",
            AuditCheck::StateCount => "state_count",
            AuditCheck::RosterCoverage => "roster_coverage",
            AuditCheck::DateWindow => "date_window",
            AuditCheck::FeatureFallback => "feature_fallback",
            AuditCheck::UnrecognizedEvents => "unrecognized_events",
            AuditCheck::MissingFeatures => "missing_features",
            AuditCheck::MissingPredictions => "missing_predictions",
        }
    }
}

impl fmt::Display for AuditCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub severity: Severity,
    pub check: AuditCheck,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_id: Option<GameId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    pub message: String,
}

impl Violation {
    fn game(severity: Severity, check: AuditCheck, game_id: &str, message: String) -> Self {
        Self {
            severity,
            check,
            game_id: Some(game_id.to_string()),
            team_id: None,
            message,
        }
    }
}

/// Thresholds for the soft checks
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditThresholds {
    /// Fewest states expected for a completed game
    pub min_states: usize,
    /// Most states expected for a completed game
    pub max_states: usize,
    /// Share of final games allowed to use the league prior
    pub max_fallback_ratio: f64,
}

impl Default for AuditThresholds {
    fn default() -> Self {
        Self {
            min_states: 300,
            max_states: 800,
            max_fallback_ratio: 0.2,
        }
    }
}

impl AuditThresholds {
    pub fn validate(&self) -> Result<(), String> {
        if self.min_states > self.max_states {
            return Err(format!(
                "audit.min_states ({}) exceeds audit.max_states ({})",
                self.min_states, self.max_states
            ));
        }
        if !(0.0..=1.0).contains(&self.max_fallback_ratio) {
            return Err(format!(
                "audit.max_fallback_ratio must be within [0, 1], got {}",
                self.max_fallback_ratio
            ));
        }
        Ok(())
    }
}

/// Season totals reported next to the violations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeasonStats {
    /// Keyed by status name
    pub games_by_status: BTreeMap<String, usize>,
    pub first_game_date: Option<NaiveDate>,
    pub last_game_date: Option<NaiveDate>,
    /// Distinct dates with at least one game
    pub game_days: usize,
    pub games_with_states: usize,
    pub total_states: usize,
    pub final_feature_vectors: usize,
    /// Keyed by predictor name
    pub predictions: BTreeMap<String, PredictionCounts>,
}

impl SeasonStats {
    pub fn from_snapshot(snapshot: &SeasonSnapshot) -> Self {
        let mut stats = SeasonStats {
            predictions: snapshot.predictions.clone(),
            ..Default::default()
        };
        let mut days = BTreeSet::new();

        for record in &snapshot.games {
            let game = &record.game;
            *stats
                .games_by_status
                .entry(game.status.as_str().to_string())
                .or_default() += 1;
            days.insert(game.game_date);
            if record.state_count > 0 {
                stats.games_with_states += 1;
            }
            stats.total_states += record.state_count;
            if record.final_features.is_some() {
                stats.final_feature_vectors += 1;
            }
        }

        stats.first_game_date = days.first().copied();
        stats.last_game_date = days.last().copied();
        stats.game_days = days.len();
        stats
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    pub season_id: String,
    pub run_at: DateTime<Utc>,
    pub games_checked: usize,
    #[serde(default)]
    pub stats: SeasonStats,
    /// Fatal first, then by check, game and team
    pub violations: Vec<Violation>,
}

impl AuditReport {
    pub fn fatal_count(&self) -> usize {
        self.violations
            .iter()
            .filter(|v| v.severity == Severity::Fatal)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.violations.len() - self.fatal_count()
    }

    pub fn has_fatal(&self) -> bool {
        self.violations.iter().any(|v| v.severity == Severity::Fatal)
    }

    pub fn by_check(&self, check: AuditCheck) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(move |v| v.check == check)
    }

    pub fn summary(&self) -> AuditSummary {
        AuditSummary {
            season_id: self.season_id.clone(),
            games_checked: self.games_checked,
            fatal: self.fatal_count(),
            warnings: self.warning_count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub season_id: String,
    pub games_checked: usize,
    pub fatal: usize,
    pub warnings: usize,
}

// ============================================================================
// Checks
// ============================================================================

fn check_game(
    record: &GameAuditRecord,
    season: &Season,
    event_count: Option<usize>,
    thresholds: &AuditThresholds,
    predictors: &[String],
) -> Vec<Violation> {
    let game = &record.game;
    let id = game.game_id.as_str();
    let is_final = game.status.is_final();
    let mut out = Vec::new();

    // final_state
    if is_final && record.final_state_count != 1 {
        out.push(Violation::game(
            Severity::Fatal,
            AuditCheck::FinalState,
            id,
            format!(
                "final game has {} terminal states, expected exactly 1",
                record.final_state_count
            ),
        ));
    } else if !is_final && record.final_state_count > 0 {
        out.push(Violation::game(
            Severity::Fatal,
            AuditCheck::FinalState,
            id,
            format!(
                "game marked {} has {} terminal states",
                game.status.as_str(),
                record.final_state_count
            ),
        ));
    }

    // state_count
    match event_count {
        Some(events) if record.state_count > 0 && record.state_count != events => {
            out.push(Violation::game(
                Severity::Fatal,
                AuditCheck::StateCount,
                id,
                format!(
                    "count mismatch: {} events but {} committed states",
                    events, record.state_count
                ),
            ));
        }
        Some(events) if record.state_count == 0 && events > 0 => {
            out.push(Violation::game(
                Severity::Warning,
                AuditCheck::StateCount,
                id,
                format!("{} events but no committed states", events),
            ));
        }
        _ => {
            if is_final
                && (record.state_count < thresholds.min_states
                    || record.state_count > thresholds.max_states)
            {
                out.push(Violation::game(
                    Severity::Warning,
                    AuditCheck::StateCount,
                    id,
                    format!(
                        "{} states outside expected range {}-{}",
                        record.state_count, thresholds.min_states, thresholds.max_states
                    ),
                ));
            }
        }
    }

    // date_window
    if !season.contains(game.game_date) {
        out.push(Violation::game(
            Severity::Warning,
            AuditCheck::DateWindow,
            id,
            format!(
                "game date {} outside season window {} to {}",
                game.game_date, season.start_date, season.end_date
            ),
        ));
    }

    // feature_fallback
    if let Some(vector) = record.final_features.as_ref().filter(|v| v.uses_fallback()) {
        for fallback in &vector.fallbacks {
            let reason = match fallback.reason {
                FallbackReason::NoHistory => "no prior history".to_string(),
                FallbackReason::InsufficientSample { games_played } => {
                    format!("only {} prior games", games_played)
                }
            };
            out.push(Violation {
                severity: Severity::Warning,
                check: AuditCheck::FeatureFallback,
                game_id: Some(id.to_string()),
                team_id: Some(fallback.team_id.clone()),
                message: format!("league-average prior used: {}", reason),
            });
        }
    }

    // unrecognized_events
    if record.flagged_state_count > 0 {
        out.push(Violation::game(
            Severity::Warning,
            AuditCheck::UnrecognizedEvents,
            id,
            format!("{} unrecognized events", record.flagged_state_count),
        ));
    }

    if is_final && record.state_count > 0 {
        // missing_features
        if record.final_features.is_none() {
            out.push(Violation::game(
                Severity::Warning,
                AuditCheck::MissingFeatures,
                id,
                "final game has no final feature vector".to_string(),
            ));
        }

        // missing_predictions
        for predictor in predictors {
            if !record.predictors.contains(predictor) {
                out.push(Violation::game(
                    Severity::Warning,
                    AuditCheck::MissingPredictions,
                    id,
                    format!("no prediction from {}", predictor),
                ));
            }
        }
    }

    out
}

fn check_roster(teams: &[Team], snapshot: &SeasonSnapshot) -> Vec<Violation> {
    let playing: FxHashSet<&str> = snapshot
        .games
        .iter()
        .flat_map(|r| [r.game.home_team.as_str(), r.game.away_team.as_str()])
        .collect();
    let roster: FxHashSet<&str> = teams.iter().map(|t| t.team_id.as_str()).collect();
    let known = &roster;

    let absent = teams
        .iter()
        .filter(|team| !playing.contains(team.team_id.as_str()))
        .map(|team| Violation {
            severity: Severity::Warning,
            check: AuditCheck::RosterCoverage,
            game_id: None,
            team_id: Some(team.team_id.clone()),
            message: format!("{} ({}) appears in no game", team.name, team.abbreviation),
        });

    let unknown = snapshot.games.iter().flat_map(|record| {
        [&record.game.home_team, &record.game.away_team]
            .into_iter()
            .filter(move |team| !known.contains(team.as_str()))
            .map(move |team| Violation {
                severity: Severity::Warning,
                check: AuditCheck::RosterCoverage,
                game_id: Some(record.game.game_id.clone()),
                team_id: Some(team.clone()),
                message: "team not in season roster".to_string(),
            })
    });

    absent.chain(unknown).collect()
}

fn check_fallback_ratio(snapshot: &SeasonSnapshot, thresholds: &AuditThresholds) -> Option<Violation> {
    let vectors: Vec<_> = snapshot
        .games
        .iter()
        .filter(|r| r.game.status.is_final())
        .filter_map(|r| r.final_features.as_ref())
        .collect();
    if vectors.is_empty() {
        return None;
    }

    let with_fallback = vectors.iter().filter(|v| v.uses_fallback()).count();
    let ratio = with_fallback as f64 / vectors.len() as f64;
    (ratio > thresholds.max_fallback_ratio).then(|| Violation {
        severity: Severity::Warning,
        check: AuditCheck::FeatureFallback,
        game_id: None,
        team_id: None,
        message: format!(
            "{} of {} final games ({:.1}%) use the league prior, above {:.1}%",
            with_fallback,
            vectors.len(),
            ratio * 100.0,
            thresholds.max_fallback_ratio * 100.0
        ),
    })
}

/// Run every check over a season's committed data.
///
/// `event_counts` holds the event-log length per game as seen by the event
/// source; games missing from it skip the state/event equality check.
pub fn run_audit(
    season: &Season,
    teams: &[Team],
    snapshot: &SeasonSnapshot,
    event_counts: &FxHashMap<GameId, usize>,
    thresholds: &AuditThresholds,
    predictors: &[String],
) -> AuditReport {
    let mut violations: Vec<Violation> = snapshot
        .games
        .par_iter()
        .flat_map_iter(|record| {
            check_game(
                record,
                season,
                event_counts.get(&record.game.game_id).copied(),
                thresholds,
                predictors,
            )
        })
        .collect();

    violations.extend(check_roster(teams, snapshot));
    violations.extend(check_fallback_ratio(snapshot, thresholds));

    violations.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| a.check.cmp(&b.check))
            .then_with(|| a.game_id.cmp(&b.game_id))
            .then_with(|| a.team_id.cmp(&b.team_id))
            .then_with(|| a.message.cmp(&b.message))
    });

    let report = AuditReport {
        season_id: season.season_id.clone(),
        run_at: Utc::now(),
        games_checked: snapshot.games.len(),
        stats: SeasonStats::from_snapshot(snapshot),
        violations,
    };

    if report.has_fatal() {
        warn!(
            season = %report.season_id,
            fatal = report.fatal_count(),
            warnings = report.warning_count(),
            "Audit found fatal violations"
        );
    } else {
        info!(
            season = %report.season_id,
            games = report.games_checked,
            game_days = report.stats.game_days,
            states = report.stats.total_states,
            warnings = report.warning_count(),
            "Audit passed"
        );
    }

    report
}

// ============================================================================
// Promotion Gate
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Open,
    Blocked { fatal: usize },
}

impl GateDecision {
    pub fn is_open(&self) -> bool {
        matches!(self, GateDecision::Open)
    }
}

/// Fail-closed gate: any fatal violation blocks promotion for the season
pub struct PromotionGate;

impl PromotionGate {
    pub fn evaluate(report: &AuditReport) -> GateDecision {
        match report.fatal_count() {
            0 => GateDecision::Open,
            fatal => GateDecision::Blocked { fatal },
        }
    }
}
