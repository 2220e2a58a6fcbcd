//! Event-to-state reconstruction.
//!
//! Replays a game's play-by-play log into one cumulative [`GameState`] per
//! event. The fold is pure: the same event list always produces the same
//! state sequence, so a game can be re-ingested by replacing its states
//! wholesale.
//!
//! Ordering is by ingestion sequence number only. Period and clock values on
//! the events are carried into the snapshots but never used to order them.

use crate::error::IngestionError;
use crate::models::{
    period_length, Event, EventKind, Game, GameId, GameState, GameStatus, TeamBox, TeamSide,
    REGULATION_SECONDS,
};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Output of folding one game's events
#[derive(Debug, Clone, PartialEq)]
pub struct Reconstruction {
    pub game_id: GameId,
    pub states: Vec<GameState>,
    /// Status observed from the log: final once a game-end event was folded
    pub status: GameStatus,
    pub unrecognized_events: usize,
}

impl Reconstruction {
    pub fn final_state(&self) -> Option<&GameState> {
        self.states.iter().rev().find(|s| s.is_final_state)
    }

    pub fn last_state(&self) -> Option<&GameState> {
        self.states.last()
    }
}

/// One game's input to [`reconstruct_batch`]
#[derive(Debug, Clone)]
pub struct GameEvents {
    pub game: Game,
    pub events: Vec<Event>,
}

/// Check that events are contiguous, strictly ascending and all belong to the game.
pub fn validate_sequence(game_id: &str, events: &[Event]) -> Result<(), IngestionError> {
    let mut previous: Option<u64> = None;

    for event in events {
        if event.game_id != game_id {
            return Err(IngestionError::ForeignEvent {
                game_id: game_id.to_string(),
                event_game_id: event.game_id.clone(),
                sequence: event.sequence,
            });
        }

        if let Some(prev) = previous {
            if event.sequence <= prev {
                return Err(IngestionError::SequenceInversion {
                    game_id: game_id.to_string(),
                    previous: prev,
                    found: event.sequence,
                });
            }
            if event.sequence != prev + 1 {
                return Err(IngestionError::SequenceGap {
                    game_id: game_id.to_string(),
                    expected: prev + 1,
                    found: event.sequence,
                });
            }
        }
        previous = Some(event.sequence);
    }

    Ok(())
}

/// Running aggregate threaded through the fold
struct Fold<'a> {
    game: &'a Game,
    period: u8,
    /// Game time contained in periods already closed by a boundary event
    completed_seconds: u32,
    clock: u32,
    home: TeamBox,
    away: TeamBox,
    ended: bool,
}

impl<'a> Fold<'a> {
    fn new(game: &'a Game) -> Self {
        Self {
            game,
            period: 1,
            completed_seconds: 0,
            clock: period_length(1),
            home: TeamBox::default(),
            away: TeamBox::default(),
            ended: false,
        }
    }

    fn team_mut(&mut self, side: TeamSide) -> &mut TeamBox {
        match side {
            TeamSide::Home => &mut self.home,
            TeamSide::Away => &mut self.away,
        }
    }

    /// Resolve the acting team, demoting the event to unrecognised when it
    /// references a team that is not playing.
    fn resolve(&self, event: &Event) -> (EventKind, Option<TeamSide>) {
        let kind = event.kind();
        if !kind.requires_team() {
            return (kind, None);
        }
        match event.team_id.as_deref() {
            Some(team) => match self.game.side_of(team) {
                Some(side) => (kind, Some(side)),
                None => (
                    EventKind::Unrecognized(format!(
                        "{} by team '{}' which is not playing",
                        event.event_type, team
                    )),
                    None,
                ),
            },
            None => (
                EventKind::Unrecognized(format!("{} without a team", event.event_type)),
                None,
            ),
        }
    }

    fn apply(&mut self, event: &Event) -> GameState {
        let (kind, side) = self.resolve(event);
        let mut flag = None;
        let mut is_final_state = false;

        if !matches!(kind, EventKind::PeriodBoundary) {
            self.clock = event.clock_seconds.min(period_length(self.period));
        }

        match (kind, side) {
            (EventKind::Shot { made, points }, Some(side)) => {
                let team = self.team_mut(side);
                team.field_goals_attempted = team.field_goals_attempted.saturating_add(1);
                if made {
                    team.field_goals_made = team.field_goals_made.saturating_add(1);
                    team.score = team.score.saturating_add(points as u16);
                    if points == 3 {
                        team.threes_made = team.threes_made.saturating_add(1);
                    }
                }
            }
            (EventKind::FreeThrow { made }, Some(side)) => {
                let team = self.team_mut(side);
                team.free_throws_attempted = team.free_throws_attempted.saturating_add(1);
                if made {
                    team.free_throws_made = team.free_throws_made.saturating_add(1);
                    team.score = team.score.saturating_add(1);
                }
            }
            (EventKind::Rebound { offensive }, Some(side)) => {
                let team = self.team_mut(side);
                if offensive {
                    team.offensive_rebounds = team.offensive_rebounds.saturating_add(1);
                } else {
                    team.defensive_rebounds = team.defensive_rebounds.saturating_add(1);
                }
            }
            (EventKind::Foul { technical }, Some(side)) => {
                let team = self.team_mut(side);
                team.fouls = team.fouls.saturating_add(1);
                if technical {
                    team.technical_fouls = team.technical_fouls.saturating_add(1);
                }
            }
            (EventKind::Turnover, Some(side)) => {
                let team = self.team_mut(side);
                team.turnovers = team.turnovers.saturating_add(1);
            }
            (EventKind::Timeout, Some(side)) => {
                let team = self.team_mut(side);
                team.timeouts_used = team.timeouts_used.saturating_add(1);
            }
            (
                EventKind::Substitution {
                    player_in,
                    player_out,
                },
                Some(side),
            ) => {
                let team = self.team_mut(side);
                team.lineup.remove(&player_out);
                team.lineup.insert(player_in);
            }
            (EventKind::PeriodBoundary, _) => {
                self.completed_seconds += period_length(self.period);
                self.period = self.period.saturating_add(1);
                self.clock = period_length(self.period);
            }
            (EventKind::GameEnd, _) => {
                self.ended = true;
                is_final_state = true;
            }
            (EventKind::Unrecognized(reason), _) => {
                flag = Some(reason);
            }
            // resolve() only yields a team-requiring kind together with a side
            (kind, None) => {
                flag = Some(format!("{:?} without a resolved team", kind));
            }
        }

        self.snapshot(event.sequence, is_final_state, flag)
    }

    fn snapshot(&self, sequence: u64, is_final_state: bool, flag: Option<String>) -> GameState {
        let elapsed_seconds = self.completed_seconds + (period_length(self.period) - self.clock);
        let possessions = (self.home.possessions() + self.away.possessions()) / 2.0;
        let pace = if elapsed_seconds > 0 {
            possessions * REGULATION_SECONDS as f64 / elapsed_seconds as f64
        } else {
            0.0
        };

        GameState {
            game_id: self.game.game_id.clone(),
            sequence,
            period: self.period,
            clock_seconds: self.clock,
            elapsed_seconds,
            home: self.home.clone(),
            away: self.away.clone(),
            margin: self.home.score as i32 - self.away.score as i32,
            possessions,
            pace,
            is_final_state,
            flag,
        }
    }
}

/// Fold one game's ordered events into its state sequence.
///
/// Returns exactly one state per event, in event order.
pub fn reconstruct_game(game: &Game, events: &[Event]) -> Result<Reconstruction, IngestionError> {
    validate_sequence(&game.game_id, events)?;

    let mut fold = Fold::new(game);
    let states: Vec<GameState> = events.iter().map(|event| fold.apply(event)).collect();
    let unrecognized_events = states.iter().filter(|s| s.is_flagged()).count();

    let status = if fold.ended {
        GameStatus::Final
    } else if states.is_empty() {
        GameStatus::Scheduled
    } else {
        GameStatus::InProgress
    };

    debug!(
        game_id = %game.game_id,
        events = events.len(),
        status = status.as_str(),
        unrecognized = unrecognized_events,
        "Reconstructed game"
    );

    Ok(Reconstruction {
        game_id: game.game_id.clone(),
        states,
        status,
        unrecognized_events,
    })
}

/// Reconstruct many games in parallel.
///
/// Games share nothing, so each is folded independently; a failure in one
/// game never affects another. Results keep the input order.
pub fn reconstruct_batch(
    inputs: &[GameEvents],
) -> Vec<(GameId, Result<Reconstruction, IngestionError>)> {
    inputs
        .par_iter()
        .map(|input| {
            (
                input.game.game_id.clone(),
                reconstruct_game(&input.game, &input.events),
            )
        })
        .collect()
}

/// SHA-256 over the canonical JSON encoding of a state sequence
pub fn fingerprint(states: &[GameState]) -> serde_json::Result<String> {
    let mut hasher = Sha256::new();
    for state in states {
        hasher.update(serde_json::to_vec(state)?);
        hasher.update(b"\n");
    }
    Ok(format!("{:x}", hasher.finalize()))
}
