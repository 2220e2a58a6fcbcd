//! Raw play-by-play events and their typed interpretation.
//!
//! Events are stored exactly as ingested: a type tag plus a JSON payload.
//! [`Event::kind`] turns that into an [`EventKind`] the reconstruction
//! engine can fold; anything it cannot interpret becomes
//! [`EventKind::Unrecognized`] instead of an error.

use super::TeamId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One immutable play-by-play record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub game_id: String,
    /// Monotonic ingestion sequence number (sole ordering key)
    pub sequence: u64,
    /// Period as reported by the source (descriptive only)
    pub period: u8,
    /// Seconds remaining in the period as reported by the source
    pub clock_seconds: u32,
    pub event_type: String,
    #[serde(default)]
    pub team_id: Option<TeamId>,
    #[serde(default)]
    pub player_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// Typed event, as understood by the state transition function
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Shot { made: bool, points: u8 },
    FreeThrow { made: bool },
    Rebound { offensive: bool },
    Foul { technical: bool },
    Turnover,
    Timeout,
    Substitution { player_in: String, player_out: String },
    PeriodBoundary,
    GameEnd,
    /// Carries the reason the event could not be interpreted
    Unrecognized(String),
}

impl EventKind {
    /// Whether the transition needs to know which team the event belongs to
    pub fn requires_team(&self) -> bool {
        !matches!(
            self,
            EventKind::PeriodBoundary | EventKind::GameEnd | EventKind::Unrecognized(_)
        )
    }
}

#[derive(Deserialize)]
struct ShotPayload {
    made: bool,
    points: u8,
}

#[derive(Deserialize)]
struct MadePayload {
    made: bool,
}

#[derive(Deserialize)]
struct ReboundPayload {
    offensive: bool,
}

#[derive(Deserialize)]
struct FoulPayload {
    #[serde(default)]
    technical: bool,
}

#[derive(Deserialize)]
struct SubstitutionPayload {
    player_in: String,
    player_out: String,
}

fn payload<T: for<'de> Deserialize<'de>>(event: &Event) -> Result<T, String> {
    serde_json::from_value(event.payload.clone())
        .map_err(|e| format!("malformed {} payload: {}", event.event_type, e))
}

impl Event {
    pub fn new(
        game_id: impl Into<String>,
        sequence: u64,
        period: u8,
        clock_seconds: u32,
        event_type: impl Into<String>,
        team_id: Option<&str>,
        payload: Value,
    ) -> Self {
        Self {
            game_id: game_id.into(),
            sequence,
            period,
            clock_seconds,
            event_type: event_type.into(),
            team_id: team_id.map(|t| t.to_string()),
            player_id: None,
            payload,
        }
    }

    /// Interpret the type tag and payload
    pub fn kind(&self) -> EventKind {
        let parsed = match self.event_type.as_str() {
            "shot" => payload::<ShotPayload>(self).and_then(|p| match p.points {
                2 | 3 => Ok(EventKind::Shot {
                    made: p.made,
                    points: p.points,
                }),
                other => Err(format!("shot worth {} points", other)),
            }),
            "free_throw" => payload::<MadePayload>(self).map(|p| EventKind::FreeThrow { made: p.made }),
            "rebound" => {
                payload::<ReboundPayload>(self).map(|p| EventKind::Rebound { offensive: p.offensive })
            }
            "foul" => payload::<FoulPayload>(self).map(|p| EventKind::Foul { technical: p.technical }),
            "turnover" => Ok(EventKind::Turnover),
            "timeout" => Ok(EventKind::Timeout),
            "substitution" => payload::<SubstitutionPayload>(self).map(|p| EventKind::Substitution {
                player_in: p.player_in,
                player_out: p.player_out,
            }),
            "period_boundary" => Ok(EventKind::PeriodBoundary),
            "game_end" => Ok(EventKind::GameEnd),
            other => Err(format!("unknown event type '{}'", other)),
        };

        parsed.unwrap_or_else(EventKind::Unrecognized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, payload: Value) -> Event {
        Event::new("g1", 1, 1, 700, event_type, Some("BOS"), payload)
    }

    #[test]
    fn test_parse_shot() {
        assert_eq!(
            event("shot", json!({"made": true, "points": 3})).kind(),
            EventKind::Shot { made: true, points: 3 }
        );
    }

    #[test]
    fn test_shot_with_bad_points_is_unrecognized() {
        assert!(matches!(
            event("shot", json!({"made": true, "points": 4})).kind(),
            EventKind::Unrecognized(_)
        ));
    }

    #[test]
    fn test_foul_defaults_to_personal() {
        assert_eq!(
            event("foul", json!({})).kind(),
            EventKind::Foul { technical: false }
        );
    }

    #[test]
    fn test_unknown_type_is_unrecognized() {
        match event("instant_replay", Value::Null).kind() {
            EventKind::Unrecognized(reason) => assert!(reason.contains("instant_replay")),
            other => panic!("expected unrecognized, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_payload_is_unrecognized() {
        assert!(matches!(
            event("substitution", Value::Null).kind(),
            EventKind::Unrecognized(_)
        ));
    }
}
