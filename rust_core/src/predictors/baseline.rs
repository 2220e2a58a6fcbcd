//! Baseline predictor: trailing points for and against plus home court.
//!
//! Needs no trained artifact. Each side's expected score is the mean of its
//! own scoring rate and the opponent's points allowed, shifted by half the
//! home-court edge.

use super::{ArtifactPredictor, ModelArtifact, ModelBody};
use serde::{Deserialize, Serialize};

/// Inputs the baseline reads
pub const BASELINE_FEATURES: &[&str] = &["home_ppg", "away_ppg", "home_opp_ppg", "away_opp_ppg"];

fn default_home_court_points() -> f64 {
    2.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineModel {
    #[serde(default = "default_home_court_points")]
    pub home_court_points: f64,
}

impl Default for BaselineModel {
    fn default() -> Self {
        Self {
            home_court_points: default_home_court_points(),
        }
    }
}

impl BaselineModel {
    pub(crate) fn validate(&self, schema: &[String]) -> Result<(), String> {
        if !self.home_court_points.is_finite() {
            return Err("home_court_points is not finite".to_string());
        }
        match BASELINE_FEATURES
            .iter()
            .find(|name| !schema.iter().any(|s| s == *name))
        {
            Some(missing) => Err(format!("baseline needs feature '{}'", missing)),
            None => Ok(()),
        }
    }

    pub(crate) fn scores(&self, schema: &[String], inputs: &[f64]) -> (f64, f64) {
        let value = |name: &str| {
            schema
                .iter()
                .position(|s| s == name)
                .and_then(|idx| inputs.get(idx).copied())
                .unwrap_or(0.0)
        };

        let half_edge = self.home_court_points / 2.0;
        let home = (value("home_ppg") + value("away_opp_ppg")) / 2.0 + half_edge;
        let away = (value("away_ppg") + value("home_opp_ppg")) / 2.0 - half_edge;
        (home, away)
    }
}

/// Baseline predictor for a configured name and version, no artifact file
pub fn default_predictor(name: &str, version: &str) -> Result<ArtifactPredictor, String> {
    ArtifactPredictor::new(ModelArtifact {
        predictor: name.to_string(),
        version: version.to_string(),
        features: BASELINE_FEATURES.iter().map(|s| s.to_string()).collect(),
        allow_fallback: true,
        model: ModelBody::Baseline(BaselineModel::default()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AsOf, FeatureVector};
    use crate::predictors::Predictor;

    fn features() -> FeatureVector {
        FeatureVector {
            game_id: "g1".to_string(),
            as_of: AsOf::Final,
            values: [
                ("home_ppg", 118.0),
                ("away_ppg", 110.0),
                ("home_opp_ppg", 108.0),
                ("away_opp_ppg", 114.0),
            ]
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect(),
            fallbacks: vec![],
        }
    }

    #[test]
    fn test_baseline_scores() {
        let predictor = default_predictor("Baseline", "v1").unwrap();
        let out = predictor.predict(&features()).unwrap();

        assert!((out.home_score - 117.25).abs() < 1e-9);
        assert!((out.away_score - 107.75).abs() < 1e-9);
        assert!((out.margin - 9.5).abs() < 1e-9);
        assert!(out.home_win_prob > 0.5);
        assert_eq!(predictor.version(), "v1");
    }

    #[test]
    fn test_baseline_requires_its_inputs() {
        let model = BaselineModel::default();
        let schema = vec!["home_ppg".to_string(), "away_ppg".to_string()];
        assert!(model.validate(&schema).unwrap_err().contains("home_opp_ppg"));
    }
}
