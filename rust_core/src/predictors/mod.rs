//! Predictors and their trained artifacts.
//!
//! A predictor maps a [`FeatureVector`] to predicted final scores. Four model
//! families are supported; each is loaded from a JSON [`ModelArtifact`] whose
//! header declares the predictor name, artifact version and the feature
//! schema the model body was trained on.

use crate::error::FeatureError;
use crate::features::is_known_feature;
use crate::models::{AsOf, FeatureVector, REGULATION_SECONDS};
use crate::win_prob::{blend_with_prior, margin_to_win_prob};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod baseline;
pub mod linear;
pub mod loader;
pub mod mlp;
pub mod registry;
pub mod tree;

pub use baseline::BaselineModel;
pub use linear::LinearModel;
pub use loader::{FileModelLoader, ModelLoader};
pub use mlp::MlpModel;
pub use registry::{LoadedPredictors, PredictorRegistry};
pub use tree::TreeModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictorKind {
    Baseline,
    Linear,
    Tree,
    Mlp,
}

impl PredictorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictorKind::Baseline => "baseline",
            PredictorKind::Linear => "linear",
            PredictorKind::Tree => "tree",
            PredictorKind::Mlp => "mlp",
        }
    }
}

impl fmt::Display for PredictorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a predictor produces for one feature vector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictorOutput {
    pub home_score: f64,
    pub away_score: f64,
    pub margin: f64,
    pub home_win_prob: f64,
}

pub trait Predictor: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> PredictorKind;

    /// Artifact version the predictions are tagged with
    fn version(&self) -> &str;

    /// Features the model consumes, in input order
    fn schema(&self) -> &[String];

    /// Whether league-prior substitutions are acceptable inputs
    fn allow_fallback(&self) -> bool;

    fn predict(&self, features: &FeatureVector) -> Result<PredictorOutput, FeatureError>;
}

// ============================================================================
// Artifacts
// ============================================================================

/// Model parameters, tagged by family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelBody {
    Baseline(BaselineModel),
    Linear(LinearModel),
    Tree(TreeModel),
    Mlp(MlpModel),
}

impl ModelBody {
    pub fn kind(&self) -> PredictorKind {
        match self {
            ModelBody::Baseline(_) => PredictorKind::Baseline,
            ModelBody::Linear(_) => PredictorKind::Linear,
            ModelBody::Tree(_) => PredictorKind::Tree,
            ModelBody::Mlp(_) => PredictorKind::Mlp,
        }
    }

    /// Check the body is consistent with the declared schema
    pub fn validate(&self, schema: &[String]) -> Result<(), String> {
        match self {
            ModelBody::Baseline(model) => model.validate(schema),
            ModelBody::Linear(model) => model.validate(schema),
            ModelBody::Tree(model) => model.validate(schema),
            ModelBody::Mlp(model) => model.validate(schema),
        }
    }

    /// Predicted (home, away) scores for an input row selected by `schema`
    fn scores(&self, schema: &[String], inputs: &[f64]) -> (f64, f64) {
        match self {
            ModelBody::Baseline(model) => model.scores(schema, inputs),
            ModelBody::Linear(model) => model.scores(schema, inputs),
            ModelBody::Tree(model) => model.scores(inputs),
            ModelBody::Mlp(model) => model.scores(inputs),
        }
    }
}

/// On-disk artifact: header plus model body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelArtifact {
    pub predictor: String,
    pub version: String,
    pub features: Vec<String>,
    #[serde(default = "default_allow_fallback")]
    pub allow_fallback: bool,
    pub model: ModelBody,
}

fn default_allow_fallback() -> bool {
    true
}

impl ModelArtifact {
    pub fn validate(&self) -> Result<(), String> {
        if self.features.is_empty() {
            return Err("empty feature schema".to_string());
        }
        if let Some(unknown) = self.features.iter().find(|f| !is_known_feature(f)) {
            return Err(format!("schema names unknown feature '{}'", unknown));
        }
        self.model.validate(&self.features)
    }
}

/// A loaded, validated artifact
#[derive(Debug, Clone)]
pub struct ArtifactPredictor {
    artifact: ModelArtifact,
}

impl ArtifactPredictor {
    pub fn new(artifact: ModelArtifact) -> Result<Self, String> {
        artifact.validate()?;
        Ok(Self { artifact })
    }
}

impl Predictor for ArtifactPredictor {
    fn name(&self) -> &str {
        &self.artifact.predictor
    }

    fn kind(&self) -> PredictorKind {
        self.artifact.model.kind()
    }

    fn version(&self) -> &str {
        &self.artifact.version
    }

    fn schema(&self) -> &[String] {
        &self.artifact.features
    }

    fn allow_fallback(&self) -> bool {
        self.artifact.allow_fallback
    }

    fn predict(&self, features: &FeatureVector) -> Result<PredictorOutput, FeatureError> {
        let inputs = features.select(&self.artifact.features, self.artifact.allow_fallback)?;
        let (home, away) = self.artifact.model.scores(&self.artifact.features, &inputs);
        Ok(finish_output(features, home, away))
    }
}

/// Clamp raw scores and derive margin and win probability.
///
/// Mid-game vectors blend the model's probability with the live estimate,
/// weighting the live side more as the game progresses.
fn finish_output(features: &FeatureVector, home: f64, away: f64) -> PredictorOutput {
    let home_score = home.max(0.0);
    let away_score = away.max(0.0);
    let margin = home_score - away_score;
    let prior = margin_to_win_prob(margin);

    let home_win_prob = match (features.as_of, features.get("live_home_win_prob")) {
        (AsOf::Event(_), Some(live)) => {
            let elapsed = features.get("elapsed_seconds").unwrap_or(0.0);
            blend_with_prior(prior, live, elapsed / REGULATION_SECONDS as f64)
        }
        _ => prior,
    };

    PredictorOutput {
        home_score,
        away_score,
        margin,
        home_win_prob,
    }
}
