//! Pipeline configuration.
//!
//! Loaded from a JSON file, then selectively overridden from the environment:
//! - `DATABASE_URL`
//! - `PIPELINE_MAX_WORKERS`
//! - `PIPELINE_LIVE_PREDICTIONS`
//! - `PIPELINE_RECOMPUTE_FEATURES`

use crate::audit::AuditThresholds;
use crate::error::ConfigError;
use crate::features::LeaguePrior;
use crate::predictors::PredictorKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use tracing::info;

fn default_min_history_games() -> u32 {
    5
}

fn default_max_workers() -> usize {
    4
}

/// One registered predictor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PredictorConfig {
    pub name: String,
    pub kind: PredictorKind,
    /// Target artifact version; promotion activates rows at this version
    pub version: String,
    /// Relative paths resolve against the config file's directory
    #[serde(default)]
    pub artifact_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Seasons the pipeline accepts, e.g. "2024-2025"
    pub valid_seasons: Vec<String>,
    #[serde(default)]
    pub predictors: Vec<PredictorConfig>,
    #[serde(default)]
    pub audit: AuditThresholds,
    #[serde(default)]
    pub league_prior: LeaguePrior,
    /// Games of history a team needs before its own rates replace the prior
    #[serde(default = "default_min_history_games")]
    pub min_history_games: u32,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Also predict games still in progress
    #[serde(default)]
    pub live_predictions: bool,
    /// Recompute final feature vectors even when stored ones are current
    #[serde(default)]
    pub recompute_features: bool,
    #[serde(default)]
    pub database_url: Option<String>,
}

impl PipelineConfig {
    /// Read, override from the environment and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let mut config: PipelineConfig = serde_json::from_str(&raw)?;
        if let Some(dir) = path.parent() {
            config.resolve_artifact_paths(dir);
        }
        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;

        info!(
            path = %path.display(),
            seasons = config.valid_seasons.len(),
            predictors = config.predictors.len(),
            max_workers = config.max_workers,
            live_predictions = config.live_predictions,
            "Pipeline config loaded"
        );
        Ok(config)
    }

    fn resolve_artifact_paths(&mut self, base: &Path) {
        for predictor in &mut self.predictors {
            if let Some(artifact) = predictor.artifact_path.as_mut() {
                if artifact.is_relative() {
                    *artifact = base.join(&*artifact);
                }
            }
        }
    }

    /// Apply overrides from a key lookup (the process environment in production)
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(workers) = lookup("PIPELINE_MAX_WORKERS").and_then(|v| v.parse().ok()) {
            self.max_workers = workers;
        }
        if let Some(live) = lookup("PIPELINE_LIVE_PREDICTIONS") {
            self.live_predictions = parse_flag(&live);
        }
        if let Some(recompute) = lookup("PIPELINE_RECOMPUTE_FEATURES") {
            self.recompute_features = parse_flag(&recompute);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.valid_seasons.is_empty() {
            return Err(ConfigError::Invalid("valid_seasons is empty".to_string()));
        }
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".to_string()));
        }

        let mut seen = HashSet::new();
        for predictor in &self.predictors {
            if !seen.insert(predictor.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "predictor {} registered twice",
                    predictor.name
                )));
            }
            if predictor.version.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "predictor {} has an empty version",
                    predictor.name
                )));
            }
        }

        self.audit.validate().map_err(ConfigError::Invalid)
    }

    pub fn is_valid_season(&self, season_id: &str) -> bool {
        self.valid_seasons.iter().any(|s| s == season_id)
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "valid_seasons": ["2023-2024", "2024-2025"],
        "predictors": [
            {"name": "Baseline", "kind": "baseline", "version": "v1"},
            {"name": "Linear", "kind": "linear", "version": "v3", "artifact_path": "models/linear.json"}
        ],
        "audit": {"min_states": 300, "max_states": 800, "max_fallback_ratio": 0.25},
        "max_workers": 8
    }"#;

    #[test]
    fn test_load_resolves_relative_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(SAMPLE.as_bytes())
            .unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert!(config.is_valid_season("2024-2025"));
        assert!(!config.is_valid_season("2019-2020"));
        assert_eq!(config.min_history_games, 5);
        assert_eq!(
            config.predictors[1].artifact_path.as_deref(),
            Some(dir.path().join("models/linear.json").as_path())
        );
        assert_eq!(config.predictors[1].kind, PredictorKind::Linear);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = serde_json::from_str::<PipelineConfig>(
            r#"{"valid_seasons": ["2024-2025"], "max_wrokers": 3}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config: PipelineConfig = serde_json::from_str(SAMPLE).unwrap();
        let env: HashMap<&str, &str> = [
            ("PIPELINE_MAX_WORKERS", "2"),
            ("PIPELINE_LIVE_PREDICTIONS", "true"),
            ("DATABASE_URL", "postgres://localhost/hoopcast"),
        ]
        .into_iter()
        .collect();

        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.max_workers, 2);
        assert!(config.live_predictions);
        assert!(!config.recompute_features);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/hoopcast"));
    }

    #[test]
    fn test_validation() {
        let mut config: PipelineConfig = serde_json::from_str(SAMPLE).unwrap();
        assert!(config.validate().is_ok());

        config.predictors[1].name = "Baseline".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config: PipelineConfig = serde_json::from_str(SAMPLE).unwrap();
        config.audit.min_states = 900;
        assert!(config.validate().is_err());

        config = serde_json::from_str(r#"{"valid_seasons": []}"#).unwrap();
        assert!(config.validate().is_err());
    }
}
