//! Loading predictor artifacts.

use super::baseline;
use super::{ArtifactPredictor, ModelArtifact, Predictor, PredictorKind};
use crate::config::PredictorConfig;
use crate::error::ModelLoadError;
use std::sync::Arc;
use tracing::{debug, info};

/// Turns a predictor's configuration into a usable predictor
pub trait ModelLoader: Send + Sync {
    fn load(&self, config: &PredictorConfig) -> Result<Arc<dyn Predictor>, ModelLoadError>;
}

/// Reads JSON artifacts from the filesystem
#[derive(Debug, Clone, Default)]
pub struct FileModelLoader;

impl FileModelLoader {
    pub fn new() -> Self {
        Self
    }

    /// Parse and check an artifact against the configuration that names it
    pub fn parse(config: &PredictorConfig, raw: &str) -> Result<ArtifactPredictor, ModelLoadError> {
        let corrupt = |reason: String| ModelLoadError::Corrupt {
            predictor: config.name.clone(),
            reason,
        };

        let artifact: ModelArtifact =
            serde_json::from_str(raw).map_err(|e| corrupt(e.to_string()))?;

        if artifact.predictor != config.name {
            return Err(corrupt(format!(
                "artifact belongs to predictor {}",
                artifact.predictor
            )));
        }
        if artifact.version != config.version {
            return Err(ModelLoadError::VersionMismatch {
                predictor: config.name.clone(),
                expected: config.version.clone(),
                found: artifact.version,
            });
        }
        if artifact.model.kind() != config.kind {
            return Err(ModelLoadError::KindMismatch {
                predictor: config.name.clone(),
                expected: config.kind.to_string(),
                found: artifact.model.kind().to_string(),
            });
        }

        ArtifactPredictor::new(artifact).map_err(corrupt)
    }
}

impl ModelLoader for FileModelLoader {
    fn load(&self, config: &PredictorConfig) -> Result<Arc<dyn Predictor>, ModelLoadError> {
        let path = match (&config.artifact_path, config.kind) {
            (Some(path), _) => path,
            (None, PredictorKind::Baseline) => {
                debug!(predictor = %config.name, "Using built-in baseline");
                let predictor = baseline::default_predictor(&config.name, &config.version)
                    .map_err(|reason| ModelLoadError::Corrupt {
                        predictor: config.name.clone(),
                        reason,
                    })?;
                return Ok(Arc::new(predictor));
            }
            (None, _) => {
                return Err(ModelLoadError::MissingArtifact {
                    predictor: config.name.clone(),
                })
            }
        };

        let raw = std::fs::read_to_string(path).map_err(|e| ModelLoadError::Io {
            predictor: config.name.clone(),
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let predictor = Self::parse(config, &raw)?;
        info!(
            predictor = %config.name,
            kind = %config.kind,
            version = %config.version,
            features = predictor.schema().len(),
            "Loaded model artifact"
        );
        Ok(Arc::new(predictor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    const TREE_ARTIFACT: &str = r#"{
        "predictor": "Tree",
        "version": "2024.11",
        "features": ["home_ppg", "away_ppg"],
        "allow_fallback": false,
        "model": {
            "kind": "tree",
            "home": {"base_score": 112.0, "learning_rate": 0.1, "trees": [
                {"nodes": [
                    {"split": {"feature": 0, "threshold": 115.0, "left": 1, "right": 2}},
                    {"leaf": {"value": -5.0}},
                    {"leaf": {"value": 5.0}}
                ]}
            ]},
            "away": {"base_score": 110.0, "learning_rate": 0.1, "trees": []}
        }
    }"#;

    fn config(kind: PredictorKind, version: &str, path: Option<PathBuf>) -> PredictorConfig {
        PredictorConfig {
            name: "Tree".to_string(),
            kind,
            version: version.to_string(),
            artifact_path: path,
        }
    }

    fn write_artifact(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("tree.json");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(body.as_bytes())
            .unwrap();
        path
    }

    #[test]
    fn test_load_tree_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(&dir, TREE_ARTIFACT);
        let predictor = FileModelLoader::new()
            .load(&config(PredictorKind::Tree, "2024.11", Some(path)))
            .unwrap();

        assert_eq!(predictor.name(), "Tree");
        assert_eq!(predictor.kind(), PredictorKind::Tree);
        assert!(!predictor.allow_fallback());
        assert_eq!(predictor.schema().len(), 2);
    }

    #[test]
    fn test_version_and_kind_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(&dir, TREE_ARTIFACT);
        let loader = FileModelLoader::new();

        assert!(matches!(
            loader.load(&config(PredictorKind::Tree, "2025.01", Some(path.clone()))),
            Err(ModelLoadError::VersionMismatch { found, .. }) if found == "2024.11"
        ));
        assert!(matches!(
            loader.load(&config(PredictorKind::Mlp, "2024.11", Some(path))),
            Err(ModelLoadError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_and_unreadable_artifacts() {
        let loader = FileModelLoader::new();
        assert!(matches!(
            loader.load(&config(PredictorKind::Tree, "v1", None)),
            Err(ModelLoadError::MissingArtifact { .. })
        ));
        assert!(matches!(
            loader.load(&config(PredictorKind::Tree, "v1", Some(PathBuf::from("/nonexistent/tree.json")))),
            Err(ModelLoadError::Io { .. })
        ));
    }

    #[test]
    fn test_corrupt_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(&dir, &TREE_ARTIFACT.replace("\"left\": 1", "\"left\": 7"));
        assert!(matches!(
            FileModelLoader::new().load(&config(PredictorKind::Tree, "2024.11", Some(path))),
            Err(ModelLoadError::Corrupt { .. })
        ));

        let path = write_artifact(&dir, "{ not json");
        assert!(matches!(
            FileModelLoader::new().load(&config(PredictorKind::Tree, "2024.11", Some(path))),
            Err(ModelLoadError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_baseline_needs_no_artifact() {
        let mut cfg = config(PredictorKind::Baseline, "v1", None);
        cfg.name = "Baseline".to_string();
        let predictor = FileModelLoader::new().load(&cfg).unwrap();
        assert_eq!(predictor.kind(), PredictorKind::Baseline);
        assert_eq!(predictor.version(), "v1");
    }
}
