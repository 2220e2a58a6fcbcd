//! Predictor Registry
//!
//! Holds the predictors registered from configuration and loads their
//! artifacts once per batch.

use super::{ModelLoader, Predictor};
use crate::config::PredictorConfig;
use crate::error::{ModelLoadError, PipelineError};
use crate::store::PromotionTarget;
use std::sync::Arc;
use tracing::{info, warn};

/// Registered predictors, in registration order
#[derive(Debug, Clone, Default)]
pub struct PredictorRegistry {
    configs: Vec<PredictorConfig>,
}

/// Outcome of loading a batch's predictors
#[derive(Clone, Default)]
pub struct LoadedPredictors {
    pub predictors: Vec<Arc<dyn Predictor>>,
    pub errors: Vec<ModelLoadError>,
}

impl LoadedPredictors {
    pub fn names(&self) -> Vec<String> {
        self.predictors.iter().map(|p| p.name().to_string()).collect()
    }

    /// Each loaded predictor's version is the one to serve
    pub fn promotion_targets(&self) -> Vec<PromotionTarget> {
        self.predictors
            .iter()
            .map(|p| PromotionTarget {
                predictor: p.name().to_string(),
                version: p.version().to_string(),
            })
            .collect()
    }
}

impl PredictorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: impl IntoIterator<Item = PredictorConfig>) -> Self {
        let mut registry = Self::new();
        for config in configs {
            registry.register(config);
        }
        info!(
            "PredictorRegistry initialized with {} predictors",
            registry.configs.len()
        );
        registry
    }

    /// Register a predictor, replacing any earlier one of the same name
    pub fn register(&mut self, config: PredictorConfig) {
        info!(
            "Registering predictor: {} ({} {})",
            config.name, config.kind, config.version
        );
        match self.configs.iter_mut().find(|c| c.name == config.name) {
            Some(existing) => *existing = config,
            None => self.configs.push(config),
        }
    }

    pub fn get(&self, name: &str) -> Option<&PredictorConfig> {
        self.configs.iter().find(|c| c.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.configs.iter().map(|c| c.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Load every registered predictor, or only `filter` when given.
    ///
    /// A predictor that fails to load is reported and left out; the others
    /// still load.
    pub fn load_all(
        &self,
        loader: &dyn ModelLoader,
        filter: Option<&str>,
    ) -> Result<LoadedPredictors, PipelineError> {
        let selected: Vec<&PredictorConfig> = match filter {
            Some(name) => vec![self
                .get(name)
                .ok_or_else(|| PipelineError::UnknownPredictor(name.to_string()))?],
            None => self.configs.iter().collect(),
        };

        let mut loaded = LoadedPredictors::default();
        for config in selected {
            match loader.load(config) {
                Ok(predictor) => loaded.predictors.push(predictor),
                Err(e) => {
                    warn!(predictor = %config.name, error = %e, "Predictor failed to load");
                    loaded.errors.push(e);
                }
            }
        }
        Ok(loaded)
    }
}
