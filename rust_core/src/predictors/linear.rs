//! Linear regression: one intercept and weight map per side.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearSide {
    pub intercept: f64,
    /// Feature name -> coefficient; absent features weigh zero
    pub weights: BTreeMap<String, f64>,
}

impl LinearSide {
    fn predict(&self, schema: &[String], inputs: &[f64]) -> f64 {
        schema
            .iter()
            .zip(inputs)
            .filter_map(|(name, x)| self.weights.get(name).map(|w| w * x))
            .sum::<f64>()
            + self.intercept
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub home: LinearSide,
    pub away: LinearSide,
}

impl LinearModel {
    pub(crate) fn validate(&self, schema: &[String]) -> Result<(), String> {
        for (side, params) in [("home", &self.home), ("away", &self.away)] {
            if !params.intercept.is_finite() {
                return Err(format!("{} intercept is not finite", side));
            }
            for (name, weight) in &params.weights {
                if !schema.contains(name) {
                    return Err(format!("{} weight for '{}' not in schema", side, name));
                }
                if !weight.is_finite() {
                    return Err(format!("{} weight for '{}' is not finite", side, name));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn scores(&self, schema: &[String], inputs: &[f64]) -> (f64, f64) {
        (
            self.home.predict(schema, inputs),
            self.away.predict(schema, inputs),
        )
    }
}
