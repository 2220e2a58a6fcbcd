//! Multi-layer perceptron: dense layers, ReLU between them, two linear
//! outputs (home score, away score).
//!
//! Inputs are standardised with the training mean and scale when those are
//! present in the artifact.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    /// One row per output unit, one column per input
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
}

impl DenseLayer {
    fn input_dim(&self) -> usize {
        self.weights.first().map(Vec::len).unwrap_or(0)
    }

    fn forward(&self, inputs: &[f64]) -> Vec<f64> {
        self.weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| row.iter().zip(inputs).map(|(w, x)| w * x).sum::<f64>() + b)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlpModel {
    #[serde(default)]
    pub input_mean: Option<Vec<f64>>,
    #[serde(default)]
    pub input_scale: Option<Vec<f64>>,
    pub layers: Vec<DenseLayer>,
}

impl MlpModel {
    pub(crate) fn validate(&self, schema: &[String]) -> Result<(), String> {
        for (name, stats) in [("input_mean", &self.input_mean), ("input_scale", &self.input_scale)] {
            if let Some(stats) = stats {
                if stats.len() != schema.len() {
                    return Err(format!(
                        "{} has {} entries for {} features",
                        name,
                        stats.len(),
                        schema.len()
                    ));
                }
            }
        }
        if let Some(scale) = &self.input_scale {
            if scale.iter().any(|s| *s == 0.0 || !s.is_finite()) {
                return Err("input_scale contains zero or non-finite entries".to_string());
            }
        }

        let mut width = schema.len();
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.weights.is_empty() || layer.weights.len() != layer.bias.len() {
                return Err(format!(
                    "layer {} has {} weight rows and {} biases",
                    i,
                    layer.weights.len(),
                    layer.bias.len()
                ));
            }
            if layer.weights.iter().any(|row| row.len() != width) {
                return Err(format!(
                    "layer {} expects {} inputs, previous width is {}",
                    i,
                    layer.input_dim(),
                    width
                ));
            }
            width = layer.weights.len();
        }

        if self.layers.is_empty() || width != 2 {
            return Err(format!("output layer must have 2 units, has {}", width));
        }
        Ok(())
    }

    pub(crate) fn scores(&self, inputs: &[f64]) -> (f64, f64) {
        let mut activations: Vec<f64> = inputs
            .iter()
            .enumerate()
            .map(|(i, x)| {
                let mean = self.input_mean.as_ref().and_then(|m| m.get(i)).copied().unwrap_or(0.0);
                let scale = self.input_scale.as_ref().and_then(|s| s.get(i)).copied().unwrap_or(1.0);
                (x - mean) / scale
            })
            .collect();

        let last = self.layers.len().saturating_sub(1);
        for (i, layer) in self.layers.iter().enumerate() {
            activations = layer.forward(&activations);
            if i < last {
                activations.iter_mut().for_each(|a| *a = a.max(0.0));
            }
        }

        (
            activations.first().copied().unwrap_or(0.0),
            activations.get(1).copied().unwrap_or(0.0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("f{}", i)).collect()
    }

    fn model() -> MlpModel {
        MlpModel {
            input_mean: Some(vec![100.0, 100.0]),
            input_scale: Some(vec![10.0, 10.0]),
            layers: vec![
                DenseLayer {
                    weights: vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![-1.0, -1.0]],
                    bias: vec![0.0, 0.0, 0.0],
                },
                DenseLayer {
                    weights: vec![vec![10.0, 0.0, 1.0], vec![0.0, 10.0, 1.0]],
                    bias: vec![100.0, 100.0],
                },
            ],
        }
    }

    #[test]
    fn test_forward_pass_with_relu() {
        // standardised inputs (1.0, -0.5) -> hidden (1.0, 0.0, 0.0) after ReLU
        let (home, away) = model().scores(&[110.0, 95.0]);
        assert!((home - 110.0).abs() < 1e-9);
        assert!((away - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_validate_dimensions() {
        assert!(model().validate(&schema(2)).is_ok());
        assert!(model().validate(&schema(3)).is_err());

        let mut wrong_output = model();
        wrong_output.layers.pop();
        assert!(wrong_output
            .validate(&schema(2))
            .unwrap_err()
            .contains("2 units"));

        let mut zero_scale = model();
        zero_scale.input_scale = Some(vec![0.0, 1.0]);
        assert!(zero_scale.validate(&schema(2)).is_err());
    }
}
