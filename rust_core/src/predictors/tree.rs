//! Gradient-boosted regression trees.
//!
//! Each side is an ensemble: `base_score + learning_rate * sum(tree(x))`.
//! Trees are stored as flat node arrays; a split's children must come after
//! it, which rules out cycles and bounds evaluation by the node count.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    /// Go left when `x[feature] < threshold`
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

impl Tree {
    fn validate(&self, n_features: usize) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("empty tree".to_string());
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            match node {
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    if *feature >= n_features {
                        return Err(format!(
                            "node {} splits on feature {} but schema has {}",
                            idx, feature, n_features
                        ));
                    }
                    if !threshold.is_finite() {
                        return Err(format!("node {} threshold is not finite", idx));
                    }
                    for child in [left, right] {
                        if *child <= idx || *child >= self.nodes.len() {
                            return Err(format!("node {} child {} out of range", idx, child));
                        }
                    }
                }
                Node::Leaf { value } => {
                    if !value.is_finite() {
                        return Err(format!("node {} leaf is not finite", idx));
                    }
                }
            }
        }
        Ok(())
    }

    fn evaluate(&self, inputs: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match self.nodes.get(idx) {
                Some(Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    let x = inputs.get(*feature).copied().unwrap_or(0.0);
                    idx = if x < *threshold { *left } else { *right };
                }
                Some(Node::Leaf { value }) => return *value,
                None => return 0.0,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEnsemble {
    pub base_score: f64,
    pub learning_rate: f64,
    pub trees: Vec<Tree>,
}

impl TreeEnsemble {
    fn predict(&self, inputs: &[f64]) -> f64 {
        self.base_score
            + self.learning_rate * self.trees.iter().map(|t| t.evaluate(inputs)).sum::<f64>()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeModel {
    pub home: TreeEnsemble,
    pub away: TreeEnsemble,
}

impl TreeModel {
    pub(crate) fn validate(&self, schema: &[String]) -> Result<(), String> {
        for (side, ensemble) in [("home", &self.home), ("away", &self.away)] {
            if !(ensemble.learning_rate > 0.0 && ensemble.learning_rate.is_finite()) {
                return Err(format!("{} learning_rate must be positive", side));
            }
            for (i, tree) in ensemble.trees.iter().enumerate() {
                tree.validate(schema.len())
                    .map_err(|e| format!("{} tree {}: {}", side, i, e))?;
            }
        }
        Ok(())
    }

    pub(crate) fn scores(&self, inputs: &[f64]) -> (f64, f64) {
        (self.home.predict(inputs), self.away.predict(inputs))
    }
}
