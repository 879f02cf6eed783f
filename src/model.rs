//! Model collaborator.
//!
//! The trainer is framework-agnostic: it needs a forward pass, a logits
//! gradient turned into parameter gradients, and a serializable snapshot of
//! the trainable parameters. Anything satisfying [`ImageModel`] plugs in. The
//! crate ships a pooled-feature linear classifier as the reference
//! implementation so the loop runs end to end; real backbones live behind the
//! same seam.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::ModelConfig;
use crate::error::{Result, VisionError};

/// Serializable snapshot of named parameter tensors.
pub type StateDict = BTreeMap<String, Vec<f32>>;

/// The model seam the epoch runner drives.
///
/// Implementations own their parameters; the optimizer updates them through
/// [`ImageModel::apply_delta`], and checkpoints round-trip through
/// [`ImageModel::state_dict`] / [`ImageModel::load_state_dict`].
pub trait ImageModel: Send {
    /// Number of output classes.
    fn num_classes(&self) -> usize;

    /// Forward pass: one logits row per feature row.
    fn forward(&self, features: &[Vec<f32>]) -> Vec<Vec<f32>>;

    /// Turn a logits gradient into parameter gradients for the same batch.
    fn backward(&self, features: &[Vec<f32>], grad_logits: &[Vec<f32>]) -> StateDict;

    /// Add `delta` to the parameters, tensor by tensor.
    ///
    /// # Errors
    ///
    /// Returns a model error on unknown tensor names or length mismatches.
    fn apply_delta(&mut self, delta: &StateDict) -> Result<()>;

    /// Snapshot of all trainable parameters.
    fn state_dict(&self) -> StateDict;

    /// Restore parameters from a snapshot, verbatim.
    ///
    /// # Errors
    ///
    /// Returns a model error on missing tensors or length mismatches.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;

    /// Total number of trainable scalars.
    fn parameter_count(&self) -> usize;
}

/// Linear classifier over pooled image features.
///
/// Features are the adaptive-average-pooled RGB grid the dataset produces,
/// which keeps the input length fixed while progressive learning changes the
/// training resolution.
pub struct PooledLinearModel {
    num_classes: usize,
    feature_len: usize,
    weight: Vec<f32>,
    bias: Vec<f32>,
}

impl PooledLinearModel {
    /// Build with small random weights drawn from the seed.
    #[must_use]
    pub fn new(num_classes: usize, feature_len: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let scale = 1.0 / (feature_len as f64).sqrt();
        let weight = (0..num_classes * feature_len)
            .map(|_| (rng.gen::<f64>() * 2.0 - 1.0) as f32 * scale as f32)
            .collect();
        Self {
            num_classes,
            feature_len,
            weight,
            bias: vec![0.0; num_classes],
        }
    }

    fn check_len(name: &str, expected: usize, got: usize) -> Result<()> {
        if expected != got {
            return Err(VisionError::Model(format!(
                "tensor `{name}` length mismatch: expected {expected}, got {got}"
            )));
        }
        Ok(())
    }
}

impl ImageModel for PooledLinearModel {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn forward(&self, features: &[Vec<f32>]) -> Vec<Vec<f32>> {
        features
            .iter()
            .map(|x| {
                (0..self.num_classes)
                    .map(|c| {
                        let row = &self.weight[c * self.feature_len..(c + 1) * self.feature_len];
                        let dot: f64 = row
                            .iter()
                            .zip(x)
                            .map(|(&w, &v)| f64::from(w) * f64::from(v))
                            .sum();
                        (dot + f64::from(self.bias[c])) as f32
                    })
                    .collect()
            })
            .collect()
    }

    fn backward(&self, features: &[Vec<f32>], grad_logits: &[Vec<f32>]) -> StateDict {
        let mut grad_weight = vec![0.0f32; self.num_classes * self.feature_len];
        let mut grad_bias = vec![0.0f32; self.num_classes];

        for (x, g) in features.iter().zip(grad_logits) {
            for c in 0..self.num_classes {
                let gc = g[c];
                grad_bias[c] += gc;
                let row = &mut grad_weight[c * self.feature_len..(c + 1) * self.feature_len];
                for (w, &v) in row.iter_mut().zip(x) {
                    *w += gc * v;
                }
            }
        }

        let mut grads = StateDict::new();
        grads.insert("weight".into(), grad_weight);
        grads.insert("bias".into(), grad_bias);
        grads
    }

    fn apply_delta(&mut self, delta: &StateDict) -> Result<()> {
        for (name, values) in delta {
            let param: &mut Vec<f32> = match name.as_str() {
                "weight" => &mut self.weight,
                "bias" => &mut self.bias,
                other => {
                    return Err(VisionError::Model(format!(
                        "unknown parameter tensor `{other}`"
                    )))
                }
            };
            Self::check_len(name, param.len(), values.len())?;
            for (p, &d) in param.iter_mut().zip(values) {
                *p += d;
            }
        }
        Ok(())
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert("weight".into(), self.weight.clone());
        state.insert("bias".into(), self.bias.clone());
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let weight = state
            .get("weight")
            .ok_or_else(|| VisionError::Model("state dict missing `weight`".into()))?;
        let bias = state
            .get("bias")
            .ok_or_else(|| VisionError::Model("state dict missing `bias`".into()))?;
        Self::check_len("weight", self.weight.len(), weight.len())?;
        Self::check_len("bias", self.bias.len(), bias.len())?;
        self.weight.clone_from(weight);
        self.bias.clone_from(bias);
        Ok(())
    }

    fn parameter_count(&self) -> usize {
        self.weight.len() + self.bias.len()
    }
}

/// Build a model from its configured source tag.
///
/// Both recognized families currently resolve to the reference classifier;
/// the tag is the seam where real backbones attach. Pretrained weight
/// sourcing is external to this crate — the flag only drives validation.
///
/// # Errors
///
/// Returns a model error for an unrecognized family tag.
pub fn build_model(
    config: &ModelConfig,
    feature_len: usize,
    seed: u64,
) -> Result<Box<dyn ImageModel>> {
    let family = config.choice.split('-').next().unwrap_or_default();
    match family {
        "torchvision" | "custom" => Ok(Box::new(PooledLinearModel::new(
            config.num_classes,
            feature_len,
            seed,
        ))),
        other => Err(VisionError::Model(format!(
            "unrecognized model family `{other}` in choice `{}`",
            config.choice
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> PooledLinearModel {
        PooledLinearModel::new(3, 4, 0)
    }

    #[test]
    fn test_forward_shape() {
        let m = model();
        let logits = m.forward(&[vec![0.1, 0.2, 0.3, 0.4], vec![0.0; 4]]);
        assert_eq!(logits.len(), 2);
        assert!(logits.iter().all(|row| row.len() == 3));
    }

    #[test]
    fn test_backward_shapes() {
        let m = model();
        let features = vec![vec![0.1, 0.2, 0.3, 0.4]];
        let grads = m.backward(&features, &[vec![1.0, 0.0, -1.0]]);
        assert_eq!(grads["weight"].len(), 12);
        assert_eq!(grads["bias"].len(), 3);
        // Bias gradient is the logits gradient summed over the batch.
        assert_eq!(grads["bias"], vec![1.0, 0.0, -1.0]);
    }

    #[test]
    fn test_apply_delta_moves_parameters() {
        let mut m = model();
        let before = m.state_dict();

        let mut delta = StateDict::new();
        delta.insert("bias".into(), vec![1.0, -1.0, 0.5]);
        m.apply_delta(&delta).unwrap();

        let after = m.state_dict();
        assert_eq!(after["weight"], before["weight"]);
        assert_eq!(after["bias"][0], before["bias"][0] + 1.0);
    }

    #[test]
    fn test_apply_delta_rejects_unknown_tensor() {
        let mut m = model();
        let mut delta = StateDict::new();
        delta.insert("gamma".into(), vec![0.0]);
        assert!(m.apply_delta(&delta).is_err());
    }

    #[test]
    fn test_state_dict_round_trip() {
        let m = model();
        let state = m.state_dict();

        let mut other = PooledLinearModel::new(3, 4, 99);
        assert_ne!(other.state_dict(), state);
        other.load_state_dict(&state).unwrap();
        assert_eq!(other.state_dict(), state);
    }

    #[test]
    fn test_load_rejects_shape_mismatch() {
        let mut m = model();
        let mut state = m.state_dict();
        state.insert("bias".into(), vec![0.0; 7]);
        assert!(m.load_state_dict(&state).is_err());
    }

    #[test]
    fn test_gradient_descends_loss() {
        // A few hand-rolled sgd steps should reduce a simple ce loss.
        use crate::loss::Loss;

        let mut m = PooledLinearModel::new(2, 4, 1);
        let features = vec![vec![1.0, 0.0, 0.0, 0.0], vec![0.0, 1.0, 0.0, 0.0]];
        let labels = vec![0usize, 1];
        let loss = Loss::CrossEntropy { label_smooth: 0.0 };

        let first = loss.compute(&m.forward(&features), &labels).loss;
        for _ in 0..50 {
            let out = loss.compute(&m.forward(&features), &labels);
            let grads = m.backward(&features, &out.grad_logits);
            let delta: StateDict = grads
                .into_iter()
                .map(|(k, g)| (k, g.into_iter().map(|v| -1.0 * v).collect()))
                .collect();
            m.apply_delta(&delta).unwrap();
        }
        let last = loss.compute(&m.forward(&features), &labels).loss;
        assert!(last < first);
    }

    #[test]
    fn test_build_model_families() {
        let config = ModelConfig {
            choice: "torchvision-shufflenet_v2_x1_0".into(),
            num_classes: 5,
            pretrained: false,
            kwargs: BTreeMap::new(),
        };
        assert!(build_model(&config, 48, 0).is_ok());

        let config = ModelConfig {
            choice: "custom-linear".into(),
            ..config
        };
        assert!(build_model(&config, 48, 0).is_ok());

        let config = ModelConfig {
            choice: "keras-resnet".into(),
            ..config
        };
        assert!(build_model(&config, 48, 0).is_err());
    }
}
