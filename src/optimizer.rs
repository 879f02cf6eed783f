//! Optimizers over the model seam.
//!
//! SGD with momentum and Adam, operating on named parameter tensors through
//! [`ImageModel::apply_delta`]. Momentum lives on param groups so the warmup
//! transition can override it in place, and the full buffer state serializes
//! into checkpoints.

use serde::{Deserialize, Serialize};

use crate::config::OptimizerChoice;
use crate::error::{Result, VisionError};
use crate::model::{ImageModel, StateDict};

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;

/// One parameter group's hyperparameters. The reference models expose a
/// single group; the warmup momentum override targets group 0 either way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    /// SGD momentum coefficient.
    pub momentum: f64,
}

/// Serializable optimizer state for checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    /// Optimizer kind; must match on restore.
    pub kind: OptimizerChoice,
    /// Current learning rate.
    pub lr: f64,
    /// Weight decay.
    pub weight_decay: f64,
    /// Param group hyperparameters.
    pub param_groups: Vec<ParamGroup>,
    /// SGD velocity buffers.
    #[serde(default)]
    pub velocity: StateDict,
    /// Adam first-moment buffers.
    #[serde(default)]
    pub adam_m: StateDict,
    /// Adam second-moment buffers.
    #[serde(default)]
    pub adam_v: StateDict,
    /// Adam step counter for bias correction.
    #[serde(default)]
    pub adam_step: u64,
}

/// Optimizer wrapper driving parameter updates.
pub struct Optimizer {
    kind: OptimizerChoice,
    lr: f64,
    weight_decay: f64,
    param_groups: Vec<ParamGroup>,
    velocity: StateDict,
    adam_m: StateDict,
    adam_v: StateDict,
    adam_step: u64,
}

impl Optimizer {
    /// Create an optimizer. Training starts with the warmup momentum; the
    /// strategy scheduler switches it to the steady value at the boundary.
    #[must_use]
    pub fn new(kind: OptimizerChoice, lr: f64, weight_decay: f64, momentum: f64) -> Self {
        Self {
            kind,
            lr,
            weight_decay,
            param_groups: vec![ParamGroup { momentum }],
            velocity: StateDict::new(),
            adam_m: StateDict::new(),
            adam_v: StateDict::new(),
            adam_step: 0,
        }
    }

    /// Perform one update step from parameter gradients.
    ///
    /// # Errors
    ///
    /// Propagates delta-application errors from the model.
    pub fn step(&mut self, model: &mut dyn ImageModel, grads: &StateDict) -> Result<()> {
        let params = model.state_dict();
        let delta = match self.kind {
            OptimizerChoice::Sgd => self.sgd_delta(&params, grads),
            OptimizerChoice::Adam => self.adam_delta(&params, grads),
        };
        model.apply_delta(&delta)
    }

    fn sgd_delta(&mut self, params: &StateDict, grads: &StateDict) -> StateDict {
        let momentum = self.param_groups[0].momentum;
        let lr = self.lr;
        let wd = self.weight_decay;
        let mut delta = StateDict::new();
        for (name, grad) in grads {
            let param = match params.get(name) {
                Some(p) => p,
                None => continue,
            };
            let velocity = self
                .velocity
                .entry(name.clone())
                .or_insert_with(|| vec![0.0; grad.len()]);
            let mut update = Vec::with_capacity(grad.len());
            for ((v, &g), &p) in velocity.iter_mut().zip(grad).zip(param) {
                let g = f64::from(g) + wd * f64::from(p);
                let d = momentum * f64::from(*v) + g;
                *v = d as f32;
                update.push((-lr * d) as f32);
            }
            delta.insert(name.clone(), update);
        }
        delta
    }

    fn adam_delta(&mut self, params: &StateDict, grads: &StateDict) -> StateDict {
        self.adam_step += 1;
        let t = self.adam_step as i32;
        let bias1 = 1.0 - ADAM_BETA1.powi(t);
        let bias2 = 1.0 - ADAM_BETA2.powi(t);
        let lr = self.lr;
        let wd = self.weight_decay;

        let mut delta = StateDict::new();
        for (name, grad) in grads {
            let param = match params.get(name) {
                Some(p) => p,
                None => continue,
            };
            let m = self
                .adam_m
                .entry(name.clone())
                .or_insert_with(|| vec![0.0; grad.len()]);
            let v = self
                .adam_v
                .entry(name.clone())
                .or_insert_with(|| vec![0.0; grad.len()]);

            let mut update = Vec::with_capacity(grad.len());
            for (((mi, vi), &g), &p) in m.iter_mut().zip(v.iter_mut()).zip(grad).zip(param) {
                let g = f64::from(g) + wd * f64::from(p);
                let m_new = ADAM_BETA1 * f64::from(*mi) + (1.0 - ADAM_BETA1) * g;
                let v_new = ADAM_BETA2 * f64::from(*vi) + (1.0 - ADAM_BETA2) * g * g;
                *mi = m_new as f32;
                *vi = v_new as f32;
                let m_hat = m_new / bias1;
                let v_hat = v_new / bias2;
                update.push((-lr * m_hat / (v_hat.sqrt() + ADAM_EPS)) as f32);
            }
            delta.insert(name.clone(), update);
        }
        delta
    }

    /// Current learning rate.
    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    /// Set the learning rate (driven by the LR scheduler).
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    /// Override the momentum on param group 0 (the warmup transition).
    /// Adam reads its betas instead and is unaffected.
    pub fn set_momentum(&mut self, momentum: f64) {
        self.param_groups[0].momentum = momentum;
    }

    /// Momentum currently set on param group 0.
    #[must_use]
    pub fn momentum(&self) -> f64 {
        self.param_groups[0].momentum
    }

    /// Snapshot the full optimizer state for a checkpoint.
    #[must_use]
    pub fn state_dict(&self) -> OptimizerState {
        OptimizerState {
            kind: self.kind,
            lr: self.lr,
            weight_decay: self.weight_decay,
            param_groups: self.param_groups.clone(),
            velocity: self.velocity.clone(),
            adam_m: self.adam_m.clone(),
            adam_v: self.adam_v.clone(),
            adam_step: self.adam_step,
        }
    }

    /// Restore from a checkpointed state.
    ///
    /// # Errors
    ///
    /// Returns a training error if the checkpoint was written by a different
    /// optimizer kind.
    pub fn load_state_dict(&mut self, state: OptimizerState) -> Result<()> {
        if state.kind != self.kind {
            return Err(VisionError::Training(format!(
                "optimizer kind mismatch: checkpoint has {:?}, config has {:?}",
                state.kind, self.kind
            )));
        }
        self.lr = state.lr;
        self.weight_decay = state.weight_decay;
        self.param_groups = state.param_groups;
        self.velocity = state.velocity;
        self.adam_m = state.adam_m;
        self.adam_v = state.adam_v;
        self.adam_step = state.adam_step;
        Ok(())
    }
}
