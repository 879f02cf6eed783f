//! Averaged-model weights.
//!
//! A smoothed copy of the model parameters, updated by exponential moving
//! average after every optimizer step. The decay ramps with the update count,
//! so the restored counter must match exactly for the averaging schedule to
//! continue where it left off.

use serde::{Deserialize, Serialize};

use crate::model::{ImageModel, StateDict};

fn default_decay() -> f64 {
    0.9999
}

fn default_tau() -> f64 {
    2000.0
}

/// Serializable EMA state for checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmaState {
    /// Averaged parameter tensors.
    pub ema: StateDict,
    /// Number of updates applied so far.
    pub updates: u64,
}

/// Exponential moving average of model weights.
pub struct ModelEma {
    ema: StateDict,
    updates: u64,
    decay: f64,
    tau: f64,
}

impl ModelEma {
    /// Start averaging from the model's current weights.
    #[must_use]
    pub fn new(model: &dyn ImageModel) -> Self {
        Self {
            ema: model.state_dict(),
            updates: 0,
            decay: default_decay(),
            tau: default_tau(),
        }
    }

    /// Effective decay after `updates` steps: ramps from 0 toward the
    /// asymptotic decay so early averages track the model closely.
    #[must_use]
    pub fn decay_at(&self, updates: u64) -> f64 {
        self.decay * (1.0 - (-(updates as f64) / self.tau).exp())
    }

    /// Fold the model's current weights into the average.
    pub fn update(&mut self, model: &dyn ImageModel) {
        self.updates += 1;
        let d = self.decay_at(self.updates);
        let current = model.state_dict();
        for (name, avg) in &mut self.ema {
            if let Some(param) = current.get(name) {
                for (a, &p) in avg.iter_mut().zip(param) {
                    *a = (f64::from(*a) * d + f64::from(p) * (1.0 - d)) as f32;
                }
            }
        }
    }

    /// The averaged weights.
    #[must_use]
    pub fn state_dict(&self) -> &StateDict {
        &self.ema
    }

    /// Updates applied so far.
    #[must_use]
    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Snapshot for checkpoints.
    #[must_use]
    pub fn snapshot(&self) -> EmaState {
        EmaState {
            ema: self.ema.clone(),
            updates: self.updates,
        }
    }

    /// Restore averaged weights and the update counter verbatim.
    pub fn restore(&mut self, state: EmaState) {
        self.ema = state.ema;
        self.updates = state.updates;
    }
}
