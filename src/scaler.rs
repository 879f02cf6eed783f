//! Loss-scale bookkeeping for mixed-precision style training.
//!
//! Scales losses up before the backward pass, unscales gradients before the
//! optimizer step, skips steps whose gradients came out non-finite, and
//! adapts the scale: back off on overflow, grow after a run of clean steps.
//! The whole state serializes into checkpoints so a resumed run continues
//! the same adaptation trajectory.

use serde::{Deserialize, Serialize};

use crate::model::StateDict;

fn default_scale() -> f64 {
    65536.0
}

fn default_growth_factor() -> f64 {
    2.0
}

fn default_backoff_factor() -> f64 {
    0.5
}

fn default_growth_interval() -> u32 {
    2000
}

/// Serializable scaler state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    /// Current loss scale.
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Multiplier applied after `growth_interval` clean steps.
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,
    /// Multiplier applied on overflow.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Clean steps required before growing.
    #[serde(default = "default_growth_interval")]
    pub growth_interval: u32,
    /// Clean steps since the last scale change.
    #[serde(default)]
    pub growth_tracker: u32,
}

impl Default for ScalerState {
    fn default() -> Self {
        Self {
            scale: default_scale(),
            growth_factor: default_growth_factor(),
            backoff_factor: default_backoff_factor(),
            growth_interval: default_growth_interval(),
            growth_tracker: 0,
        }
    }
}

/// Gradient scaler.
pub struct GradScaler {
    state: ScalerState,
}

impl GradScaler {
    /// Create a scaler with default adaptation parameters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ScalerState::default(),
        }
    }

    /// Scale a loss value for the backward pass.
    #[must_use]
    pub fn scale_loss(&self, loss: f64) -> f64 {
        loss * self.state.scale
    }

    /// Unscale gradients in place. Returns `false` when any gradient is
    /// non-finite, in which case the step must be skipped.
    pub fn unscale(&self, grads: &mut StateDict) -> bool {
        let inv = 1.0 / self.state.scale;
        let mut finite = true;
        for tensor in grads.values_mut() {
            for g in tensor.iter_mut() {
                let v = f64::from(*g) * inv;
                if !v.is_finite() {
                    finite = false;
                }
                *g = v as f32;
            }
        }
        finite
    }

    /// Advance the adaptation state after a step attempt.
    pub fn update(&mut self, found_inf: bool) {
        if found_inf {
            self.state.scale *= self.state.backoff_factor;
            self.state.growth_tracker = 0;
        } else {
            self.state.growth_tracker += 1;
            if self.state.growth_tracker >= self.state.growth_interval {
                self.state.scale *= self.state.growth_factor;
                self.state.growth_tracker = 0;
            }
        }
    }

    /// Current loss scale.
    #[must_use]
    pub fn scale(&self) -> f64 {
        self.state.scale
    }

    /// Snapshot for checkpoints.
    #[must_use]
    pub fn state_dict(&self) -> ScalerState {
        self.state.clone()
    }

    /// Restore from a checkpointed state.
    pub fn load_state_dict(&mut self, state: ScalerState) {
        self.state = state;
    }
}

impl Default for GradScaler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_and_unscale_round_trip() {
        let scaler = GradScaler::new();
        let scaled = scaler.scale_loss(0.5);
        assert!((scaled - 0.5 * 65536.0).abs() < 1e-9);

        let mut grads = StateDict::new();
        grads.insert("bias".into(), vec![65536.0, -65536.0]);
        assert!(scaler.unscale(&mut grads));
        assert_eq!(grads["bias"], vec![1.0, -1.0]);
    }

    #[test]
    fn test_unscale_flags_non_finite() {
        let scaler = GradScaler::new();
        let mut grads = StateDict::new();
        grads.insert("bias".into(), vec![f32::INFINITY]);
        assert!(!scaler.unscale(&mut grads));
    }

    #[test]
    fn test_backoff_on_overflow() {
        let mut scaler = GradScaler::new();
        let before = scaler.scale();
        scaler.update(true);
        assert!((scaler.scale() - before * 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_growth_after_interval() {
        let mut scaler = GradScaler::new();
        let mut state = scaler.state_dict();
        state.growth_interval = 3;
        scaler.load_state_dict(state);

        let before = scaler.scale();
        scaler.update(false);
        scaler.update(false);
        assert!((scaler.scale() - before).abs() < 1e-9);
        scaler.update(false);
        assert!((scaler.scale() - before * 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_state_round_trip() {
        let mut scaler = GradScaler::new();
        scaler.update(true);
        scaler.update(false);

        let state = scaler.state_dict();
        let json = serde_json::to_string(&state).unwrap();
        let restored: ScalerState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, restored);
    }
}
