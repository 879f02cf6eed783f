//! Epoch-wise learning rate schedules.

use serde::{Deserialize, Serialize};

use crate::config::SchedulerChoice;
use crate::optimizer::Optimizer;

/// Serializable scheduler state for checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerState {
    /// Last epoch the schedule was stepped to.
    pub current_epoch: i64,
}

/// Learning rate scheduler, stepped once per epoch.
///
/// The `*_with_warm` choices ramp linearly up to `lr0` over the warmup
/// epochs, then decay (linearly or by cosine) down to `lr0 * lrf_ratio` at
/// the final epoch.
pub struct LrScheduler {
    choice: SchedulerChoice,
    warm_ep: i64,
    total_epochs: i64,
    lr0: f64,
    lrf: f64,
    current_epoch: i64,
}

impl LrScheduler {
    /// Create a scheduler covering `epochs + warm_ep` total epochs.
    #[must_use]
    pub fn new(
        choice: SchedulerChoice,
        warm_ep: i64,
        epochs: i64,
        lr0: f64,
        lrf_ratio: f64,
    ) -> Self {
        Self {
            choice,
            warm_ep,
            total_epochs: epochs + warm_ep,
            lr0,
            lrf: lr0 * lrf_ratio,
            current_epoch: 0,
        }
    }

    /// Learning rate at a given epoch.
    #[must_use]
    pub fn lr_at(&self, epoch: i64) -> f64 {
        if self.choice.has_warmup() && epoch < self.warm_ep {
            // Linear ramp toward lr0 across the warmup epochs.
            return self.lr0 * (epoch + 1) as f64 / (self.warm_ep + 1) as f64;
        }

        let span = (self.total_epochs - self.warm_ep - 1).max(1) as f64;
        let progress = ((epoch - self.warm_ep) as f64 / span).clamp(0.0, 1.0);
        match self.choice {
            SchedulerChoice::Linear | SchedulerChoice::LinearWithWarm => {
                self.lrf + (self.lr0 - self.lrf) * (1.0 - progress)
            }
            SchedulerChoice::Cosine | SchedulerChoice::CosineWithWarm => {
                let cosine = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
                self.lrf + (self.lr0 - self.lrf) * cosine
            }
        }
    }

    /// Learning rate at the current epoch.
    #[must_use]
    pub fn get_lr(&self) -> f64 {
        self.lr_at(self.current_epoch)
    }

    /// Advance one epoch and push the new rate into the optimizer.
    pub fn step(&mut self, optimizer: &mut Optimizer) {
        self.current_epoch += 1;
        optimizer.set_learning_rate(self.get_lr());
    }

    /// Snapshot for checkpoints.
    #[must_use]
    pub fn state_dict(&self) -> SchedulerState {
        SchedulerState {
            current_epoch: self.current_epoch,
        }
    }

    /// Restore from a checkpointed state.
    pub fn load_state_dict(&mut self, state: SchedulerState) {
        self.current_epoch = state.current_epoch;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimizerChoice;

    #[test]
    fn test_warmup_ramps_up() {
        let scheduler = LrScheduler::new(SchedulerChoice::CosineWithWarm, 3, 10, 1e-2, 0.01);
        assert!(scheduler.lr_at(0) < scheduler.lr_at(1));
        assert!(scheduler.lr_at(1) < scheduler.lr_at(2));
        assert!(scheduler.lr_at(2) < 1e-2);
    }

    #[test]
    fn test_cosine_endpoints() {
        let scheduler = LrScheduler::new(SchedulerChoice::Cosine, 0, 10, 1e-2, 0.01);
        assert!((scheduler.lr_at(0) - 1e-2).abs() < 1e-12);
        assert!((scheduler.lr_at(9) - 1e-4).abs() < 1e-9);
    }

    #[test]
    fn test_linear_midpoint() {
        let scheduler = LrScheduler::new(SchedulerChoice::Linear, 0, 11, 1.0, 0.0);
        assert!((scheduler.lr_at(5) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_step_updates_optimizer() {
        let mut scheduler = LrScheduler::new(SchedulerChoice::Linear, 0, 11, 1.0, 0.0);
        let mut optimizer = Optimizer::new(OptimizerChoice::Sgd, 1.0, 0.0, 0.9);
        scheduler.step(&mut optimizer);
        assert!((optimizer.learning_rate() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_state_round_trip() {
        let mut scheduler = LrScheduler::new(SchedulerChoice::Cosine, 0, 10, 1e-2, 0.01);
        let mut optimizer = Optimizer::new(OptimizerChoice::Sgd, 1e-2, 0.0, 0.9);
        scheduler.step(&mut optimizer);
        scheduler.step(&mut optimizer);

        let state = scheduler.state_dict();
        let mut restored = LrScheduler::new(SchedulerChoice::Cosine, 0, 10, 1e-2, 0.01);
        restored.load_state_dict(state.clone());
        assert_eq!(restored.state_dict(), state);
        assert_eq!(restored.get_lr().to_bits(), scheduler.get_lr().to_bits());
    }
}
