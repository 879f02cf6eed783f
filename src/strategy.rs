//! Epoch-wise training strategy scheduler.
//!
//! A small state machine that decides, per epoch, which augmentation pipeline
//! is active, what mixup strength to use, which resolution to train at, which
//! loss head is in effect, and when warmup hands over to steady-state
//! optimization. The triggers are epoch-indexed and interact; their ordering
//! within one epoch is part of the contract:
//!
//! ```text
//! warmup transition -> loss transition -> augmentation weakening
//!     -> progressive-learning advance -> mixup strength computation
//! ```
//!
//! Weakening and the progressive advance both touch the mixup arming state;
//! weakening wins when both trigger in the same epoch. Decisions are
//! deterministic given `(epoch, config, seed)`, so data-parallel replicas
//! compute identical schedules without coordination.

use crate::config::VisionConfig;
use crate::error::{Result, VisionError};
use crate::sampler::DistributionSampler;

/// Which loss function is currently in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveLoss {
    /// The configured head (cross-entropy or bce).
    Configured,
    /// Focal loss, permanently replacing the bce head after warmup.
    Focal,
}

/// Mutable schedule state, owned solely by the scheduler.
///
/// Created at construction from the validated config; the beta shape lives in
/// the distribution sampler and is armed/disarmed as epochs cross milestone
/// boundaries.
#[derive(Debug, Clone)]
pub struct ScheduleState {
    /// Last epoch a decision was computed for.
    pub current_epoch: i64,
    /// The three progressive-learning trigger epochs (post-warmup indexing).
    pub mixup_change_nodes: [i64; 3],
    /// The three training resolutions entered at the trigger epochs.
    pub resize_milestones: [u32; 3],
    /// Resolution currently in effect.
    pub active_resolution: u32,
    /// Loss head currently in effect.
    pub active_loss: ActiveLoss,
    /// Sticky disarm set by augmentation weakening; once set, progressive
    /// nodes no longer re-arm mixup.
    pub mixup_disarmed: bool,
}

/// The decisions computed for one epoch.
///
/// The scheduler itself only mutates schedule state and the distribution
/// sampler; pipeline, loss, and momentum mutations are applied by the trainer
/// from these flags.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochDecision {
    /// Absolute epoch this decision belongs to.
    pub epoch: i64,
    /// Install the identity pipeline for warmup start (epoch 0 only).
    pub install_identity_pipeline: bool,
    /// Warmup ends this epoch: switch momentum to the steady value and
    /// install the full configured pipeline.
    pub warmup_complete: bool,
    /// Permanently replace the bce head with focal loss.
    pub switch_to_focal: bool,
    /// Weaken augmentation strength this epoch.
    pub weaken_augmentation: bool,
    /// Rewrite size-bearing pipeline stages to this resolution.
    pub resize_to: Option<u32>,
    /// Mixup blend weight for this epoch; 0 disables blending.
    pub mixup_strength: f64,
}

impl EpochDecision {
    fn new(epoch: i64) -> Self {
        Self {
            epoch,
            install_identity_pipeline: false,
            warmup_complete: false,
            switch_to_focal: false,
            weaken_augmentation: false,
            resize_to: None,
            mixup_strength: 0.0,
        }
    }
}

/// The strategy scheduler.
pub struct StrategyScheduler {
    warm_ep: i64,
    aug_epoch: i64,
    mixup_ratio: f64,
    mixup_start: i64,
    prog_learn: bool,
    focal_enabled: bool,
    state: ScheduleState,
    sampler: DistributionSampler,
}

/// Three evenly spaced integers over `[start, end]`, rounded to nearest.
fn linspace3(start: i64, end: i64) -> [i64; 3] {
    let mid = ((start + end) as f64 / 2.0).round() as i64;
    [start, mid, end]
}

impl StrategyScheduler {
    /// Build the scheduler from a validated configuration.
    ///
    /// Milestone and resolution sequences are computed once here. The
    /// resolution sequence must be strictly increasing when progressive
    /// learning is enabled; anything else indicates a gap the validator
    /// missed and is fatal.
    ///
    /// # Errors
    ///
    /// Returns `VisionError::Strategy` for a non-increasing resolution
    /// sequence.
    pub fn new(config: &VisionConfig) -> Result<Self> {
        let hyp = &config.hyp;
        let (mix_start, mix_end) = hyp.strategy.mixup.milestones;
        let nodes = linspace3(mix_start, mix_end);

        let base = config.data.imgsz.iter().copied().min().unwrap_or(0);
        let low = i64::from(base) / 2;
        let resize = linspace3(low, i64::from(base));
        if hyp.strategy.prog_learn && !(resize[0] < resize[1] && resize[1] < resize[2]) {
            return Err(VisionError::Strategy(format!(
                "progressive resolution sequence {resize:?} from base size {base} \
                 is not strictly increasing"
            )));
        }
        let resize_milestones = [resize[0] as u32, resize[1] as u32, resize[2] as u32];

        Ok(Self {
            warm_ep: hyp.warm_ep,
            aug_epoch: config.data.train.aug_epoch,
            mixup_ratio: hyp.strategy.mixup.ratio,
            mixup_start: mix_start,
            prog_learn: hyp.strategy.prog_learn,
            focal_enabled: hyp.strategy.focal.enabled,
            state: ScheduleState {
                current_epoch: 0,
                mixup_change_nodes: nodes,
                resize_milestones,
                active_resolution: base,
                active_loss: ActiveLoss::Configured,
                mixup_disarmed: false,
            },
            sampler: DistributionSampler::seeded(config.seed),
        })
    }

    /// Compute the decisions for `epoch` (absolute, warmup included),
    /// applying the fixed intra-epoch ordering.
    ///
    /// # Errors
    ///
    /// Propagates arming errors from the distribution sampler.
    pub fn decide(&mut self, epoch: i64) -> Result<EpochDecision> {
        let elapsed = epoch - self.warm_ep;
        let mut decision = EpochDecision::new(epoch);

        self.apply_warmup_transition(epoch, &mut decision);
        self.apply_loss_transition(elapsed, &mut decision);
        self.apply_augmentation_weakening(elapsed, &mut decision);
        if self.prog_learn {
            self.advance_progressive_learning(elapsed, &mut decision)?;
        }
        decision.mixup_strength = self.compute_mixup_strength(elapsed);

        self.state.current_epoch = epoch;
        Ok(decision)
    }

    /// Warmup boundary handling. Epoch 0 forces the identity pipeline to
    /// stabilize early statistics; at `epoch == warm_ep` momentum moves to
    /// the steady value and the full pipeline is installed. With
    /// `warm_ep == 0` both fire on epoch 0 and the full-pipeline install,
    /// applied second, wins.
    fn apply_warmup_transition(&mut self, epoch: i64, decision: &mut EpochDecision) {
        if epoch == 0 {
            decision.install_identity_pipeline = true;
        }
        if epoch == self.warm_ep {
            decision.warmup_complete = true;
        }
    }

    /// One-directional loss switch at the first post-warmup epoch.
    fn apply_loss_transition(&mut self, elapsed: i64, decision: &mut EpochDecision) {
        if elapsed == 0 && self.focal_enabled && self.state.active_loss == ActiveLoss::Configured {
            self.state.active_loss = ActiveLoss::Focal;
            decision.switch_to_focal = true;
        }
    }

    /// Weaken augmentation at the milestone and disarm mixup with it.
    /// The disarm is sticky: later progressive nodes never re-arm.
    fn apply_augmentation_weakening(&mut self, elapsed: i64, decision: &mut EpochDecision) {
        if elapsed == self.aug_epoch {
            decision.weaken_augmentation = true;
            self.state.mixup_disarmed = true;
            self.sampler.disarm();
        }
    }

    /// At each precomputed change node: arm the beta shape with
    /// `index * 0.1` (index 0 leaves mixup unarmed) and advance the training
    /// resolution through the interpolated sizes. Duplicate nodes apply in
    /// order, last write wins. Epochs matching no node are no-ops.
    fn advance_progressive_learning(
        &mut self,
        elapsed: i64,
        decision: &mut EpochDecision,
    ) -> Result<()> {
        for (index, node) in self.state.mixup_change_nodes.iter().enumerate() {
            if *node != elapsed {
                continue;
            }
            let alpha = index as f64 * 0.1;
            if alpha > 0.0 && !self.state.mixup_disarmed {
                self.sampler.arm(alpha)?;
            }
            let size = self.state.resize_milestones[index];
            self.state.active_resolution = size;
            decision.resize_to = Some(size);
        }
        Ok(())
    }

    /// Mixup blend weight for the epoch. Zero when the ratio is zero, before
    /// the milestone window opens, or while no beta shape is armed; otherwise
    /// a uniform draw gates activation and a beta draw sets the strength.
    fn compute_mixup_strength(&mut self, elapsed: i64) -> f64 {
        if self.mixup_ratio == 0.0 || elapsed < self.mixup_start || !self.sampler.is_armed() {
            return 0.0;
        }
        let gate = self.sampler.draw_uniform();
        if gate < self.mixup_ratio {
            self.sampler.draw_beta().unwrap_or(0.0)
        } else {
            0.0
        }
    }

    /// The schedule state, for inspection and tests.
    #[must_use]
    pub fn state(&self) -> &ScheduleState {
        &self.state
    }

    /// Whether a beta shape is currently armed.
    #[must_use]
    pub fn is_mixup_armed(&self) -> bool {
        self.sampler.is_armed()
    }

    /// Loss head currently in effect.
    #[must_use]
    pub fn active_loss(&self) -> ActiveLoss {
        self.state.active_loss
    }

    /// Resolution currently in effect.
    #[must_use]
    pub fn active_resolution(&self) -> u32 {
        self.state.active_resolution
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MixupConfig, VisionConfig};

    /// Warmup 2, 10 post-warmup epochs, mixup over (2, 8), progressive
    /// learning on, weakening at post-warmup epoch 8.
    fn scenario_config() -> VisionConfig {
        let mut config = VisionConfig::shufflenet_preset();
        config.hyp.epochs = 10;
        config.hyp.warm_ep = 2;
        config.hyp.strategy.mixup = MixupConfig {
            ratio: 0.5,
            milestones: (2, 8),
        };
        config.hyp.strategy.prog_learn = true;
        config.data.train.aug_epoch = 8;
        config.data.imgsz = vec![224, 224];
        config
    }

    #[test]
    fn test_linspace3_rounding() {
        assert_eq!(linspace3(2, 8), [2, 5, 8]);
        assert_eq!(linspace3(10, 40), [10, 25, 40]);
        assert_eq!(linspace3(0, 1), [0, 1, 1]);
    }

    #[test]
    fn test_change_nodes_within_milestones() {
        let scheduler = StrategyScheduler::new(&scenario_config()).unwrap();
        let nodes = scheduler.state().mixup_change_nodes;
        assert_eq!(nodes, [2, 5, 8]);
        assert!(nodes.windows(2).all(|w| w[0] <= w[1]));
        assert!(nodes.iter().all(|&n| (2..=8).contains(&n)));
    }

    #[test]
    fn test_resolution_sequence_strictly_increasing() {
        let scheduler = StrategyScheduler::new(&scenario_config()).unwrap();
        assert_eq!(scheduler.state().resize_milestones, [112, 168, 224]);

        for base in [4u32, 7, 32, 96, 224, 640] {
            let mut config = scenario_config();
            config.data.imgsz = vec![base];
            let scheduler = StrategyScheduler::new(&config).unwrap();
            let seq = scheduler.state().resize_milestones;
            assert!(seq[0] < seq[1] && seq[1] < seq[2], "base {base}: {seq:?}");
        }
    }

    #[test]
    fn test_degenerate_base_size_is_fatal() {
        let mut config = scenario_config();
        config.data.imgsz = vec![2];
        let result = StrategyScheduler::new(&config);
        assert!(matches!(result, Err(VisionError::Strategy(_))));
    }

    #[test]
    fn test_mixup_zero_when_ratio_zero() {
        let mut config = scenario_config();
        config.hyp.strategy.mixup.ratio = 0.0;
        config.hyp.strategy.prog_learn = false;
        let mut scheduler = StrategyScheduler::new(&config).unwrap();
        for epoch in 0..12 {
            let decision = scheduler.decide(epoch).unwrap();
            assert_eq!(decision.mixup_strength, 0.0);
        }
    }

    #[test]
    fn test_mixup_zero_before_milestone_start() {
        let mut scheduler = StrategyScheduler::new(&scenario_config()).unwrap();
        // Absolute epochs 0..=3 are post-warmup epochs -2..=1, all before the
        // milestone start at 2.
        for epoch in 0..4 {
            let decision = scheduler.decide(epoch).unwrap();
            assert_eq!(decision.mixup_strength, 0.0, "epoch {epoch}");
        }
    }

    #[test]
    fn test_mixup_zero_while_unarmed() {
        let mut config = scenario_config();
        // Progressive learning off: nothing ever arms the beta shape.
        config.hyp.strategy.prog_learn = false;
        let mut scheduler = StrategyScheduler::new(&config).unwrap();
        for epoch in 0..12 {
            let decision = scheduler.decide(epoch).unwrap();
            assert_eq!(decision.mixup_strength, 0.0);
        }
    }

    #[test]
    fn test_mixup_strictly_positive_with_full_ratio() {
        let mut config = scenario_config();
        config.hyp.strategy.mixup.ratio = 1.0;
        let mut scheduler = StrategyScheduler::new(&config).unwrap();
        // Walk to the second change node so the shape is armed (0.1).
        for epoch in 0..=7 {
            scheduler.decide(epoch).unwrap();
        }
        assert!(scheduler.is_mixup_armed());
        // The uniform gate always passes at ratio 1.
        for _ in 0..200 {
            let lam = scheduler.compute_mixup_strength(6);
            assert!(lam > 0.0);
        }
    }

    #[test]
    fn test_epoch_zero_forces_identity_pipeline() {
        let mut scheduler = StrategyScheduler::new(&scenario_config()).unwrap();
        let decision = scheduler.decide(0).unwrap();
        assert!(decision.install_identity_pipeline);
        assert!(!decision.warmup_complete);
    }

    #[test]
    fn test_warmup_transition_fires_exactly_at_boundary() {
        let mut scheduler = StrategyScheduler::new(&scenario_config()).unwrap();
        for epoch in 0..12 {
            let decision = scheduler.decide(epoch).unwrap();
            assert_eq!(decision.warmup_complete, epoch == 2, "epoch {epoch}");
        }
    }

    #[test]
    fn test_warmup_zero_identity_then_full_same_epoch() {
        let mut config = scenario_config();
        config.hyp.warm_ep = 0;
        config.hyp.scheduler = crate::config::SchedulerChoice::Cosine;
        let mut scheduler = StrategyScheduler::new(&config).unwrap();
        let decision = scheduler.decide(0).unwrap();
        // Both fire; the full-pipeline install is applied second and wins.
        assert!(decision.install_identity_pipeline);
        assert!(decision.warmup_complete);
    }

    #[test]
    fn test_focal_switch_fires_once() {
        let mut config = scenario_config();
        config.hyp.loss.ce = false;
        config.hyp.loss.bce.enabled = true;
        config.hyp.strategy.focal.enabled = true;
        let mut scheduler = StrategyScheduler::new(&config).unwrap();

        let mut switches = 0;
        for epoch in 0..12 {
            let decision = scheduler.decide(epoch).unwrap();
            if decision.switch_to_focal {
                switches += 1;
                assert_eq!(epoch, 2);
            }
        }
        assert_eq!(switches, 1);
        assert_eq!(scheduler.active_loss(), ActiveLoss::Focal);
    }

    #[test]
    fn test_progressive_resize_schedule() {
        let mut scheduler = StrategyScheduler::new(&scenario_config()).unwrap();
        let mut resizes = Vec::new();
        for epoch in 0..12 {
            let decision = scheduler.decide(epoch).unwrap();
            if let Some(size) = decision.resize_to {
                resizes.push((epoch, size));
            }
        }
        // Post-warmup epochs 2, 5, 8 are absolute epochs 4, 7, 10.
        assert_eq!(resizes, vec![(4, 112), (7, 168), (10, 224)]);
        assert_eq!(scheduler.active_resolution(), 224);
    }

    #[test]
    fn test_weakening_disarms_and_wins_over_final_node() {
        let mut scheduler = StrategyScheduler::new(&scenario_config()).unwrap();
        for epoch in 0..=9 {
            scheduler.decide(epoch).unwrap();
        }
        assert!(scheduler.is_mixup_armed());

        // Absolute epoch 10 is post-warmup epoch 8: both the weakening
        // milestone and the final change node. Weakening wins; resolution
        // still advances.
        let decision = scheduler.decide(10).unwrap();
        assert!(decision.weaken_augmentation);
        assert_eq!(decision.resize_to, Some(224));
        assert!(!scheduler.is_mixup_armed());
        assert_eq!(decision.mixup_strength, 0.0);

        // And it stays disarmed afterwards.
        let decision = scheduler.decide(11).unwrap();
        assert_eq!(decision.mixup_strength, 0.0);
        assert!(!scheduler.is_mixup_armed());
    }

    #[test]
    fn test_mixup_zero_at_and_after_weakening_epoch() {
        let mut config = scenario_config();
        config.hyp.strategy.mixup.ratio = 1.0;
        let mut scheduler = StrategyScheduler::new(&config).unwrap();
        for epoch in 0..12 {
            let decision = scheduler.decide(epoch).unwrap();
            let elapsed = epoch - 2;
            if elapsed >= 8 {
                assert_eq!(decision.mixup_strength, 0.0, "epoch {epoch}");
            }
        }
    }

    #[test]
    fn test_identical_streams_across_replicas() {
        let mut a = StrategyScheduler::new(&scenario_config()).unwrap();
        let mut b = StrategyScheduler::new(&scenario_config()).unwrap();
        for epoch in 0..12 {
            let da = a.decide(epoch).unwrap();
            let db = b.decide(epoch).unwrap();
            assert_eq!(da, db);
        }
    }

    #[test]
    fn test_no_resize_when_progressive_disabled() {
        let mut config = scenario_config();
        config.hyp.strategy.prog_learn = false;
        let mut scheduler = StrategyScheduler::new(&config).unwrap();
        for epoch in 0..12 {
            let decision = scheduler.decide(epoch).unwrap();
            assert_eq!(decision.resize_to, None);
        }
        assert_eq!(scheduler.active_resolution(), 224);
    }
}
