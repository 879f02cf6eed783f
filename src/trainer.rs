//! Training orchestrator.
//!
//! Owns the collaborators — data processor, model, optimizer, LR scheduler,
//! loss heads, EMA, loss scaler, strategy scheduler, checkpoint manager —
//! and drives the epoch loop: compute the epoch's strategy decisions, apply
//! them to the collaborators, run train+validate, persist `last`/`best`.
//! Epochs are strictly sequential; only the primary replica writes
//! checkpoints and logs.

use std::path::{Path, PathBuf};
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::checkpoint::{CheckpointManager, CheckpointRecord};
use crate::config::VisionConfig;
use crate::dataset::{DataProcessor, OhemSampler, Phase, FEATURE_LEN};
use crate::ema::ModelEma;
use crate::error::Result;
use crate::loss::Loss;
use crate::model::{build_model, ImageModel};
use crate::optimizer::Optimizer;
use crate::runner::{EpochOutcome, EpochRunner, ValMetrics};
use crate::scaler::GradScaler;
use crate::scheduler::LrScheduler;
use crate::strategy::{EpochDecision, StrategyScheduler};

/// Allocate a non-clobbering run directory: `exp`, `exp2`, `exp3`, ...
#[must_use]
pub fn increment_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    for n in 2..9999 {
        let candidate = PathBuf::from(format!("{}{n}", path.display()));
        if !candidate.exists() {
            return candidate;
        }
    }
    path.to_path_buf()
}

fn detect_rank() -> i64 {
    std::env::var("RANK")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(-1)
}

/// Training orchestrator.
///
/// # Example
///
/// ```no_run
/// use visiontrain_rs::{Trainer, VisionConfig};
///
/// # fn main() -> visiontrain_rs::Result<()> {
/// let config = VisionConfig::from_file("config.yaml")?;
/// let mut trainer = Trainer::new(config)?;
/// trainer.run(None)?;
/// # Ok(())
/// # }
/// ```
pub struct Trainer {
    config: VisionConfig,
    run_dir: PathBuf,
    rank: i64,
    processor: DataProcessor,
    model: Box<dyn ImageModel>,
    optimizer: Optimizer,
    lr_scheduler: LrScheduler,
    strategy: StrategyScheduler,
    loss: Loss,
    focal: Option<Loss>,
    thresh: f64,
    ema: ModelEma,
    scaler: Option<GradScaler>,
    ohem: Option<OhemSampler>,
    checkpoints: CheckpointManager,
    best_fitness: f64,
    start_epoch: i64,
    rng: StdRng,
}

impl Trainer {
    /// Validate the configuration and assemble every collaborator.
    ///
    /// # Errors
    ///
    /// Fails fast on an invalid configuration, an unreadable dataset, or a
    /// strategy precondition violation.
    pub fn new(config: VisionConfig) -> Result<Self> {
        config.validate()?;

        let rank = detect_rank();
        let run_dir = increment_path(Path::new(&config.output_dir));
        let processor = DataProcessor::new(&config.data, config.seed)?;

        let model = build_model(&config.model, FEATURE_LEN, config.seed)?;
        let optimizer = Optimizer::new(
            config.hyp.optimizer,
            config.hyp.lr0,
            config.hyp.weight_decay,
            config.hyp.warmup_momentum,
        );
        let lr_scheduler = LrScheduler::new(
            config.hyp.scheduler,
            config.hyp.warm_ep,
            config.hyp.epochs,
            config.hyp.lr0,
            config.hyp.lrf_ratio,
        );
        let strategy = StrategyScheduler::new(&config)?;

        let loss = Loss::from_config(&config.hyp);
        let focal = config
            .hyp
            .strategy
            .focal
            .enabled
            .then(|| Loss::focal(&config.hyp.strategy.focal));
        let thresh = if config.hyp.loss.bce.enabled {
            config.hyp.loss.bce.thresh
        } else {
            0.0
        };

        let ema = ModelEma::new(model.as_ref());
        let ohem = config
            .hyp
            .strategy
            .ohem
            .enabled
            .then(|| OhemSampler::new(&config.hyp.strategy.ohem, processor.train_dataset.len()));
        let checkpoints = CheckpointManager::new(&run_dir);
        let rng = StdRng::seed_from_u64(config.seed);

        Ok(Self {
            config,
            run_dir,
            rank,
            processor,
            model,
            optimizer,
            lr_scheduler,
            strategy,
            loss,
            focal,
            thresh,
            ema,
            scaler: Some(GradScaler::new()),
            ohem,
            checkpoints,
            best_fitness: 0.0,
            start_epoch: 0,
            rng,
        })
    }

    /// Whether this process writes checkpoints and logs.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.rank <= 0
    }

    /// Run the training loop, optionally resuming from a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error; no retries happen at this layer and
    /// the last successfully written checkpoint remains the recovery point.
    pub fn run(&mut self, resume: Option<&Path>) -> Result<()> {
        if let Some(path) = resume {
            let record = CheckpointManager::load(path)?;
            self.restore(record)?;
            tracing::info!(
                "resumed from {} at epoch {}",
                path.display(),
                self.start_epoch
            );
        }

        let total_epochs = self.config.hyp.epochs + self.config.hyp.warm_ep;
        tracing::info!("starting training");
        tracing::info!("  model: {}", self.config.model.choice);
        tracing::info!("  classes: {}", self.config.model.num_classes);
        tracing::info!("  epochs: {total_epochs} (incl. {} warmup)", self.config.hyp.warm_ep);
        tracing::info!("  loss head: {}", self.loss.name());

        if self.is_primary() {
            std::fs::create_dir_all(&self.run_dir)?;
            self.config.to_file(self.run_dir.join("config.yaml"))?;
            if self.thresh == 0.0 {
                tracing::info!(
                    "{:>8} {:>12} {:>12} {:>10} {:>10}",
                    "epoch",
                    "train_loss",
                    "val_loss",
                    "top1",
                    "top5"
                );
            } else {
                tracing::info!(
                    "{:>8} {:>12} {:>12} {:>10} {:>10} {:>10}",
                    "epoch",
                    "train_loss",
                    "val_loss",
                    "precision",
                    "recall",
                    "f1"
                );
            }
        }

        let bar = if self.is_primary() {
            let bar = ProgressBar::new(total_epochs as u64);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>4}/{len:4} {msg}")?
                    .progress_chars("#>-"),
            );
            bar.set_position(self.start_epoch.max(0) as u64);
            Some(bar)
        } else {
            None
        };

        let t0 = Instant::now();
        for epoch in self.start_epoch..total_epochs {
            let outcome = self.run_one_epoch(epoch)?;
            let fitness = outcome.fitness();

            if self.is_primary() {
                if fitness > self.best_fitness {
                    self.best_fitness = fitness;
                }
                // A failed write loses this epoch's persistence only; the
                // in-memory state stands and the next epoch writes again.
                if let Err(e) = self.persist(epoch, fitness) {
                    tracing::error!("checkpoint write failed at epoch {epoch}: {e}");
                }
                self.log_epoch(epoch, &outcome);
            }
            if let Some(bar) = &bar {
                bar.set_message(format!("{:.4}", outcome.train_loss));
                bar.inc(1);
            }
        }

        if let Some(bar) = &bar {
            bar.finish_with_message("training complete");
        }
        if self.is_primary() {
            tracing::info!(
                "training complete ({:.3} hours), best fitness {:.4}",
                t0.elapsed().as_secs_f64() / 3600.0,
                self.best_fitness
            );
            tracing::info!("results saved to {}", self.run_dir.display());
        }
        Ok(())
    }

    /// Compute and apply the epoch's strategy decisions, then run one
    /// train+validate pass. Exposed as the building block `run` drives so
    /// schedules can be stepped and inspected epoch by epoch.
    ///
    /// # Errors
    ///
    /// Propagates strategy, dataset, and training errors.
    pub fn run_one_epoch(&mut self, epoch: i64) -> Result<EpochOutcome> {
        let decision = self.strategy.decide(epoch)?;
        self.apply_decision(&decision);

        let primary = self.is_primary();
        let mut runner = EpochRunner {
            model: self.model.as_mut(),
            optimizer: &mut self.optimizer,
            ema: primary.then_some(&mut self.ema),
            scaler: self.scaler.as_mut(),
            ohem: self.ohem.as_mut(),
            processor: &self.processor,
            batch_size: self.config.data.train.bs,
            val_batch_size: self.config.data.val.bs,
            thresh: self.thresh,
            rng: &mut self.rng,
        };
        let outcome = runner.run_epoch(epoch, decision.mixup_strength, &self.loss)?;

        self.lr_scheduler.step(&mut self.optimizer);
        Ok(outcome)
    }

    /// Apply one epoch's decisions to the collaborators, in decision order.
    fn apply_decision(&mut self, decision: &EpochDecision) {
        if decision.install_identity_pipeline {
            self.processor.set_augmentation(Phase::Train, None);
        }
        if decision.warmup_complete {
            self.optimizer.set_momentum(self.config.hyp.momentum);
            let full = self.processor.full_augmenter();
            self.processor.set_augmentation(Phase::Train, Some(full));
            tracing::info!(
                "warmup complete at epoch {}: momentum -> {}, full augmentation installed",
                decision.epoch,
                self.config.hyp.momentum
            );
        }
        if decision.switch_to_focal {
            if let Some(focal) = self.focal.take() {
                tracing::info!("loss head {} -> {}", self.loss.name(), focal.name());
                self.loss = focal;
            }
        }
        if decision.weaken_augmentation {
            let elapsed = decision.epoch - self.config.hyp.warm_ep;
            self.processor
                .weaken_augmentation(elapsed, self.config.data.train.aug_epoch);
        }
        if let Some(size) = decision.resize_to {
            self.processor.rewrite_train_sizes(size);
            tracing::info!("training resolution -> {size}");
        }
    }

    fn persist(&mut self, epoch: i64, fitness: f64) -> Result<()> {
        let mut record = CheckpointRecord {
            epoch,
            best_fitness: self.best_fitness,
            model: self.model.state_dict(),
            ema: self.ema.snapshot(),
            optimizer: self.optimizer.state_dict(),
            scheduler: self.lr_scheduler.state_dict(),
            scaler: self.scaler.as_ref().map(GradScaler::state_dict),
            saved_at: String::new(),
        };
        self.checkpoints.save(&mut record, fitness == self.best_fitness)
    }

    fn restore(&mut self, record: CheckpointRecord) -> Result<()> {
        self.start_epoch = record.epoch + 1;
        self.best_fitness = record.best_fitness;
        self.model.load_state_dict(&record.model)?;
        self.ema.restore(record.ema);
        self.optimizer.load_state_dict(record.optimizer)?;
        self.lr_scheduler.load_state_dict(record.scheduler);
        match (record.scaler, self.scaler.as_mut()) {
            (Some(state), Some(scaler)) => scaler.load_state_dict(state),
            (None, _) | (_, None) => {}
        }
        Ok(())
    }

    fn log_epoch(&self, epoch: i64, outcome: &EpochOutcome) {
        match outcome.metrics {
            ValMetrics::MultiClass { top1, top5 } => {
                tracing::info!(
                    "{epoch:>8} {:>12.4} {:>12.4} {top1:>10.4} {top5:>10.4}",
                    outcome.train_loss,
                    outcome.val_loss
                );
            }
            ValMetrics::MultiLabel {
                precision,
                recall,
                f1,
            } => {
                tracing::info!(
                    "{epoch:>8} {:>12.4} {:>12.4} {precision:>10.4} {recall:>10.4} {f1:>10.4}",
                    outcome.train_loss,
                    outcome.val_loss
                );
            }
        }
    }

    /// Run directory this trainer writes into.
    #[must_use]
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Running best fitness.
    #[must_use]
    pub fn best_fitness(&self) -> f64 {
        self.best_fitness
    }

    /// Epoch the next `run` call starts from.
    #[must_use]
    pub fn start_epoch(&self) -> i64 {
        self.start_epoch
    }

    /// The optimizer, for inspection.
    #[must_use]
    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    /// The strategy scheduler, for inspection.
    #[must_use]
    pub fn strategy(&self) -> &StrategyScheduler {
        &self.strategy
    }

    /// The data processor, for inspection.
    #[must_use]
    pub fn processor(&self) -> &DataProcessor {
        &self.processor
    }

    /// Averaged-model update counter.
    #[must_use]
    pub fn ema_updates(&self) -> u64 {
        self.ema.updates()
    }

    /// The active loss head name.
    #[must_use]
    pub fn active_loss_name(&self) -> &'static str {
        self.loss.name()
    }
}
