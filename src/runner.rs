//! Epoch runner.
//!
//! Drives one train+validate pass with the strategy decisions already
//! applied: mixup blending when a positive strength was drawn, hard-example
//! ordering instead of a uniform shuffle when mining is enabled, loss
//! scaling around the backward path, and an EMA update after every step.
//! Validation runs without updates and yields the epoch fitness. The numeric
//! forward/backward itself lives behind the model seam.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::dataset::{DataProcessor, OhemSampler, Phase};
use crate::ema::ModelEma;
use crate::error::Result;
use crate::loss::Loss;
use crate::metrics;
use crate::model::ImageModel;
use crate::optimizer::Optimizer;
use crate::scaler::GradScaler;

/// Validation metrics for the active loss head.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValMetrics {
    /// Multi-class head: top-1/top-5 accuracy.
    MultiClass {
        /// Top-1 accuracy.
        top1: f64,
        /// Top-5 accuracy.
        top5: f64,
    },
    /// Label head: precision/recall/F1 at the decision threshold.
    MultiLabel {
        /// Precision.
        precision: f64,
        /// Recall.
        recall: f64,
        /// F1 score.
        f1: f64,
    },
}

/// What one epoch produced.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochOutcome {
    /// Mean training loss.
    pub train_loss: f64,
    /// Mean validation loss.
    pub val_loss: f64,
    /// Validation metrics for the active head.
    pub metrics: ValMetrics,
}

impl EpochOutcome {
    /// The scalar used for best-checkpoint selection: top-1 accuracy for the
    /// multi-class head, F1 for the label head.
    #[must_use]
    pub fn fitness(&self) -> f64 {
        match self.metrics {
            ValMetrics::MultiClass { top1, .. } => top1,
            ValMetrics::MultiLabel { f1, .. } => f1,
        }
    }
}

/// Borrowed view over the trainer's collaborators for one epoch.
pub struct EpochRunner<'a> {
    /// Model under training.
    pub model: &'a mut dyn ImageModel,
    /// Optimizer.
    pub optimizer: &'a mut Optimizer,
    /// Averaged weights, updated after each step on the primary replica.
    pub ema: Option<&'a mut ModelEma>,
    /// Loss scaler, when mixed-precision bookkeeping is active.
    pub scaler: Option<&'a mut GradScaler>,
    /// Hard-example sampler, when mining is enabled.
    pub ohem: Option<&'a mut OhemSampler>,
    /// Data pipeline.
    pub processor: &'a DataProcessor,
    /// Training batch size.
    pub batch_size: usize,
    /// Validation batch size.
    pub val_batch_size: usize,
    /// Decision threshold for the label head metrics.
    pub thresh: f64,
    /// Shuffle/permutation stream.
    pub rng: &'a mut StdRng,
}

impl EpochRunner<'_> {
    /// Run one full train+validate pass.
    ///
    /// # Errors
    ///
    /// Propagates dataset and optimizer errors; a failed epoch halts the run
    /// and the last written checkpoint stays the recovery point.
    pub fn run_epoch(
        &mut self,
        epoch: i64,
        mixup_strength: f64,
        loss: &Loss,
    ) -> Result<EpochOutcome> {
        let train_loss = self.train_pass(epoch, mixup_strength, loss)?;
        let (val_loss, metrics) = self.validate_pass(epoch, loss)?;
        Ok(EpochOutcome {
            train_loss,
            val_loss,
            metrics,
        })
    }

    fn epoch_order(&mut self) -> Vec<usize> {
        match &self.ohem {
            Some(sampler) => sampler.epoch_order(self.rng),
            None => {
                let mut order: Vec<usize> = (0..self.processor.train_dataset.len()).collect();
                order.shuffle(self.rng);
                order
            }
        }
    }

    fn train_pass(&mut self, epoch: i64, mixup_strength: f64, loss: &Loss) -> Result<f64> {
        let order = self.epoch_order();
        let mut loss_sum = 0.0;
        let mut seen = 0usize;

        for chunk in order.chunks(self.batch_size) {
            let batch = self.processor.load_batch(Phase::Train, chunk, epoch)?;

            let (features, output) = if mixup_strength > 0.0 && batch.features.len() > 1 {
                // Blend each sample with a permuted partner; the loss blends
                // against both label sets with the same weight.
                let mut perm: Vec<usize> = (0..batch.features.len()).collect();
                perm.shuffle(self.rng);

                let lam = mixup_strength;
                let blended: Vec<Vec<f32>> = batch
                    .features
                    .iter()
                    .enumerate()
                    .map(|(i, x)| {
                        let partner = &batch.features[perm[i]];
                        x.iter()
                            .zip(partner)
                            .map(|(&a, &b)| {
                                (lam * f64::from(a) + (1.0 - lam) * f64::from(b)) as f32
                            })
                            .collect()
                    })
                    .collect();
                let labels_b: Vec<usize> = perm.iter().map(|&i| batch.labels[i]).collect();

                let logits = self.model.forward(&blended);
                let output = loss.compute_mixup(&logits, &batch.labels, &labels_b, lam);
                (blended, output)
            } else {
                let logits = self.model.forward(&batch.features);
                (batch.features.clone(), loss.compute(&logits, &batch.labels))
            };

            loss_sum += output.loss * batch.features.len() as f64;
            seen += batch.features.len();

            if let Some(sampler) = self.ohem.as_deref_mut() {
                for (&index, &sample_loss) in batch.indices.iter().zip(&output.per_sample) {
                    sampler.record(index, sample_loss);
                }
            }

            self.step(&features, &output.grad_logits)?;
        }

        Ok(loss_sum / seen.max(1) as f64)
    }

    /// Backward + optimizer step, routed through the loss scaler when one is
    /// active: scale the logits gradient up, unscale parameter gradients,
    /// and skip the step entirely when anything came out non-finite.
    fn step(&mut self, features: &[Vec<f32>], grad_logits: &[Vec<f32>]) -> Result<()> {
        match self.scaler.as_deref_mut() {
            Some(scaler) => {
                let scale = scaler.scale() as f32;
                let scaled: Vec<Vec<f32>> = grad_logits
                    .iter()
                    .map(|row| row.iter().map(|&g| g * scale).collect())
                    .collect();
                let mut grads = self.model.backward(features, &scaled);
                let finite = scaler.unscale(&mut grads);
                if finite {
                    self.optimizer.step(self.model, &grads)?;
                }
                scaler.update(!finite);
                if !finite {
                    tracing::warn!("non-finite gradients, step skipped");
                    return Ok(());
                }
            }
            None => {
                let grads = self.model.backward(features, grad_logits);
                self.optimizer.step(self.model, &grads)?;
            }
        }

        if let Some(ema) = self.ema.as_deref_mut() {
            ema.update(self.model);
        }
        Ok(())
    }

    fn validate_pass(&mut self, epoch: i64, loss: &Loss) -> Result<(f64, ValMetrics)> {
        let n = self.processor.val_dataset.len();
        let order: Vec<usize> = (0..n).collect();

        let mut loss_sum = 0.0;
        let mut seen = 0usize;
        let mut probs = Vec::with_capacity(n);
        let mut labels = Vec::with_capacity(n);

        for chunk in order.chunks(self.val_batch_size) {
            let batch = self.processor.load_batch(Phase::Val, chunk, epoch)?;
            let logits = self.model.forward(&batch.features);
            let output = loss.compute(&logits, &batch.labels);

            loss_sum += output.loss * batch.features.len() as f64;
            seen += batch.features.len();
            probs.extend(loss.probabilities(&logits));
            labels.extend(batch.labels);
        }

        let metrics = if loss.is_multi_class() {
            let classes = self.model.num_classes();
            ValMetrics::MultiClass {
                top1: metrics::top_k_accuracy(&probs, &labels, 1),
                top5: metrics::top_k_accuracy(&probs, &labels, 5.min(classes)),
            }
        } else {
            let (precision, recall, f1) = metrics::precision_recall_f1(&probs, &labels, self.thresh);
            ValMetrics::MultiLabel {
                precision,
                recall,
                f1,
            }
        };

        Ok((loss_sum / seen.max(1) as f64, metrics))
    }
}
