//! Loss heads.
//!
//! Polymorphic over cross-entropy (multi-class), binary cross-entropy
//! (multi-label capable), and focal loss. Each head computes the scalar batch
//! loss and the logits gradient the reference backward path consumes. The
//! trainer swaps heads by value; the focal head replaces bce once, after
//! warmup, and never switches back.

use crate::config::{FocalConfig, HypConfig};

const EPS: f64 = 1e-7;

/// A loss head with its shape parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Loss {
    /// Softmax cross-entropy with label smoothing.
    CrossEntropy {
        /// Smoothing mass moved off the target class.
        label_smooth: f64,
    },
    /// Binary cross-entropy with logits, one sigmoid per class.
    Bce {
        /// Smoothing applied to the one-hot targets.
        label_smooth: f64,
    },
    /// Focal loss on the bce head: down-weights easy examples.
    Focal {
        /// Positive-class weight.
        alpha: f64,
        /// Focusing exponent.
        gamma: f64,
    },
}

/// Batch loss value plus the gradient with respect to the logits.
#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Mean loss over the batch.
    pub loss: f64,
    /// Per-sample losses, used by hard-example bookkeeping.
    pub per_sample: Vec<f64>,
    /// `d loss / d logits`, one row per sample.
    pub grad_logits: Vec<Vec<f32>>,
}

impl Loss {
    /// The configured head from the hyperparameter section.
    #[must_use]
    pub fn from_config(hyp: &HypConfig) -> Self {
        if hyp.loss.bce.enabled {
            Loss::Bce {
                label_smooth: hyp.label_smooth,
            }
        } else {
            Loss::CrossEntropy {
                label_smooth: hyp.label_smooth,
            }
        }
    }

    /// The focal replacement head.
    #[must_use]
    pub fn focal(config: &FocalConfig) -> Self {
        Loss::Focal {
            alpha: config.alpha,
            gamma: config.gamma,
        }
    }

    /// Head name for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Loss::CrossEntropy { .. } => "ce",
            Loss::Bce { .. } => "bce",
            Loss::Focal { .. } => "focal",
        }
    }

    /// Whether this head produces a softmax distribution (multi-class) as
    /// opposed to per-class sigmoids.
    #[must_use]
    pub fn is_multi_class(&self) -> bool {
        matches!(self, Loss::CrossEntropy { .. })
    }

    /// Class probabilities from logits: softmax for the multi-class head,
    /// per-class sigmoid otherwise.
    #[must_use]
    pub fn probabilities(&self, logits: &[Vec<f32>]) -> Vec<Vec<f32>> {
        if self.is_multi_class() {
            logits.iter().map(|row| softmax(row)).collect()
        } else {
            logits
                .iter()
                .map(|row| row.iter().map(|&z| sigmoid(f64::from(z)) as f32).collect())
                .collect()
        }
    }

    /// Compute loss and logits gradient for a batch of single-class targets.
    #[must_use]
    pub fn compute(&self, logits: &[Vec<f32>], labels: &[usize]) -> LossOutput {
        match self {
            Loss::CrossEntropy { label_smooth } => cross_entropy(logits, labels, *label_smooth),
            Loss::Bce { label_smooth } => bce_with_logits(logits, labels, *label_smooth),
            Loss::Focal { alpha, gamma } => focal(logits, labels, *alpha, *gamma),
        }
    }

    /// Mixup form: the loss (and gradient) is the `lam`-weighted blend of the
    /// losses against both label sets.
    #[must_use]
    pub fn compute_mixup(
        &self,
        logits: &[Vec<f32>],
        labels_a: &[usize],
        labels_b: &[usize],
        lam: f64,
    ) -> LossOutput {
        let a = self.compute(logits, labels_a);
        let b = self.compute(logits, labels_b);
        let grad_logits = a
            .grad_logits
            .iter()
            .zip(&b.grad_logits)
            .map(|(ga, gb)| {
                ga.iter()
                    .zip(gb)
                    .map(|(&x, &y)| (lam * f64::from(x) + (1.0 - lam) * f64::from(y)) as f32)
                    .collect()
            })
            .collect();
        let per_sample = a
            .per_sample
            .iter()
            .zip(&b.per_sample)
            .map(|(&x, &y)| lam * x + (1.0 - lam) * y)
            .collect();
        LossOutput {
            loss: lam * a.loss + (1.0 - lam) * b.loss,
            per_sample,
            grad_logits,
        }
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

fn softmax(row: &[f32]) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f64> = row.iter().map(|&z| f64::from(z - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.iter().map(|&e| (e / sum) as f32).collect()
}

/// Smoothed target distribution: `1 - s + s/C` on the label, `s/C` elsewhere.
fn smooth_targets(label: usize, num_classes: usize, smooth: f64) -> Vec<f64> {
    let off = smooth / num_classes as f64;
    let mut q = vec![off; num_classes];
    q[label] = 1.0 - smooth + off;
    q
}

fn cross_entropy(logits: &[Vec<f32>], labels: &[usize], smooth: f64) -> LossOutput {
    let n = logits.len().max(1) as f64;
    let mut per_sample = Vec::with_capacity(logits.len());
    let mut grads = Vec::with_capacity(logits.len());

    for (row, &label) in logits.iter().zip(labels) {
        let p = softmax(row);
        let q = smooth_targets(label, row.len(), smooth);
        let mut sample_loss = 0.0;
        let mut grad = Vec::with_capacity(row.len());
        for (&pc, &qc) in p.iter().zip(&q) {
            let pc = f64::from(pc).clamp(EPS, 1.0 - EPS);
            sample_loss -= qc * pc.ln();
            grad.push(((pc - qc) / n) as f32);
        }
        per_sample.push(sample_loss);
        grads.push(grad);
    }

    LossOutput {
        loss: per_sample.iter().sum::<f64>() / n,
        per_sample,
        grad_logits: grads,
    }
}

fn bce_with_logits(logits: &[Vec<f32>], labels: &[usize], smooth: f64) -> LossOutput {
    let n = logits.len().max(1) as f64;
    let classes = logits.first().map_or(1, Vec::len) as f64;
    let scale = n * classes;
    let mut per_sample = Vec::with_capacity(logits.len());
    let mut grads = Vec::with_capacity(logits.len());

    for (row, &label) in logits.iter().zip(labels) {
        let q = smooth_targets(label, row.len(), smooth);
        let mut sample_loss = 0.0;
        let mut grad = Vec::with_capacity(row.len());
        for (&zf, &y) in row.iter().zip(&q) {
            let z = f64::from(zf);
            // Numerically stable bce-with-logits.
            sample_loss += z.max(0.0) - z * y + (1.0 + (-z.abs()).exp()).ln();
            grad.push(((sigmoid(z) - y) / scale) as f32);
        }
        per_sample.push(sample_loss / classes);
        grads.push(grad);
    }

    LossOutput {
        loss: per_sample.iter().sum::<f64>() / n,
        per_sample,
        grad_logits: grads,
    }
}

fn focal(logits: &[Vec<f32>], labels: &[usize], alpha: f64, gamma: f64) -> LossOutput {
    let n = logits.len().max(1) as f64;
    let classes = logits.first().map_or(1, Vec::len) as f64;
    let scale = n * classes;
    let mut per_sample = Vec::with_capacity(logits.len());
    let mut grads = Vec::with_capacity(logits.len());

    for (row, &label) in logits.iter().zip(labels) {
        let mut sample_loss = 0.0;
        let mut grad = Vec::with_capacity(row.len());
        for (c, &zf) in row.iter().enumerate() {
            let y = if c == label { 1.0 } else { 0.0 };
            let p = sigmoid(f64::from(zf)).clamp(EPS, 1.0 - EPS);

            let pos = -alpha * (1.0 - p).powf(gamma) * p.ln();
            let neg = -(1.0 - alpha) * p.powf(gamma) * (1.0 - p).ln();
            sample_loss += y * pos + (1.0 - y) * neg;

            let dpos = alpha * (gamma * p * (1.0 - p).powf(gamma) * p.ln()
                - (1.0 - p).powf(gamma + 1.0));
            let dneg = (1.0 - alpha)
                * (p.powf(gamma + 1.0) - gamma * p.powf(gamma) * (1.0 - p) * (1.0 - p).ln());
            grad.push(((y * dpos + (1.0 - y) * dneg) / scale) as f32);
        }
        per_sample.push(sample_loss / classes);
        grads.push(grad);
    }

    LossOutput {
        loss: per_sample.iter().sum::<f64>() / n,
        per_sample,
        grad_logits: grads,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_ce_prefers_correct_logits() {
        let loss = Loss::CrossEntropy { label_smooth: 0.0 };
        let good = loss.compute(&[vec![4.0, -2.0, -2.0]], &[0]);
        let bad = loss.compute(&[vec![-2.0, 4.0, -2.0]], &[0]);
        assert!(good.loss < bad.loss);
    }

    #[test]
    fn test_ce_gradient_rows_sum_to_zero() {
        let loss = Loss::CrossEntropy { label_smooth: 0.1 };
        let out = loss.compute(&[vec![1.0, 0.5, -0.25], vec![0.0, 0.0, 3.0]], &[2, 0]);
        for row in &out.grad_logits {
            let sum: f64 = row.iter().map(|&g| f64::from(g)).sum();
            assert!(close(sum, 0.0), "row sums to {sum}");
        }
    }

    #[test]
    fn test_ce_gradient_points_away_from_target() {
        let loss = Loss::CrossEntropy { label_smooth: 0.0 };
        let out = loss.compute(&[vec![0.0, 0.0]], &[0]);
        // Target logit gradient negative, off-target positive.
        assert!(out.grad_logits[0][0] < 0.0);
        assert!(out.grad_logits[0][1] > 0.0);
    }

    #[test]
    fn test_bce_gradient_sign() {
        let loss = Loss::Bce { label_smooth: 0.0 };
        let out = loss.compute(&[vec![0.0, 0.0]], &[1]);
        assert!(out.grad_logits[0][0] > 0.0);
        assert!(out.grad_logits[0][1] < 0.0);
    }

    #[test]
    fn test_bce_matches_manual_value() {
        let loss = Loss::Bce { label_smooth: 0.0 };
        let out = loss.compute(&[vec![0.0, 0.0]], &[0]);
        // Both elements contribute ln(2); mean over 2 elements is ln(2).
        assert!(close(out.loss, std::f64::consts::LN_2));
    }

    #[test]
    fn test_focal_downweights_easy_examples() {
        let bce = Loss::Bce { label_smooth: 0.0 };
        let focal = Loss::Focal {
            alpha: 0.5,
            gamma: 2.0,
        };
        // Easy positive: large logit, correct class.
        let easy = [vec![6.0f32]];
        let bce_out = bce.compute(&easy, &[0]);
        let focal_out = focal.compute(&easy, &[0]);
        assert!(focal_out.loss < bce_out.loss);
        assert!(focal_out.grad_logits[0][0].abs() < bce_out.grad_logits[0][0].abs());
    }

    #[test]
    fn test_focal_gamma_zero_matches_weighted_bce_gradient() {
        // With gamma = 0 and alpha = 0.5, focal is bce scaled by 0.5.
        let bce = Loss::Bce { label_smooth: 0.0 };
        let focal = Loss::Focal {
            alpha: 0.5,
            gamma: 0.0,
        };
        let logits = [vec![0.7f32, -1.2]];
        let b = bce.compute(&logits, &[0]);
        let f = focal.compute(&logits, &[0]);
        for (gb, gf) in b.grad_logits[0].iter().zip(&f.grad_logits[0]) {
            assert!(close(f64::from(*gf), 0.5 * f64::from(*gb)));
        }
    }

    #[test]
    fn test_mixup_blend_is_linear() {
        let loss = Loss::CrossEntropy { label_smooth: 0.0 };
        let logits = [vec![0.5f32, -0.5, 1.0]];
        let a = loss.compute(&logits, &[0]);
        let b = loss.compute(&logits, &[2]);
        let mixed = loss.compute_mixup(&logits, &[0], &[2], 0.3);
        assert!(close(mixed.loss, 0.3 * a.loss + 0.7 * b.loss));
        for ((ga, gb), gm) in a.grad_logits[0]
            .iter()
            .zip(&b.grad_logits[0])
            .zip(&mixed.grad_logits[0])
        {
            assert!(close(
                f64::from(*gm),
                0.3 * f64::from(*ga) + 0.7 * f64::from(*gb)
            ));
        }
    }

    #[test]
    fn test_probabilities_heads() {
        let ce = Loss::CrossEntropy { label_smooth: 0.0 };
        let probs = ce.probabilities(&[vec![1.0, 1.0]]);
        assert!(close(f64::from(probs[0][0]), 0.5));

        let bce = Loss::Bce { label_smooth: 0.0 };
        let probs = bce.probabilities(&[vec![0.0, 0.0]]);
        assert!(close(f64::from(probs[0][0]), 0.5));
        assert!(close(f64::from(probs[0][1]), 0.5));
    }

    #[test]
    fn test_head_names() {
        assert_eq!(Loss::CrossEntropy { label_smooth: 0.0 }.name(), "ce");
        assert_eq!(Loss::Bce { label_smooth: 0.0 }.name(), "bce");
        assert_eq!(
            Loss::Focal {
                alpha: 0.25,
                gamma: 2.0
            }
            .name(),
            "focal"
        );
    }
}
