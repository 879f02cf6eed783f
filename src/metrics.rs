//! Validation metrics.
//!
//! Top-1/top-5 accuracy for the multi-class head; micro-averaged
//! precision/recall/F1 at a fixed decision threshold for the label head.
//! One scalar per epoch — the fitness — drives best-checkpoint selection.

/// Fraction of samples whose true label lands in the top `k` predictions.
#[must_use]
pub fn top_k_accuracy(probs: &[Vec<f32>], labels: &[usize], k: usize) -> f64 {
    if probs.is_empty() {
        return 0.0;
    }
    let hits = probs
        .iter()
        .zip(labels)
        .filter(|(row, &label)| {
            let own = row[label];
            let better = row.iter().filter(|&&p| p > own).count();
            better < k
        })
        .count();
    hits as f64 / probs.len() as f64
}

/// Micro-averaged precision, recall and F1 at `thresh`, treating the label
/// as a one-hot target.
#[must_use]
pub fn precision_recall_f1(probs: &[Vec<f32>], labels: &[usize], thresh: f64) -> (f64, f64, f64) {
    let mut tp = 0u64;
    let mut fp = 0u64;
    let mut fn_ = 0u64;

    for (row, &label) in probs.iter().zip(labels) {
        for (c, &p) in row.iter().enumerate() {
            let predicted = f64::from(p) >= thresh;
            let target = c == label;
            match (predicted, target) {
                (true, true) => tp += 1,
                (true, false) => fp += 1,
                (false, true) => fn_ += 1,
                (false, false) => {}
            }
        }
    }

    let precision = if tp + fp == 0 {
        0.0
    } else {
        tp as f64 / (tp + fp) as f64
    };
    let recall = if tp + fn_ == 0 {
        0.0
    } else {
        tp as f64 / (tp + fn_) as f64
    };
    let f1 = if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    };
    (precision, recall, f1)
}

/// The epoch fitness: top-1 accuracy for the multi-class head, F1 at the
/// configured threshold for the label head.
#[must_use]
pub fn fitness(multi_class: bool, probs: &[Vec<f32>], labels: &[usize], thresh: f64) -> f64 {
    if multi_class {
        top_k_accuracy(probs, labels, 1)
    } else {
        precision_recall_f1(probs, labels, thresh).2
    }
}
