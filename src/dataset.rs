//! Dataset loading and the data pipeline collaborator.
//!
//! Datasets are folder-per-class trees under `<root>/train` and
//! `<root>/val`. The processor owns the active augmentation pipelines and
//! exposes the seams the strategy scheduler drives: install/replace a
//! pipeline, weaken it at the milestone, and rewrite size-bearing stages for
//! progressive learning. Images are pooled into fixed-length feature vectors
//! so the model input stays stable while the training resolution changes.

use std::path::{Path, PathBuf};

use image::DynamicImage;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::augment::{AugmentPipeline, ClassWiseAugmenter};
use crate::config::{DataConfig, OhemConfig};
use crate::error::{Result, VisionError};

/// Side length of the adaptive pooling grid.
pub const POOL_GRID: u32 = 4;

/// Length of the pooled feature vector (RGB per grid cell).
pub const FEATURE_LEN: usize = (POOL_GRID * POOL_GRID * 3) as usize;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Which split a call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Training split.
    Train,
    /// Validation split.
    Val,
}

/// A batch of pooled features with their labels and dataset indices.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Pooled feature rows.
    pub features: Vec<Vec<f32>>,
    /// Class labels.
    pub labels: Vec<usize>,
    /// Dataset indices the rows came from (for hard-example bookkeeping).
    pub indices: Vec<usize>,
}

/// A folder-per-class dataset split.
#[derive(Debug, Clone)]
pub struct ImageFolderDataset {
    /// Class names, sorted; the index is the label.
    pub classes: Vec<String>,
    samples: Vec<(PathBuf, usize)>,
}

impl ImageFolderDataset {
    /// Scan `<root>/<split>` for class folders and their images. Hidden and
    /// underscore-prefixed entries are ignored, like the config validator.
    ///
    /// # Errors
    ///
    /// Returns a dataset error when the split directory cannot be read or
    /// contains no images.
    pub fn scan(root: &Path, split: &str) -> Result<Self> {
        let split_dir = root.join(split);
        let entries = std::fs::read_dir(&split_dir).map_err(|e| {
            VisionError::Dataset(format!("cannot read {}: {e}", split_dir.display()))
        })?;

        let mut classes = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_dir() && !name.starts_with('.') && !name.starts_with('_') {
                classes.push(name);
            }
        }
        classes.sort();

        let mut samples = Vec::new();
        for (label, class) in classes.iter().enumerate() {
            let class_dir = split_dir.join(class);
            let mut files: Vec<PathBuf> = std::fs::read_dir(&class_dir)?
                .filter_map(std::result::Result::ok)
                .map(|e| e.path())
                .filter(|p| {
                    p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                })
                .collect();
            files.sort();
            samples.extend(files.into_iter().map(|p| (p, label)));
        }

        if samples.is_empty() {
            return Err(VisionError::Dataset(format!(
                "no images found under {}",
                split_dir.display()
            )));
        }

        Ok(Self { classes, samples })
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the split is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Label of sample `index`.
    #[must_use]
    pub fn label(&self, index: usize) -> usize {
        self.samples[index].1
    }
}

/// Adaptive-average-pool an image into the fixed feature grid, optionally
/// normalizing per channel.
#[must_use]
pub fn pooled_features(
    img: &DynamicImage,
    normalize: Option<([f32; 3], [f32; 3])>,
) -> Vec<f32> {
    let rgb = img.to_rgb8();
    let (w, h) = rgb.dimensions();
    let mut features = vec![0.0f32; FEATURE_LEN];

    for gy in 0..POOL_GRID {
        for gx in 0..POOL_GRID {
            let x0 = gx * w / POOL_GRID;
            let x1 = ((gx + 1) * w / POOL_GRID).max(x0 + 1).min(w.max(1));
            let y0 = gy * h / POOL_GRID;
            let y1 = ((gy + 1) * h / POOL_GRID).max(y0 + 1).min(h.max(1));

            let mut sums = [0.0f64; 3];
            let mut count = 0.0f64;
            for y in y0..y1 {
                for x in x0..x1 {
                    let pixel = rgb.get_pixel(x, y);
                    for c in 0..3 {
                        sums[c] += f64::from(pixel[c]) / 255.0;
                    }
                    count += 1.0;
                }
            }

            let cell = ((gy * POOL_GRID + gx) * 3) as usize;
            for c in 0..3 {
                let mut v = (sums[c] / count.max(1.0)) as f32;
                if let Some((mean, std)) = normalize {
                    v = (v - mean[c]) / std[c];
                }
                features[cell + c] = v;
            }
        }
    }
    features
}

/// The data pipeline collaborator.
pub struct DataProcessor {
    /// Training split.
    pub train_dataset: ImageFolderDataset,
    /// Validation split.
    pub val_dataset: ImageFolderDataset,
    active_train: ClassWiseAugmenter,
    full_train: ClassWiseAugmenter,
    val_pipeline: AugmentPipeline,
    nw: usize,
    seed: u64,
}

impl DataProcessor {
    /// Scan both splits and stage the configured pipelines.
    ///
    /// # Errors
    ///
    /// Propagates scan failures.
    pub fn new(config: &DataConfig, seed: u64) -> Result<Self> {
        let train_dataset = ImageFolderDataset::scan(&config.root, "train")?;
        let val_dataset = ImageFolderDataset::scan(&config.root, "val")?;

        let full_train = ClassWiseAugmenter {
            base: config.train.augment.clone(),
            class_pipelines: config.train.class_aug.clone(),
            common: config.train.common_aug.clone(),
        };

        Ok(Self {
            train_dataset,
            val_dataset,
            active_train: full_train.clone(),
            full_train,
            val_pipeline: config.val.augment.clone(),
            nw: config.nw,
            seed,
        })
    }

    /// The full configured train augmenter (installed when warmup ends).
    #[must_use]
    pub fn full_augmenter(&self) -> ClassWiseAugmenter {
        self.full_train.clone()
    }

    /// The augmenter currently active for the training split.
    #[must_use]
    pub fn active_augmenter(&self) -> &ClassWiseAugmenter {
        &self.active_train
    }

    /// Install an augmenter for a phase. `None` installs the identity
    /// pipeline (the deterministic validation transforms), which is what
    /// warmup start uses.
    pub fn set_augmentation(&mut self, phase: Phase, augmenter: Option<ClassWiseAugmenter>) {
        match phase {
            Phase::Train => {
                self.active_train = augmenter
                    .unwrap_or_else(|| ClassWiseAugmenter::from_base(self.val_pipeline.clone()));
            }
            Phase::Val => {
                if let Some(augmenter) = augmenter {
                    self.val_pipeline = augmenter.base;
                }
            }
        }
    }

    /// Weaken the active train augmentation when the elapsed epoch hits the
    /// milestone. Other epochs are no-ops.
    pub fn weaken_augmentation(&mut self, elapsed_epoch: i64, milestone: i64) {
        if elapsed_epoch == milestone {
            self.active_train.weaken();
            tracing::info!("augmentation weakened at post-warmup epoch {elapsed_epoch}");
        }
    }

    /// Rewrite size-bearing stages of the active train augmenter.
    pub fn rewrite_train_sizes(&mut self, new_size: u32) {
        self.active_train.rewrite_sizes(new_size);
    }

    /// Load a batch of samples for a phase. With `nw > 1` the work is split
    /// across that many loader threads; results keep the input order either
    /// way, so parallelism stays a pure throughput knob.
    ///
    /// # Errors
    ///
    /// Returns a dataset error when an image cannot be read or decoded.
    pub fn load_batch(&self, phase: Phase, indices: &[usize], epoch: i64) -> Result<Batch> {
        let rows = if self.nw > 1 && indices.len() > 1 {
            let chunk_size = indices.len().div_ceil(self.nw);
            let mut joined = Vec::new();
            std::thread::scope(|scope| {
                let handles: Vec<_> = indices
                    .chunks(chunk_size)
                    .map(|chunk| {
                        scope.spawn(move || {
                            chunk
                                .iter()
                                .map(|&i| self.load_sample(phase, i, epoch))
                                .collect::<Result<Vec<_>>>()
                        })
                    })
                    .collect();
                for handle in handles {
                    joined.push(handle.join());
                }
            });

            let mut rows = Vec::with_capacity(indices.len());
            for result in joined {
                let chunk = result
                    .map_err(|_| VisionError::Dataset("loader worker panicked".into()))??;
                rows.extend(chunk);
            }
            rows
        } else {
            indices
                .iter()
                .map(|&i| self.load_sample(phase, i, epoch))
                .collect::<Result<Vec<_>>>()?
        };

        let mut batch = Batch {
            features: Vec::with_capacity(rows.len()),
            labels: Vec::with_capacity(rows.len()),
            indices: indices.to_vec(),
        };
        for (features, label) in rows {
            batch.features.push(features);
            batch.labels.push(label);
        }
        Ok(batch)
    }

    fn load_sample(&self, phase: Phase, index: usize, epoch: i64) -> Result<(Vec<f32>, usize)> {
        let dataset = match phase {
            Phase::Train => &self.train_dataset,
            Phase::Val => &self.val_dataset,
        };
        let (path, label) = &dataset.samples[index];
        let img = image::open(path)
            .map_err(|e| VisionError::Dataset(format!("cannot decode {}: {e}", path.display())))?;

        // Per-sample stream keyed on (seed, epoch, index) so loads are
        // deterministic regardless of worker scheduling.
        let mut rng = StdRng::seed_from_u64(
            self.seed
                ^ (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
                ^ (index as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9),
        );

        let (img, normalize) = match phase {
            Phase::Train => {
                let normalize = self.active_train.normalize_params();
                (self.active_train.apply(img, *label, &mut rng), normalize)
            }
            Phase::Val => {
                let normalize = self.val_pipeline.normalize_params();
                (self.val_pipeline.apply(img, &mut rng), normalize)
            }
        };

        Ok((pooled_features(&img, normalize), *label))
    }
}

/// Online hard-example sampler.
///
/// Records per-sample training losses and, on the next epoch, appends an
/// extra pass over the hardest examples (loss at or above the threshold, and
/// never fewer than `min_kept`) after the uniform shuffle. The processor has
/// a single sampler slot; mixup-based selection does not compose with it.
#[derive(Debug, Clone)]
pub struct OhemSampler {
    min_kept: usize,
    thresh: f64,
    losses: Vec<Option<f64>>,
}

impl OhemSampler {
    /// Create a sampler over `n` samples.
    #[must_use]
    pub fn new(config: &OhemConfig, n: usize) -> Self {
        Self {
            min_kept: config.min_kept,
            thresh: config.thresh,
            losses: vec![None; n],
        }
    }

    /// Record a sample's training loss.
    pub fn record(&mut self, index: usize, loss: f64) {
        if let Some(slot) = self.losses.get_mut(index) {
            *slot = Some(loss);
        }
    }

    /// Indices to visit this epoch: a uniform shuffle, plus an extra
    /// shuffled pass over the hard set once loss history exists.
    pub fn epoch_order<R: Rng>(&self, rng: &mut R) -> Vec<usize> {
        let n = self.losses.len();
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(rng);

        let mut seen: Vec<(usize, f64)> = self
            .losses
            .iter()
            .enumerate()
            .filter_map(|(i, loss)| loss.map(|l| (i, l)))
            .collect();
        if seen.is_empty() {
            return order;
        }

        seen.sort_by(|a, b| b.1.total_cmp(&a.1));
        let over_thresh = seen.iter().filter(|(_, l)| *l >= self.thresh).count();
        let kept = over_thresh.max(self.min_kept).min(seen.len());

        let mut hard: Vec<usize> = seen[..kept].iter().map(|&(i, _)| i).collect();
        hard.shuffle(rng);
        order.extend(hard);
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::augment::TransformStage;
    use image::RgbImage;
    use tempfile::TempDir;

    /// Write a small folder-per-class dataset of solid-color images.
    fn synthetic_dataset(classes: usize, per_class: usize) -> TempDir {
        let dir = TempDir::new().unwrap();
        for split in ["train", "val"] {
            for class in 0..classes {
                let class_dir = dir.path().join(split).join(format!("class_{class}"));
                std::fs::create_dir_all(&class_dir).unwrap();
                for i in 0..per_class {
                    let shade = (class * 60 + 40) as u8;
                    let img = RgbImage::from_fn(32, 32, |_, _| {
                        image::Rgb([shade, shade / 2, 255 - shade])
                    });
                    img.save(class_dir.join(format!("img_{i}.png"))).unwrap();
                }
            }
        }
        dir
    }

    fn data_config(root: &Path) -> DataConfig {
        DataConfig {
            root: root.to_path_buf(),
            imgsz: vec![32],
            nw: 2,
            train: crate::config::TrainSplitConfig {
                bs: 4,
                augment: AugmentPipeline::new(vec![
                    TransformStage::RandomResizedCrop {
                        size: 32,
                        min_scale: 0.6,
                    },
                    TransformStage::HorizontalFlip { p: 0.5 },
                    TransformStage::ToTensor,
                ]),
                aug_epoch: 8,
                class_aug: std::collections::BTreeMap::new(),
                common_aug: None,
            },
            val: crate::config::ValSplitConfig {
                bs: 4,
                augment: AugmentPipeline::new(vec![
                    TransformStage::Resize { size: 32 },
                    TransformStage::ToTensor,
                ]),
            },
        }
    }

    #[test]
    fn test_scan_discovers_classes_and_samples() {
        let dir = synthetic_dataset(3, 2);
        let dataset = ImageFolderDataset::scan(dir.path(), "train").unwrap();
        assert_eq!(dataset.classes.len(), 3);
        assert_eq!(dataset.len(), 6);
        assert_eq!(dataset.label(0), 0);
        assert_eq!(dataset.label(5), 2);
    }

    #[test]
    fn test_scan_missing_split_fails() {
        let dir = TempDir::new().unwrap();
        assert!(ImageFolderDataset::scan(dir.path(), "train").is_err());
    }

    #[test]
    fn test_pooled_features_shape_and_range() {
        let img = DynamicImage::new_rgb8(32, 32);
        let features = pooled_features(&img, None);
        assert_eq!(features.len(), FEATURE_LEN);
        assert!(features.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_pooled_features_normalization() {
        let img = DynamicImage::new_rgb8(8, 8); // all black
        let features = pooled_features(&img, Some(([0.5; 3], [0.5; 3])));
        assert!(features.iter().all(|&v| (v + 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_load_batch_shapes_and_order() {
        let dir = synthetic_dataset(2, 3);
        let processor = DataProcessor::new(&data_config(dir.path()), 0).unwrap();
        let batch = processor
            .load_batch(Phase::Train, &[0, 3, 1], 0)
            .unwrap();
        assert_eq!(batch.features.len(), 3);
        assert_eq!(batch.indices, vec![0, 3, 1]);
        assert_eq!(batch.labels, vec![0, 1, 0]);
        assert!(batch.features.iter().all(|f| f.len() == FEATURE_LEN));
    }

    #[test]
    fn test_load_batch_deterministic_across_workers() {
        let dir = synthetic_dataset(2, 4);
        let mut config = data_config(dir.path());
        config.nw = 1;
        let sequential = DataProcessor::new(&config, 7).unwrap();
        config.nw = 4;
        let threaded = DataProcessor::new(&config, 7).unwrap();

        let indices = [0, 1, 2, 3, 4, 5, 6, 7];
        let a = sequential.load_batch(Phase::Train, &indices, 3).unwrap();
        let b = threaded.load_batch(Phase::Train, &indices, 3).unwrap();
        assert_eq!(a.features, b.features);
    }

    #[test]
    fn test_set_augmentation_none_installs_identity() {
        let dir = synthetic_dataset(2, 2);
        let mut processor = DataProcessor::new(&data_config(dir.path()), 0).unwrap();
        processor.set_augmentation(Phase::Train, None);
        let active = processor.active_augmenter();
        assert!(active.base.stages.iter().all(|s| !s.is_stochastic()));
    }

    #[test]
    fn test_weaken_only_fires_at_milestone() {
        let dir = synthetic_dataset(2, 2);
        let mut processor = DataProcessor::new(&data_config(dir.path()), 0).unwrap();

        processor.weaken_augmentation(3, 8);
        assert!(processor
            .active_augmenter()
            .base
            .stages
            .iter()
            .any(TransformStage::is_stochastic));

        processor.weaken_augmentation(8, 8);
        assert!(processor
            .active_augmenter()
            .base
            .stages
            .iter()
            .all(|s| !s.is_stochastic()));
    }

    #[test]
    fn test_rewrite_train_sizes() {
        let dir = synthetic_dataset(2, 2);
        let mut processor = DataProcessor::new(&data_config(dir.path()), 0).unwrap();
        processor.rewrite_train_sizes(16);
        assert_eq!(processor.active_augmenter().base.output_size(), Some(16));
    }

    #[test]
    fn test_ohem_uniform_until_history_exists() {
        let sampler = OhemSampler::new(&OhemConfig::default(), 10);
        let mut rng = StdRng::seed_from_u64(0);
        let order = sampler.epoch_order(&mut rng);
        assert_eq!(order.len(), 10);
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_ohem_oversamples_hard_examples() {
        let config = OhemConfig {
            enabled: true,
            min_kept: 2,
            thresh: 1.0,
        };
        let mut sampler = OhemSampler::new(&config, 6);
        for i in 0..6 {
            sampler.record(i, if i < 2 { 5.0 } else { 0.1 });
        }

        let mut rng = StdRng::seed_from_u64(0);
        let order = sampler.epoch_order(&mut rng);
        assert_eq!(order.len(), 8);
        // The extra visits target the two high-loss samples.
        let extra = &order[6..];
        assert!(extra.contains(&0));
        assert!(extra.contains(&1));
    }

    #[test]
    fn test_ohem_never_keeps_fewer_than_min_kept() {
        let config = OhemConfig {
            enabled: true,
            min_kept: 3,
            thresh: 100.0, // nothing crosses the threshold
        };
        let mut sampler = OhemSampler::new(&config, 6);
        for i in 0..6 {
            sampler.record(i, i as f64);
        }

        let mut rng = StdRng::seed_from_u64(0);
        let order = sampler.epoch_order(&mut rng);
        assert_eq!(order.len(), 9);
        // Top-loss indices are 5, 4, 3.
        let extra: std::collections::BTreeSet<usize> = order[6..].iter().copied().collect();
        assert_eq!(extra, [3, 4, 5].into_iter().collect());
    }
}
