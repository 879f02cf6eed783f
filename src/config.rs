//! Configuration parsing and validation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::augment::{AugmentPipeline, TransformStage};
use crate::error::{Result, VisionError};

/// Model kwargs accepted alongside pretrained weights. Anything else would
/// change the architecture under the pretrained weights.
const PRETRAINED_KWARGS: [&str; 3] = ["dropout", "attention_dropout", "stochastic_depth_prob"];

/// Recognized model source families, as the prefix of `model.choice`.
const MODEL_FAMILIES: [&str; 2] = ["torchvision", "custom"];

/// Main configuration for a training run.
///
/// # Example
///
/// ```rust
/// use visiontrain_rs::VisionConfig;
///
/// # fn main() -> visiontrain_rs::Result<()> {
/// // Create from a preset
/// let config = VisionConfig::from_preset("shufflenet")?;
/// assert_eq!(config.model.choice, "torchvision-shufflenet_v2_x1_0");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionConfig {
    /// Model section.
    pub model: ModelConfig,

    /// Data section.
    pub data: DataConfig,

    /// Hyperparameter section.
    pub hyp: HypConfig,

    /// Run directory root; fresh runs increment it (`exp`, `exp2`, ...).
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Random seed.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_output_dir() -> String {
    "./runs/exp".into()
}

fn default_seed() -> u64 {
    42
}

/// Model selection and construction knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model source tag, `<family>-<name>` with family one of
    /// `torchvision` or `custom`.
    pub choice: String,

    /// Number of output classes.
    pub num_classes: usize,

    /// Start from pretrained weights.
    #[serde(default)]
    pub pretrained: bool,

    /// Extra construction kwargs. Restricted to regularization knobs when
    /// `pretrained` is set.
    #[serde(default)]
    pub kwargs: BTreeMap<String, f64>,
}

/// Dataset layout and per-split settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Dataset root holding `train/` and `val/` folder-per-class trees.
    pub root: PathBuf,

    /// Base image size(s); progressive learning interpolates from half the
    /// minimum up to the minimum.
    pub imgsz: Vec<u32>,

    /// Loader worker threads. Throughput only.
    #[serde(default = "default_nw")]
    pub nw: usize,

    /// Training split settings.
    pub train: TrainSplitConfig,

    /// Validation split settings.
    pub val: ValSplitConfig,
}

fn default_nw() -> usize {
    4
}

/// Training split settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainSplitConfig {
    /// Batch size.
    #[serde(default = "default_bs")]
    pub bs: usize,

    /// Augmentation pipeline used after warmup.
    pub augment: AugmentPipeline,

    /// Post-warmup epoch at which augmentation strength is weakened.
    pub aug_epoch: i64,

    /// Optional per-class override pipelines.
    #[serde(default)]
    pub class_aug: BTreeMap<usize, AugmentPipeline>,

    /// Optional common tail applied to every class.
    #[serde(default)]
    pub common_aug: Option<AugmentPipeline>,
}

/// Validation split settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValSplitConfig {
    /// Batch size.
    #[serde(default = "default_bs")]
    pub bs: usize,

    /// Deterministic evaluation pipeline.
    pub augment: AugmentPipeline,
}

fn default_bs() -> usize {
    32
}

/// Optimizer choice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerChoice {
    /// Stochastic gradient descent with momentum.
    #[default]
    Sgd,
    /// Adam.
    Adam,
}

/// Learning rate schedule choice. The `*_with_warm` variants prepend a linear
/// momentum/lr warmup over `warm_ep` epochs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerChoice {
    /// Linear decay, no warmup.
    Linear,
    /// Cosine decay, no warmup.
    #[default]
    Cosine,
    /// Linear decay with warmup.
    LinearWithWarm,
    /// Cosine decay with warmup.
    CosineWithWarm,
}

impl SchedulerChoice {
    /// Whether the schedule carries a warmup ramp.
    #[must_use]
    pub fn has_warmup(&self) -> bool {
        matches!(
            self,
            SchedulerChoice::LinearWithWarm | SchedulerChoice::CosineWithWarm
        )
    }
}

/// Loss head selection. Exactly one of `ce`/`bce` must be enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    /// Cross-entropy head (multi-class).
    #[serde(default)]
    pub ce: bool,

    /// Binary-cross-entropy head (multi-label capable).
    #[serde(default)]
    pub bce: BceConfig,
}

/// Binary-cross-entropy head settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BceConfig {
    /// Whether the bce head is selected.
    #[serde(default)]
    pub enabled: bool,

    /// Decision threshold for precision/recall/F1.
    #[serde(default = "default_bce_thresh")]
    pub thresh: f64,

    /// Treat targets as multi-label.
    #[serde(default)]
    pub multi_label: bool,
}

fn default_bce_thresh() -> f64 {
    0.5
}

/// Epoch-wise strategy settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Mixup activation ratio and milestone window.
    #[serde(default)]
    pub mixup: MixupConfig,

    /// Progressive learning (image resizing + mixup strengthening).
    #[serde(default)]
    pub prog_learn: bool,

    /// Focal loss replacement for the bce head after warmup.
    #[serde(default)]
    pub focal: FocalConfig,

    /// Online hard-example mining.
    #[serde(default)]
    pub ohem: OhemConfig,
}

/// Mixup settings: activation probability and the post-warmup epoch window in
/// which it is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixupConfig {
    /// Probability in `[0, 1]` that mixup fires in an armed epoch.
    pub ratio: f64,

    /// `(start, end)` post-warmup epoch window, `start < end`.
    pub milestones: (i64, i64),
}

impl Default for MixupConfig {
    fn default() -> Self {
        Self {
            ratio: 0.0,
            milestones: (0, 1),
        }
    }
}

/// Focal loss settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocalConfig {
    /// Whether focal replaces bce after warmup.
    #[serde(default)]
    pub enabled: bool,

    /// Positive-class weight.
    #[serde(default = "default_focal_alpha")]
    pub alpha: f64,

    /// Focusing exponent.
    #[serde(default = "default_focal_gamma")]
    pub gamma: f64,
}

fn default_focal_alpha() -> f64 {
    0.25
}

fn default_focal_gamma() -> f64 {
    2.0
}

impl Default for FocalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            alpha: default_focal_alpha(),
            gamma: default_focal_gamma(),
        }
    }
}

/// Hard-example mining settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhemConfig {
    /// Whether hard-example sampling replaces uniform shuffling.
    #[serde(default)]
    pub enabled: bool,

    /// Minimum number of samples kept per epoch regardless of loss.
    #[serde(default = "default_ohem_min_kept")]
    pub min_kept: usize,

    /// Loss threshold above which a sample counts as hard.
    #[serde(default = "default_ohem_thresh")]
    pub thresh: f64,
}

fn default_ohem_min_kept() -> usize {
    16
}

fn default_ohem_thresh() -> f64 {
    0.7
}

impl Default for OhemConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_kept: default_ohem_min_kept(),
            thresh: default_ohem_thresh(),
        }
    }
}

/// Training hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypConfig {
    /// Number of post-warmup training epochs.
    pub epochs: i64,

    /// Warmup epochs prepended to the schedule.
    #[serde(default)]
    pub warm_ep: i64,

    /// Initial learning rate.
    #[serde(default = "default_lr0")]
    pub lr0: f64,

    /// Final learning rate as a fraction of `lr0`.
    #[serde(default = "default_lrf_ratio")]
    pub lrf_ratio: f64,

    /// Steady-state optimizer momentum.
    #[serde(default = "default_momentum")]
    pub momentum: f64,

    /// Momentum used during warmup epochs.
    #[serde(default = "default_warmup_momentum")]
    pub warmup_momentum: f64,

    /// Weight decay.
    #[serde(default)]
    pub weight_decay: f64,

    /// Label smoothing for the active head.
    #[serde(default)]
    pub label_smooth: f64,

    /// Optimizer choice.
    #[serde(default)]
    pub optimizer: OptimizerChoice,

    /// Learning rate schedule choice.
    #[serde(default)]
    pub scheduler: SchedulerChoice,

    /// Loss head selection.
    pub loss: LossConfig,

    /// Strategy settings.
    #[serde(default)]
    pub strategy: StrategyConfig,
}

fn default_lr0() -> f64 {
    0.01
}

fn default_lrf_ratio() -> f64 {
    0.01
}

fn default_momentum() -> f64 {
    0.937
}

fn default_warmup_momentum() -> f64 {
    0.8
}

impl VisionConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"shufflenet"` - pretrained multi-class setup with mixup
    /// - `"mobilenet-multilabel"` - bce head with focal switching
    /// - `"linear-scratch"` - from-scratch reference model with OHEM
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown preset name.
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "shufflenet" => Ok(Self::shufflenet_preset()),
            "mobilenet-multilabel" => Ok(Self::mobilenet_multilabel_preset()),
            "linear-scratch" => Ok(Self::linear_scratch_preset()),
            _ => Err(VisionError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    fn pretrained_train_augment() -> AugmentPipeline {
        AugmentPipeline::new(vec![
            TransformStage::RandomResizedCrop {
                size: 224,
                min_scale: 0.6,
            },
            TransformStage::HorizontalFlip { p: 0.5 },
            TransformStage::ToTensor,
            TransformStage::Normalize {
                mean: [0.485, 0.456, 0.406],
                std: [0.229, 0.224, 0.225],
            },
        ])
    }

    fn pretrained_val_augment() -> AugmentPipeline {
        AugmentPipeline::new(vec![
            TransformStage::Resize { size: 224 },
            TransformStage::ToTensor,
            TransformStage::Normalize {
                mean: [0.485, 0.456, 0.406],
                std: [0.229, 0.224, 0.225],
            },
        ])
    }

    /// Pretrained multi-class preset with mixup and progressive learning.
    #[must_use]
    pub fn shufflenet_preset() -> Self {
        Self {
            model: ModelConfig {
                choice: "torchvision-shufflenet_v2_x1_0".into(),
                num_classes: 5,
                pretrained: true,
                kwargs: BTreeMap::new(),
            },
            data: DataConfig {
                root: "./data".into(),
                imgsz: vec![224, 224],
                nw: default_nw(),
                train: TrainSplitConfig {
                    bs: 32,
                    augment: Self::pretrained_train_augment(),
                    aug_epoch: 40,
                    class_aug: BTreeMap::new(),
                    common_aug: None,
                },
                val: ValSplitConfig {
                    bs: 32,
                    augment: Self::pretrained_val_augment(),
                },
            },
            hyp: HypConfig {
                epochs: 50,
                warm_ep: 3,
                lr0: 0.01,
                lrf_ratio: 0.01,
                momentum: 0.937,
                warmup_momentum: 0.8,
                weight_decay: 5e-4,
                label_smooth: 0.1,
                optimizer: OptimizerChoice::Sgd,
                scheduler: SchedulerChoice::CosineWithWarm,
                loss: LossConfig {
                    ce: true,
                    bce: BceConfig::default(),
                },
                strategy: StrategyConfig {
                    mixup: MixupConfig {
                        ratio: 0.2,
                        milestones: (10, 40),
                    },
                    prog_learn: true,
                    focal: FocalConfig::default(),
                    ohem: OhemConfig::default(),
                },
            },
            output_dir: default_output_dir(),
            seed: default_seed(),
        }
    }

    /// Multi-label preset on the bce head, switching to focal after warmup.
    #[must_use]
    pub fn mobilenet_multilabel_preset() -> Self {
        let mut config = Self::shufflenet_preset();
        config.model.choice = "torchvision-mobilenet_v3_small".into();
        config.hyp.optimizer = OptimizerChoice::Adam;
        config.hyp.scheduler = SchedulerChoice::LinearWithWarm;
        config.hyp.loss = LossConfig {
            ce: false,
            bce: BceConfig {
                enabled: true,
                thresh: 0.5,
                multi_label: true,
            },
        };
        config.hyp.strategy.focal = FocalConfig {
            enabled: true,
            ..FocalConfig::default()
        };
        config.hyp.strategy.mixup = MixupConfig {
            ratio: 0.0,
            milestones: (0, 1),
        };
        config.hyp.strategy.prog_learn = false;
        config
    }

    /// From-scratch reference-model preset with hard-example mining.
    #[must_use]
    pub fn linear_scratch_preset() -> Self {
        let mut config = Self::shufflenet_preset();
        config.model.choice = "custom-linear".into();
        config.model.pretrained = false;
        config.hyp.warm_ep = 0;
        config.hyp.scheduler = SchedulerChoice::Cosine;
        config.hyp.strategy.prog_learn = false;
        config.hyp.strategy.mixup = MixupConfig {
            ratio: 0.0,
            milestones: (0, 1),
        };
        config.hyp.strategy.ohem = OhemConfig {
            enabled: true,
            ..OhemConfig::default()
        };
        // From-scratch training carries no normalize stage.
        config.data.train.augment = AugmentPipeline::new(vec![
            TransformStage::RandomResizedCrop {
                size: 224,
                min_scale: 0.6,
            },
            TransformStage::HorizontalFlip { p: 0.5 },
            TransformStage::ToTensor,
        ]);
        config.data.val.augment = AugmentPipeline::new(vec![
            TransformStage::Resize { size: 224 },
            TransformStage::ToTensor,
        ]);
        config
    }

    /// Validate the configuration. Runs once before any epoch; every check
    /// surfaces the specific violated invariant.
    ///
    /// # Errors
    ///
    /// Returns `VisionError::Config` naming the first violated rule.
    pub fn validate(&self) -> Result<()> {
        self.validate_model()?;
        self.validate_data()?;
        self.validate_loss()?;
        self.validate_schedule()?;
        self.validate_strategy()?;
        self.validate_class_folders()?;
        Ok(())
    }

    fn validate_model(&self) -> Result<()> {
        let family = self.model.choice.split('-').next().unwrap_or_default();
        if !MODEL_FAMILIES.contains(&family) {
            return Err(VisionError::Config(format!(
                "model.choice must be torchvision-<name> or custom-<name>, got {}",
                self.model.choice
            )));
        }

        if self.model.num_classes < 2 {
            return Err(VisionError::Config(
                "model.num_classes must be at least 2".into(),
            ));
        }

        if self.model.pretrained {
            for key in self.model.kwargs.keys() {
                if !PRETRAINED_KWARGS.contains(&key.as_str()) {
                    return Err(VisionError::Config(format!(
                        "kwargs `{key}` not allowed with pretrained weights; \
                         only {PRETRAINED_KWARGS:?} may be set"
                    )));
                }
            }
        }

        // Pretrained weights expect normalized inputs, and only then.
        let train_norm = self.data.train.augment.has_normalize();
        let val_norm = self.data.val.augment.has_normalize();
        let ok = if self.model.pretrained {
            train_norm && val_norm
        } else {
            !train_norm && !val_norm
        };
        if !ok {
            return Err(VisionError::Config(
                "normalize stage must be present in train and val pipelines iff \
                 model.pretrained is set"
                    .into(),
            ));
        }
        Ok(())
    }

    fn validate_data(&self) -> Result<()> {
        if self.data.imgsz.is_empty() || self.data.imgsz.iter().any(|&s| s == 0) {
            return Err(VisionError::Config(
                "data.imgsz must list at least one positive size".into(),
            ));
        }
        if self.data.train.bs == 0 || self.data.val.bs == 0 {
            return Err(VisionError::Config("batch sizes must be positive".into()));
        }
        Ok(())
    }

    fn validate_loss(&self) -> Result<()> {
        let selected = usize::from(self.hyp.loss.ce) + usize::from(self.hyp.loss.bce.enabled);
        if selected != 1 {
            return Err(VisionError::Config(
                "exactly one of hyp.loss.ce / hyp.loss.bce must be selected".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.hyp.label_smooth) {
            return Err(VisionError::Config(
                "hyp.label_smooth must be in [0, 1]".into(),
            ));
        }
        Ok(())
    }

    fn validate_schedule(&self) -> Result<()> {
        if self.hyp.epochs <= 0 {
            return Err(VisionError::Config("hyp.epochs must be positive".into()));
        }
        if self.hyp.warm_ep < 0 || self.hyp.warm_ep >= self.hyp.epochs {
            return Err(VisionError::Config(
                "hyp.warm_ep must be non-negative and smaller than hyp.epochs".into(),
            ));
        }
        let needs_warm = self.hyp.warm_ep > 0;
        if needs_warm != self.hyp.scheduler.has_warmup() {
            return Err(VisionError::Config(format!(
                "scheduler {:?} inconsistent with warm_ep {}: use the \
                 *_with_warm variants exactly when warm_ep > 0",
                self.hyp.scheduler, self.hyp.warm_ep
            )));
        }
        Ok(())
    }

    fn validate_strategy(&self) -> Result<()> {
        let strategy = &self.hyp.strategy;

        if strategy.focal.enabled && !self.hyp.loss.bce.enabled {
            return Err(VisionError::Config(
                "focal loss only supports the bce head".into(),
            ));
        }
        if strategy.ohem.enabled && self.hyp.loss.bce.enabled {
            return Err(VisionError::Config(
                "hard-example mining does not support the bce head".into(),
            ));
        }

        let mixup = &strategy.mixup;
        if !(0.0..=1.0).contains(&mixup.ratio) {
            return Err(VisionError::Config(format!(
                "mixup ratio must be in [0, 1], got {}",
                mixup.ratio
            )));
        }
        if mixup.milestones.0 >= mixup.milestones.1 {
            return Err(VisionError::Config(format!(
                "mixup milestones must be an increasing pair, got {:?}",
                mixup.milestones
            )));
        }

        if strategy.prog_learn {
            if mixup.ratio <= 0.0 {
                return Err(VisionError::Config(
                    "progressive learning requires mixup ratio > 0".into(),
                ));
            }
            if self.data.train.aug_epoch < mixup.milestones.1 {
                return Err(VisionError::Config(
                    "progressive learning requires aug_epoch >= mixup milestone end".into(),
                ));
            }
        }
        Ok(())
    }

    /// Discovered class folders under `<root>/train` must match
    /// `model.num_classes`. Hidden and underscore-prefixed entries are
    /// ignored, matching the dataset scanner.
    fn validate_class_folders(&self) -> Result<()> {
        let train_dir = self.data.root.join("train");
        let entries = std::fs::read_dir(&train_dir).map_err(|e| {
            VisionError::Config(format!(
                "cannot list training classes under {}: {e}",
                train_dir.display()
            ))
        })?;

        let mut count = 0usize;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if entry.file_type()?.is_dir() && !name.starts_with('.') && !name.starts_with('_') {
                count += 1;
            }
        }

        if count != self.model.num_classes {
            return Err(VisionError::Config(format!(
                "model.num_classes is {} but {} class folders were discovered under {}",
                self.model.num_classes,
                count,
                train_dir.display()
            )));
        }
        Ok(())
    }
}
