//! Augmentation pipeline stages.
//!
//! Transform stages are a tagged enum rather than opaque callables, so the
//! strategy scheduler can enumerate a pipeline and rewrite the size-bearing
//! stages in place (progressive resizing) without disturbing order or any
//! non-size stage.

use std::collections::BTreeMap;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use rand::Rng;
use serde::{Deserialize, Serialize};

fn default_flip_p() -> f64 {
    0.5
}

fn default_min_scale() -> f32 {
    0.6
}

/// A single named transform stage.
///
/// Size-bearing stages (`CenterCrop`, `Resize`, `RandomResizedCrop`,
/// `CenterCropAndResize`) encode a fixed output size and participate in
/// progressive resizing; every other stage passes through rewrites untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformStage {
    /// Crop a centered square of `size` pixels.
    CenterCrop {
        /// Output side length in pixels.
        size: u32,
    },
    /// Resize to `size` x `size`.
    Resize {
        /// Output side length in pixels.
        size: u32,
    },
    /// Crop a random sub-region and resize it to `size` x `size`.
    RandomResizedCrop {
        /// Output side length in pixels.
        size: u32,
        /// Lower bound of the sampled area scale.
        #[serde(default = "default_min_scale")]
        min_scale: f32,
    },
    /// Crop a centered square of `crop` pixels, then resize to `size`.
    CenterCropAndResize {
        /// Side length of the centered crop.
        crop: u32,
        /// Output side length after the resize.
        size: u32,
    },
    /// Mirror horizontally with probability `p`.
    HorizontalFlip {
        /// Flip probability.
        #[serde(default = "default_flip_p")]
        p: f64,
    },
    /// Random brightness/contrast perturbation.
    ColorJitter {
        /// Maximum absolute brightness shift, as a fraction of full scale.
        #[serde(default)]
        brightness: f32,
        /// Maximum absolute contrast shift.
        #[serde(default)]
        contrast: f32,
    },
    /// Convert pixels to a float tensor. Marker stage; the conversion itself
    /// happens when the dataset materializes features.
    ToTensor,
    /// Channel-wise normalization applied after `ToTensor`.
    Normalize {
        /// Per-channel means.
        mean: [f32; 3],
        /// Per-channel standard deviations.
        std: [f32; 3],
    },
}

impl TransformStage {
    /// Stage name as it appears in configuration files.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            TransformStage::CenterCrop { .. } => "center_crop",
            TransformStage::Resize { .. } => "resize",
            TransformStage::RandomResizedCrop { .. } => "random_resized_crop",
            TransformStage::CenterCropAndResize { .. } => "center_crop_and_resize",
            TransformStage::HorizontalFlip { .. } => "horizontal_flip",
            TransformStage::ColorJitter { .. } => "color_jitter",
            TransformStage::ToTensor => "to_tensor",
            TransformStage::Normalize { .. } => "normalize",
        }
    }

    /// Whether this stage encodes a fixed output size.
    #[must_use]
    pub fn is_size_bearing(&self) -> bool {
        matches!(
            self,
            TransformStage::CenterCrop { .. }
                | TransformStage::Resize { .. }
                | TransformStage::RandomResizedCrop { .. }
                | TransformStage::CenterCropAndResize { .. }
        )
    }

    /// Whether this stage draws randomness when applied.
    #[must_use]
    pub fn is_stochastic(&self) -> bool {
        matches!(
            self,
            TransformStage::RandomResizedCrop { .. }
                | TransformStage::HorizontalFlip { .. }
                | TransformStage::ColorJitter { .. }
        )
    }

    /// Rewrite the stage's output size in place, variant by variant.
    ///
    /// A bare `CenterCrop` becomes `CenterCropAndResize` (crop at the original
    /// side, resize to the new one) so the crop statistics are preserved while
    /// the output lands at the new resolution. Non-size stages are returned
    /// unchanged.
    #[must_use]
    pub fn rewrite_size(self, new_size: u32) -> TransformStage {
        match self {
            TransformStage::CenterCrop { size } => TransformStage::CenterCropAndResize {
                crop: size,
                size: new_size,
            },
            TransformStage::Resize { .. } => TransformStage::Resize { size: new_size },
            TransformStage::RandomResizedCrop { min_scale, .. } => {
                TransformStage::RandomResizedCrop {
                    size: new_size,
                    min_scale,
                }
            }
            TransformStage::CenterCropAndResize { crop, .. } => {
                TransformStage::CenterCropAndResize {
                    crop,
                    size: new_size,
                }
            }
            other => other,
        }
    }

    /// Apply the stage to an image. `ToTensor` and `Normalize` are markers
    /// interpreted at feature-materialization time and pass through here.
    pub fn apply<R: Rng>(&self, img: DynamicImage, rng: &mut R) -> DynamicImage {
        match self {
            TransformStage::CenterCrop { size } => center_crop(&img, *size),
            TransformStage::Resize { size } => {
                img.resize_exact(*size, *size, FilterType::Triangle)
            }
            TransformStage::RandomResizedCrop { size, min_scale } => {
                let (w, h) = img.dimensions();
                let scale = rng.gen_range(f64::from(*min_scale)..=1.0);
                let cw = ((f64::from(w) * scale) as u32).max(1);
                let ch = ((f64::from(h) * scale) as u32).max(1);
                let x = rng.gen_range(0..=w.saturating_sub(cw));
                let y = rng.gen_range(0..=h.saturating_sub(ch));
                img.crop_imm(x, y, cw, ch)
                    .resize_exact(*size, *size, FilterType::Triangle)
            }
            TransformStage::CenterCropAndResize { crop, size } => {
                center_crop(&img, *crop).resize_exact(*size, *size, FilterType::Triangle)
            }
            TransformStage::HorizontalFlip { p } => {
                if rng.gen::<f64>() < *p {
                    img.fliph()
                } else {
                    img
                }
            }
            TransformStage::ColorJitter {
                brightness,
                contrast,
            } => {
                let mut out = img;
                if *brightness > 0.0 {
                    let shift = rng.gen_range(-brightness..=*brightness) * 255.0;
                    out = out.brighten(shift as i32);
                }
                if *contrast > 0.0 {
                    let shift = rng.gen_range(-contrast..=*contrast) * 100.0;
                    out = out.adjust_contrast(shift);
                }
                out
            }
            TransformStage::ToTensor | TransformStage::Normalize { .. } => img,
        }
    }
}

fn center_crop(img: &DynamicImage, size: u32) -> DynamicImage {
    let (w, h) = img.dimensions();
    let cw = size.min(w);
    let ch = size.min(h);
    let x = (w - cw) / 2;
    let y = (h - ch) / 2;
    img.crop_imm(x, y, cw, ch)
}

/// An ordered, enumerable, in-place-rewritable sequence of transform stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AugmentPipeline {
    /// The stages, applied in order.
    pub stages: Vec<TransformStage>,
}

impl AugmentPipeline {
    /// Build a pipeline from a stage list.
    #[must_use]
    pub fn new(stages: Vec<TransformStage>) -> Self {
        Self { stages }
    }

    /// Apply every stage in order.
    pub fn apply<R: Rng>(&self, img: DynamicImage, rng: &mut R) -> DynamicImage {
        self.stages
            .iter()
            .fold(img, |acc, stage| stage.apply(acc, rng))
    }

    /// Rewrite every size-bearing stage to `new_size`, preserving order and
    /// all non-size stages.
    pub fn rewrite_sizes(&mut self, new_size: u32) {
        for stage in &mut self.stages {
            let rewritten = stage.clone().rewrite_size(new_size);
            *stage = rewritten;
        }
    }

    /// Weaken augmentation: stochastic crops collapse to deterministic
    /// resizes at the same output size, and flip/jitter stages are dropped.
    pub fn weaken(&mut self) {
        let mut weakened = Vec::with_capacity(self.stages.len());
        for stage in self.stages.drain(..) {
            match stage {
                TransformStage::RandomResizedCrop { size, .. } => {
                    weakened.push(TransformStage::Resize { size });
                }
                TransformStage::HorizontalFlip { .. } | TransformStage::ColorJitter { .. } => {}
                other => weakened.push(other),
            }
        }
        self.stages = weakened;
    }

    /// The identity counterpart of this pipeline: only its deterministic
    /// size-bearing tail plus tensor-conversion stages survive. Used for the
    /// epoch-0 warmup pipeline.
    #[must_use]
    pub fn identity(&self) -> AugmentPipeline {
        let stages = self
            .stages
            .iter()
            .filter(|s| !s.is_stochastic())
            .cloned()
            .collect();
        AugmentPipeline { stages }
    }

    /// Whether a `Normalize` stage is present.
    #[must_use]
    pub fn has_normalize(&self) -> bool {
        self.stages
            .iter()
            .any(|s| matches!(s, TransformStage::Normalize { .. }))
    }

    /// Normalization parameters, if a `Normalize` stage is present.
    #[must_use]
    pub fn normalize_params(&self) -> Option<([f32; 3], [f32; 3])> {
        self.stages.iter().find_map(|s| match s {
            TransformStage::Normalize { mean, std } => Some((*mean, *std)),
            _ => None,
        })
    }

    /// Output side length of the last size-bearing stage, if any.
    #[must_use]
    pub fn output_size(&self) -> Option<u32> {
        self.stages.iter().rev().find_map(|s| match s {
            TransformStage::CenterCrop { size }
            | TransformStage::Resize { size }
            | TransformStage::RandomResizedCrop { size, .. }
            | TransformStage::CenterCropAndResize { size, .. } => Some(*size),
            _ => None,
        })
    }

    /// Stage names in order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(TransformStage::name).collect()
    }
}

/// Train-time augmenter: a base pipeline, optional per-class overrides, and
/// an optional common tail shared by every class.
///
/// Progressive resizing rewrites size-bearing stages in all three places.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassWiseAugmenter {
    /// Pipeline applied when no class-specific override exists.
    pub base: AugmentPipeline,
    /// Per-class override pipelines, keyed by class index.
    #[serde(default)]
    pub class_pipelines: BTreeMap<usize, AugmentPipeline>,
    /// Tail applied to every sample after the base or override.
    #[serde(default)]
    pub common: Option<AugmentPipeline>,
}

impl ClassWiseAugmenter {
    /// Build an augmenter with only a base pipeline.
    #[must_use]
    pub fn from_base(base: AugmentPipeline) -> Self {
        Self {
            base,
            class_pipelines: BTreeMap::new(),
            common: None,
        }
    }

    /// Apply the pipeline for `class_idx`.
    pub fn apply<R: Rng>(&self, img: DynamicImage, class_idx: usize, rng: &mut R) -> DynamicImage {
        let pipeline = self.class_pipelines.get(&class_idx).unwrap_or(&self.base);
        let img = pipeline.apply(img, rng);
        match &self.common {
            Some(common) => common.apply(img, rng),
            None => img,
        }
    }

    /// Rewrite size-bearing stages everywhere: base, per-class, common.
    pub fn rewrite_sizes(&mut self, new_size: u32) {
        self.base.rewrite_sizes(new_size);
        for pipeline in self.class_pipelines.values_mut() {
            pipeline.rewrite_sizes(new_size);
        }
        if let Some(common) = &mut self.common {
            common.rewrite_sizes(new_size);
        }
    }

    /// Weaken the base and per-class pipelines. The common tail (typically
    /// `to_tensor`/`normalize`) is left alone.
    pub fn weaken(&mut self) {
        self.base.weaken();
        for pipeline in self.class_pipelines.values_mut() {
            pipeline.weaken();
        }
    }

    /// Normalization parameters from any constituent pipeline.
    #[must_use]
    pub fn normalize_params(&self) -> Option<([f32; 3], [f32; 3])> {
        self.base
            .normalize_params()
            .or_else(|| self.common.as_ref().and_then(AugmentPipeline::normalize_params))
    }
}
