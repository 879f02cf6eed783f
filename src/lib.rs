//! # visiontrain-rs
//!
//! YAML-driven training orchestrator for image classification.
//!
//! Given a model, a folder-per-class dataset, and a hyperparameter
//! configuration, the trainer runs a multi-epoch train+validate loop that
//! adapts several strategies over time — warmup, mixup, progressive image
//! resizing, loss-function switching, hard-example sampling, and averaged
//! model weights — while persisting resumable `last`/`best` checkpoints.
//!
//! The heart of the crate is the epoch-wise [`strategy::StrategyScheduler`]:
//! a small state machine whose epoch-indexed triggers (momentum change,
//! augmentation change, loss change, resolution change, mixup on/off)
//! interact, and whose ordering determines training correctness.
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Validate configuration
//! visiontrain validate config.yaml
//!
//! # Start training
//! visiontrain train config.yaml
//!
//! # Resume from the last checkpoint
//! visiontrain train config.yaml --resume runs/exp/last.json
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use visiontrain_rs::{Trainer, VisionConfig};
//!
//! # fn main() -> visiontrain_rs::Result<()> {
//! let config = VisionConfig::from_file("config.yaml")?;
//! let mut trainer = Trainer::new(config)?;
//! trainer.run(None)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Using Presets
//!
//! ```rust
//! use visiontrain_rs::VisionConfig;
//!
//! # fn main() -> visiontrain_rs::Result<()> {
//! let mut config = VisionConfig::from_preset("shufflenet")?;
//! config.hyp.epochs = 20;
//! config.hyp.strategy.mixup.ratio = 0.3;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod augment;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod ema;
pub mod error;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod runner;
pub mod sampler;
pub mod scaler;
pub mod scheduler;
pub mod strategy;
pub mod trainer;

pub use config::VisionConfig;
pub use error::{Result, VisionError};
pub use trainer::Trainer;
