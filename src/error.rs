//! Error types for visiontrain-rs.
//!
//! This module provides error types and result aliases for the library.
//!
//! # Example - Error Handling
//!
//! ```rust
//! use visiontrain_rs::{VisionConfig, VisionError, Result};
//!
//! fn try_load_config(path: &str) -> Result<VisionConfig> {
//!     match VisionConfig::from_file(path) {
//!         Ok(config) => Ok(config),
//!         Err(e) => {
//!             eprintln!("Failed to load config: {}", e);
//!             Err(e)
//!         }
//!     }
//! }
//! ```
//!
//! # Example - Pattern Matching
//!
//! ```rust
//! use visiontrain_rs::{VisionConfig, VisionError};
//!
//! # fn main() {
//! match VisionConfig::from_preset("invalid-preset") {
//!     Ok(config) => println!("Loaded config"),
//!     Err(VisionError::Config(msg)) => {
//!         eprintln!("Configuration error: {}", msg);
//!     }
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # }
//! ```

use thiserror::Error;

/// Result type alias for visiontrain-rs operations.
///
/// # Example
///
/// ```rust
/// use visiontrain_rs::{VisionConfig, Result};
///
/// fn load_and_validate(path: &str) -> Result<VisionConfig> {
///     let config = VisionConfig::from_file(path)?;
///     config.validate()?;
///     Ok(config)
/// }
/// ```
pub type Result<T> = std::result::Result<T, VisionError>;

/// Errors that can occur in visiontrain-rs.
///
/// Configuration errors fail fast before any epoch runs; corrupt checkpoints
/// abort a resume with no partial restore; strategy precondition errors are
/// fatal because they indicate a gap the config validator should have caught.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum VisionError {
    /// Configuration error, carrying the specific violated invariant.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Model loading or construction error.
    #[error("model error: {0}")]
    Model(String),

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Checkpoint write error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Checkpoint with missing or malformed required fields; resume aborts.
    #[error("corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    /// Strategy precondition violated (e.g. a non-increasing resolution
    /// sequence from the milestone math). Fatal.
    #[error("strategy precondition: {0}")]
    Strategy(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl From<indicatif::style::TemplateError> for VisionError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        VisionError::Template(err.to_string())
    }
}
