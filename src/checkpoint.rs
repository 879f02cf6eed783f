//! Checkpoint save/restore.
//!
//! Two named slots under the run directory: `last` is written every epoch,
//! `best` only when the epoch's fitness matches the running best. The two
//! writes are separate; a crash between them leaves `best` stale by at most
//! one epoch, which is acceptable and deliberate. Loading is a pure
//! deserialization contract over an explicit record schema — a bundle with
//! missing required fields is a corrupt checkpoint and resume aborts.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ema::EmaState;
use crate::error::{Result, VisionError};
use crate::model::StateDict;
use crate::optimizer::OptimizerState;
use crate::scaler::ScalerState;
use crate::scheduler::SchedulerState;

/// Everything needed to resume a run at `epoch + 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Epoch this record was written after.
    pub epoch: i64,
    /// Running best fitness.
    pub best_fitness: f64,
    /// Model weights.
    pub model: StateDict,
    /// Averaged-model weights and their update counter. The counter feeds
    /// the averaging decay schedule and must round-trip exactly.
    pub ema: EmaState,
    /// Optimizer state.
    pub optimizer: OptimizerState,
    /// Learning-rate scheduler state.
    pub scheduler: SchedulerState,
    /// Loss-scaler state, when mixed-precision bookkeeping is active.
    #[serde(default)]
    pub scaler: Option<ScalerState>,
    /// Wall-clock write time, for humans.
    #[serde(default)]
    pub saved_at: String,
}

/// Owns the `last`/`best` slots of a run directory.
pub struct CheckpointManager {
    last: PathBuf,
    best: PathBuf,
}

impl CheckpointManager {
    /// Attach to a run directory.
    #[must_use]
    pub fn new(run_dir: &Path) -> Self {
        Self {
            last: run_dir.join("last.json"),
            best: run_dir.join("best.json"),
        }
    }

    /// Path of the `last` slot.
    #[must_use]
    pub fn last_path(&self) -> &Path {
        &self.last
    }

    /// Path of the `best` slot.
    #[must_use]
    pub fn best_path(&self) -> &Path {
        &self.best
    }

    /// Write `last` unconditionally and `best` when `is_best`.
    ///
    /// # Errors
    ///
    /// Returns a checkpoint error when either write fails. In-memory
    /// training state is not rolled back; the next epoch writes again.
    pub fn save(&self, record: &mut CheckpointRecord, is_best: bool) -> Result<()> {
        record.saved_at = chrono::Utc::now().to_rfc3339();
        write_record(&self.last, record)?;
        if is_best {
            write_record(&self.best, record)?;
        }
        Ok(())
    }

    /// Load a checkpoint from an explicit path.
    ///
    /// # Errors
    ///
    /// Returns `CorruptCheckpoint` when the bundle is unparseable or misses
    /// required fields, or a checkpoint error when the file cannot be opened.
    pub fn load(path: &Path) -> Result<CheckpointRecord> {
        let file = File::open(path).map_err(|e| {
            VisionError::Checkpoint(format!("cannot open {}: {e}", path.display()))
        })?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| {
            VisionError::CorruptCheckpoint(format!("{}: {e}", path.display()))
        })
    }
}

fn write_record(path: &Path, record: &CheckpointRecord) -> Result<()> {
    let file = File::create(path).map_err(|e| {
        VisionError::Checkpoint(format!("cannot create {}: {e}", path.display()))
    })?;
    let writer = BufWriter::new(file);
    serde_json::to_writer(writer, record)
        .map_err(|e| VisionError::Checkpoint(format!("cannot serialize checkpoint: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimizerChoice;
    use crate::optimizer::Optimizer;
    use tempfile::TempDir;

    fn record(epoch: i64, best_fitness: f64) -> CheckpointRecord {
        let mut model = StateDict::new();
        model.insert("bias".into(), vec![0.1, 0.2]);
        CheckpointRecord {
            epoch,
            best_fitness,
            model: model.clone(),
            ema: EmaState {
                ema: model,
                updates: 17,
            },
            optimizer: Optimizer::new(OptimizerChoice::Sgd, 0.01, 0.0, 0.8).state_dict(),
            scheduler: crate::scheduler::SchedulerState { current_epoch: epoch },
            scaler: Some(crate::scaler::ScalerState::default()),
            saved_at: String::new(),
        }
    }

    #[test]
    fn test_save_writes_last_unconditionally() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path());

        manager.save(&mut record(3, 0.5), false).unwrap();
        assert!(manager.last_path().exists());
        assert!(!manager.best_path().exists());
    }

    #[test]
    fn test_save_writes_best_when_flagged() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path());

        manager.save(&mut record(3, 0.5), true).unwrap();
        assert!(manager.best_path().exists());

        let best = CheckpointManager::load(manager.best_path()).unwrap();
        assert_eq!(best.epoch, 3);
    }

    #[test]
    fn test_best_stays_stale_without_improvement() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path());

        manager.save(&mut record(3, 0.5), true).unwrap();
        manager.save(&mut record(4, 0.5), false).unwrap();

        let last = CheckpointManager::load(manager.last_path()).unwrap();
        let best = CheckpointManager::load(manager.best_path()).unwrap();
        assert_eq!(last.epoch, 4);
        assert_eq!(best.epoch, 3);
    }

    #[test]
    fn test_round_trip_preserves_every_field() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path());

        let mut original = record(7, 0.91);
        manager.save(&mut original, false).unwrap();
        let loaded = CheckpointManager::load(manager.last_path()).unwrap();

        assert_eq!(loaded.epoch, 7);
        assert_eq!(loaded.best_fitness, 0.91);
        assert_eq!(loaded.model, original.model);
        assert_eq!(loaded.ema.updates, 17);
        assert_eq!(loaded.optimizer, original.optimizer);
        assert_eq!(loaded.scheduler, original.scheduler);
        assert_eq!(loaded.scaler, original.scaler);
    }

    #[test]
    fn test_missing_required_field_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        // No `ema` field.
        std::fs::write(&path, r#"{"epoch": 1, "best_fitness": 0.5, "model": {}}"#).unwrap();

        let result = CheckpointManager::load(&path);
        assert!(matches!(result, Err(VisionError::CorruptCheckpoint(_))));
    }

    #[test]
    fn test_garbage_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("garbage.json");
        std::fs::write(&path, "not json at all").unwrap();

        let result = CheckpointManager::load(&path);
        assert!(matches!(result, Err(VisionError::CorruptCheckpoint(_))));
    }

    #[test]
    fn test_missing_file_is_checkpoint_error() {
        let result = CheckpointManager::load(Path::new("/nonexistent/last.json"));
        assert!(matches!(result, Err(VisionError::Checkpoint(_))));
    }

    #[test]
    fn test_absent_scaler_stays_absent() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path());

        let mut r = record(1, 0.0);
        r.scaler = None;
        manager.save(&mut r, false).unwrap();

        let loaded = CheckpointManager::load(manager.last_path()).unwrap();
        assert!(loaded.scaler.is_none());
    }
}
