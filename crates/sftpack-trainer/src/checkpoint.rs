//! Training checkpoint save/load functionality.
//!
//! A checkpoint directory (`step_<n>/`, `epoch_<n>/` or `best/`) holds:
//!
//! - `metadata.json`: step, epoch, losses and learning rate, readable on its own
//! - `state.json`: the full [`TrainerSnapshot`] (parameters, optimizer,
//!   schedule and reweighting state)
//!
//! A `latest` marker file names the most recent directory. Writes go through
//! a temporary file and a rename, and are retried per the manager's
//! [`RetryPolicy`].

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use sftpack_core::{Result, ScheduleState, SftPackError, TrainingConfig};

use crate::ladamw::LAdamWState;
use crate::params::ParameterSet;
use crate::retry::RetryPolicy;
use crate::reweight::ReweightState;
use crate::training_loop::TrainingState;

const METADATA_FILE: &str = "metadata.json";
const STATE_FILE: &str = "state.json";
const LATEST_MARKER: &str = "latest";
const BEST_DIR: &str = "best";

/// Training state metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Optimizer steps committed.
    pub step: usize,
    /// Current epoch.
    pub epoch: usize,
    /// Running loss average.
    pub running_loss: f64,
    /// Best evaluation loss seen.
    pub best_eval_loss: Option<f64>,
    /// Learning rate at checkpoint.
    pub learning_rate: f64,
    /// Training configuration (as JSON string).
    pub training_config: Option<String>,
    /// Random seed used.
    pub seed: u64,
    /// Timestamp (RFC 3339).
    pub timestamp: String,
}

impl CheckpointMetadata {
    /// Create new metadata for the current training state.
    pub fn new(step: usize, epoch: usize, running_loss: f64, learning_rate: f64) -> Self {
        Self {
            step,
            epoch,
            running_loss,
            best_eval_loss: None,
            learning_rate,
            training_config: None,
            seed: 42,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Set the best evaluation loss.
    pub fn with_best_eval_loss(mut self, loss: Option<f64>) -> Self {
        self.best_eval_loss = loss;
        self
    }

    /// Set the training configuration.
    pub fn with_training_config(mut self, config: &TrainingConfig) -> Self {
        self.training_config = serde_json::to_string(config).ok();
        self
    }

    /// Set the seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Everything needed to resume a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerSnapshot {
    /// Summary of the run at save time.
    pub metadata: CheckpointMetadata,
    /// Loop position.
    pub training: TrainingState,
    /// Model parameters.
    pub parameters: ParameterSet,
    /// Optimizer moments and step counter.
    pub optimizer: LAdamWState,
    /// Scheduler position.
    pub schedule: ScheduleState,
    /// Reweighting curriculum state.
    pub reweight: ReweightState,
}

/// Which cadence produced a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointTag {
    /// Saved after an optimizer step.
    Step(usize),
    /// Saved at the end of an epoch.
    Epoch(usize),
}

impl CheckpointTag {
    /// Directory name of the checkpoint.
    pub fn dir_name(&self) -> String {
        match self {
            Self::Step(step) => format!("step_{step}"),
            Self::Epoch(epoch) => format!("epoch_{epoch}"),
        }
    }
}

/// Checkpoint manager for saving and loading training state.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    /// Base directory for checkpoints.
    checkpoint_dir: PathBuf,
    /// Maximum number of checkpoints to keep (None = unlimited).
    max_checkpoints: Option<usize>,
    /// Save best model separately.
    save_best: bool,
    retry: RetryPolicy,
}

impl CheckpointManager {
    /// Create a new checkpoint manager.
    pub fn new<P: AsRef<Path>>(checkpoint_dir: P) -> Result<Self> {
        let checkpoint_dir = checkpoint_dir.as_ref().to_path_buf();
        fs::create_dir_all(&checkpoint_dir).map_err(|e| {
            SftPackError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create checkpoint directory: {}", e),
            ))
        })?;

        Ok(Self {
            checkpoint_dir,
            max_checkpoints: Some(5),
            save_best: true,
            retry: RetryPolicy::default(),
        })
    }

    /// Manager under `<output_dir>/checkpoints` with the configured rotation
    /// and retry budget.
    pub fn from_training_config(config: &TrainingConfig) -> Result<Self> {
        Ok(Self::new(Path::new(&config.output_dir).join("checkpoints"))?
            .with_max_checkpoints(config.max_checkpoints)
            .with_retry_policy(RetryPolicy::new(config.io_retries)))
    }

    /// Set maximum number of checkpoints to keep.
    pub fn with_max_checkpoints(mut self, max: Option<usize>) -> Self {
        self.max_checkpoints = max;
        self
    }

    /// Set whether to save best model separately.
    pub fn with_save_best(mut self, save_best: bool) -> Self {
        self.save_best = save_best;
        self
    }

    /// Set the retry policy for writes.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Save a training checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`SftPackError::Resource`] once the write retries are exhausted.
    pub fn save_checkpoint(
        &self,
        snapshot: &TrainerSnapshot,
        tag: CheckpointTag,
        is_best: bool,
    ) -> Result<PathBuf> {
        let name = tag.dir_name();
        let dir = self.checkpoint_dir.join(&name);

        self.retry.run("checkpoint write", || {
            write_snapshot(&dir, snapshot)?;
            self.update_latest_marker(&name)
        })?;

        if is_best && self.save_best {
            let best_dir = self.checkpoint_dir.join(BEST_DIR);
            self.retry
                .run("best checkpoint write", || write_snapshot(&best_dir, snapshot))?;
            tracing::info!(step = snapshot.metadata.step, "Saved best checkpoint");
        }

        self.cleanup_old_checkpoints()?;

        tracing::info!(
            step = snapshot.metadata.step,
            path = %dir.display(),
            "Saved checkpoint"
        );

        Ok(dir)
    }

    /// Update the "latest" marker.
    fn update_latest_marker(&self, name: &str) -> Result<()> {
        let latest_path = self.checkpoint_dir.join(LATEST_MARKER);
        let tmp = latest_path.with_extension("tmp");
        fs::write(&tmp, name.as_bytes())?;
        fs::rename(&tmp, &latest_path)?;
        Ok(())
    }

    /// Clean up old checkpoints, keeping only the most recent ones.
    ///
    /// The directory named by the latest marker is never removed.
    fn cleanup_old_checkpoints(&self) -> Result<()> {
        let Some(max) = self.max_checkpoints else {
            return Ok(());
        };

        let latest = self.latest_dir()?;
        let checkpoints = self.list_checkpoints()?;
        let excess = checkpoints.len().saturating_sub(max);
        let stale = checkpoints
            .into_iter()
            .filter(|(_, path)| latest.as_deref() != Some(path.as_path()))
            .take(excess);
        for (step, path) in stale {
            if let Err(e) = fs::remove_dir_all(&path) {
                tracing::warn!(step, error = %e, "Failed to remove old checkpoint");
            } else {
                tracing::debug!(step, "Removed old checkpoint");
            }
        }

        Ok(())
    }

    /// Load a checkpoint from a directory.
    pub fn load_checkpoint<P: AsRef<Path>>(checkpoint_path: P) -> Result<TrainerSnapshot> {
        let checkpoint_path = checkpoint_path.as_ref();
        let file = File::open(checkpoint_path.join(STATE_FILE)).map_err(|e| {
            SftPackError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to open checkpoint state: {}", e),
            ))
        })?;
        let snapshot: TrainerSnapshot = serde_json::from_reader(BufReader::new(file))?;

        tracing::info!(
            step = snapshot.metadata.step,
            path = %checkpoint_path.display(),
            "Loaded checkpoint"
        );

        Ok(snapshot)
    }

    /// Load only the metadata of a checkpoint.
    pub fn load_metadata<P: AsRef<Path>>(checkpoint_path: P) -> Result<CheckpointMetadata> {
        let file = File::open(checkpoint_path.as_ref().join(METADATA_FILE))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Directory named by the latest marker, if any.
    fn latest_dir(&self) -> Result<Option<PathBuf>> {
        let latest_path = self.checkpoint_dir.join(LATEST_MARKER);
        if !latest_path.exists() {
            return Ok(None);
        }
        let name = fs::read_to_string(&latest_path)?;
        Ok(Some(self.checkpoint_dir.join(name.trim())))
    }

    /// Load the latest checkpoint.
    pub fn load_latest(&self) -> Result<Option<TrainerSnapshot>> {
        match self.latest_dir()? {
            Some(path) if path.exists() => Self::load_checkpoint(&path).map(Some),
            _ => Ok(None),
        }
    }

    /// Load the best checkpoint.
    pub fn load_best(&self) -> Result<Option<TrainerSnapshot>> {
        let best_path = self.checkpoint_dir.join(BEST_DIR);
        if best_path.exists() {
            Self::load_checkpoint(&best_path).map(Some)
        } else {
            Ok(None)
        }
    }

    /// List step and epoch checkpoints, oldest first.
    ///
    /// Checkpoints of the same step are ordered by write time.
    pub fn list_checkpoints(&self) -> Result<Vec<(usize, PathBuf)>> {
        let mut checkpoints: Vec<(usize, Option<SystemTime>, PathBuf)> = fs::read_dir(&self.checkpoint_dir)
            .map_err(|e| {
                SftPackError::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to read checkpoint directory: {}", e),
                ))
            })?
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                name.starts_with("step_") || name.starts_with("epoch_")
            })
            .filter_map(|entry| {
                let path = entry.path();
                let step = Self::load_metadata(&path).ok()?.step;
                let written = fs::metadata(path.join(STATE_FILE))
                    .and_then(|m| m.modified())
                    .ok();
                Some((step, written, path))
            })
            .collect();

        checkpoints.sort();
        Ok(checkpoints
            .into_iter()
            .map(|(step, _, path)| (step, path))
            .collect())
    }

    /// Get the checkpoint directory.
    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }
}

fn write_snapshot(dir: &Path, snapshot: &TrainerSnapshot) -> Result<()> {
    fs::create_dir_all(dir)?;

    let state_tmp = dir.join(format!("{STATE_FILE}.tmp"));
    {
        let mut writer = BufWriter::new(File::create(&state_tmp)?);
        serde_json::to_writer(&mut writer, snapshot)?;
        writer.flush()?;
    }
    fs::rename(&state_tmp, dir.join(STATE_FILE))?;

    let metadata_json = serde_json::to_string_pretty(&snapshot.metadata)?;
    fs::write(dir.join(METADATA_FILE), metadata_json)?;
    Ok(())
}
