//! Checkpoint scheduling, directory layout and rotation.
//!
//! A checkpoint is first written into `checkpoint_<step>.partial/` and then
//! renamed, so a crash mid-save never leaves a directory that looks complete.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const PREFIX: &str = "checkpoint_";
const PARTIAL_SUFFIX: &str = ".partial";

/// Configuration for the checkpointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointerConfig {
    /// Directory to store checkpoints.
    pub checkpoint_dir: PathBuf,
    /// Training steps between saves (0 = never save on a schedule).
    pub save_interval: u64,
    /// Number of recent checkpoints to keep (0 = keep all).
    pub keep_last_n: usize,
}

impl Default for CheckpointerConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("./checkpoints"),
            save_interval: 10_000,
            keep_last_n: 5,
        }
    }
}

impl CheckpointerConfig {
    /// Create a new config with specified checkpoint directory.
    pub fn new(checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            ..Default::default()
        }
    }

    /// Set the save interval.
    pub fn with_save_interval(mut self, interval: u64) -> Self {
        self.save_interval = interval;
        self
    }

    /// Set the number of checkpoints to keep.
    pub fn with_keep_last_n(mut self, n: usize) -> Self {
        self.keep_last_n = n;
        self
    }
}

/// Error type for checkpointing operations.
#[derive(Debug)]
pub enum CheckpointError {
    /// IO error during save/load.
    Io(io::Error),
    /// Burn recorder error.
    Recorder(String),
    /// Metadata could not be encoded or decoded.
    Json(serde_json::Error),
    /// No checkpoints found.
    NoCheckpoints,
}

impl std::fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointError::Io(e) => write!(f, "IO error: {}", e),
            CheckpointError::Recorder(e) => write!(f, "Recorder error: {}", e),
            CheckpointError::Json(e) => write!(f, "Metadata error: {}", e),
            CheckpointError::NoCheckpoints => write!(f, "No checkpoints found"),
        }
    }
}

impl std::error::Error for CheckpointError {}

impl From<io::Error> for CheckpointError {
    fn from(e: io::Error) -> Self {
        CheckpointError::Io(e)
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(e: serde_json::Error) -> Self {
        CheckpointError::Json(e)
    }
}

/// State that can be written to and restored from a checkpoint directory.
pub trait Checkpointable {
    /// Write every file of the state into `dir` (which already exists).
    fn save_state(&self, dir: &Path) -> Result<(), CheckpointError>;

    /// Restore from `dir`, returning the saved training step.
    ///
    /// Implementations decode everything before replacing any live state.
    fn load_state(&mut self, dir: &Path) -> Result<u64, CheckpointError>;
}

/// Checkpoint metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointInfo {
    /// Checkpoint directory.
    pub path: PathBuf,
    /// Step at which checkpoint was saved.
    pub step: u64,
}

/// Saves, rotates and restores checkpoints.
pub struct Checkpointer {
    config: CheckpointerConfig,
}

impl Checkpointer {
    /// Create a new checkpointer.
    ///
    /// Creates the checkpoint directory if it doesn't exist.
    pub fn new(config: CheckpointerConfig) -> Result<Self, CheckpointError> {
        fs::create_dir_all(&config.checkpoint_dir)?;
        Ok(Self { config })
    }

    /// Get the configuration.
    pub fn config(&self) -> &CheckpointerConfig {
        &self.config
    }

    /// Check if it's time to save a checkpoint.
    pub fn should_save(&self, step: u64) -> bool {
        self.config.save_interval > 0 && step > 0 && step % self.config.save_interval == 0
    }

    /// Save `state` as the checkpoint for `step`, then drop old checkpoints.
    pub fn save<S: Checkpointable>(&mut self, state: &S, step: u64) -> Result<PathBuf, CheckpointError> {
        let name = format!("{}{:010}", PREFIX, step);
        let final_path = self.config.checkpoint_dir.join(&name);
        let partial = self
            .config
            .checkpoint_dir
            .join(format!("{}{}", name, PARTIAL_SUFFIX));

        if partial.exists() {
            fs::remove_dir_all(&partial)?;
        }
        fs::create_dir_all(&partial)?;
        state.save_state(&partial)?;

        if final_path.exists() {
            fs::remove_dir_all(&final_path)?;
        }
        fs::rename(&partial, &final_path)?;
        log::info!("Checkpoint saved: {}", final_path.display());

        self.cleanup_old_checkpoints()?;
        Ok(final_path)
    }

    /// Restore the checkpoint in `path` into `state`.
    pub fn load<S: Checkpointable>(&self, state: &mut S, path: &Path) -> Result<u64, CheckpointError> {
        let step = state.load_state(path)?;
        log::info!("Restored checkpoint {} (step {})", path.display(), step);
        Ok(step)
    }

    /// Restore the latest checkpoint into `state`.
    pub fn restore_latest<S: Checkpointable>(&self, state: &mut S) -> Result<u64, CheckpointError> {
        let latest = self.find_latest_checkpoint()?;
        self.load(state, &latest.path)
    }

    /// Find the latest complete checkpoint.
    pub fn find_latest_checkpoint(&self) -> Result<CheckpointInfo, CheckpointError> {
        self.list_checkpoints()?
            .pop()
            .ok_or(CheckpointError::NoCheckpoints)
    }

    /// List complete checkpoints, oldest first.
    pub fn list_checkpoints(&self) -> Result<Vec<CheckpointInfo>, CheckpointError> {
        let mut checkpoints: Vec<CheckpointInfo> = fs::read_dir(&self.config.checkpoint_dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                if !path.is_dir() {
                    return None;
                }
                let step = path.file_name()?.to_str()?.strip_prefix(PREFIX)?.parse().ok()?;
                Some(CheckpointInfo { path, step })
            })
            .collect();

        checkpoints.sort_by_key(|c| c.step);
        Ok(checkpoints)
    }

    /// Cleanup old checkpoints, keeping only the last N.
    fn cleanup_old_checkpoints(&mut self) -> Result<(), CheckpointError> {
        if self.config.keep_last_n == 0 {
            return Ok(());
        }

        let checkpoints = self.list_checkpoints()?;
        let excess = checkpoints.len().saturating_sub(self.config.keep_last_n);
        for old in &checkpoints[..excess] {
            if let Err(e) = fs::remove_dir_all(&old.path) {
                log::warn!("Could not remove old checkpoint {}: {}", old.path.display(), e);
            }
        }
        Ok(())
    }
}
