//! Configuration plumbing shared by every component.
//!
//! Each component takes an explicit config struct at construction. All of
//! them derive serde with `#[serde(default)]`, so a JSON file only needs the
//! fields it overrides. Nothing here is process-global.

use burn::backend::ndarray::NdArrayDevice;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Configuration validation error.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A count parameter must be positive.
    InvalidCount { field: &'static str, value: usize },
    /// A parameter is outside its valid range.
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    /// Replay memory cannot hold a single batch.
    MemoryTooSmall { capacity: usize, batch_size: usize },
    /// Config file could not be read.
    Read { path: PathBuf, message: String },
    /// Config file is not valid JSON for the expected struct.
    Parse { path: PathBuf, message: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidCount { field, value } => {
                write!(f, "{} must be > 0, got {}", field, value)
            }
            ConfigError::OutOfRange {
                field,
                value,
                min,
                max,
            } => write!(f, "{} must be in [{}, {}], got {}", field, min, max, value),
            ConfigError::MemoryTooSmall {
                capacity,
                batch_size,
            } => write!(
                f,
                "memory_size ({}) must be >= batch_size ({})",
                capacity, batch_size
            ),
            ConfigError::Read { path, message } => {
                write!(f, "cannot read {}: {}", path.display(), message)
            }
            ConfigError::Parse { path, message } => {
                write!(f, "invalid config {}: {}", path.display(), message)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Check a positive count.
pub(crate) fn positive(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidCount { field, value });
    }
    Ok(())
}

/// Check `min <= value <= max` (rejects NaN).
pub(crate) fn in_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if !(value >= min && value <= max) {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

/// Read a JSON config file into `T`.
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Requested compute device.
///
/// Resolution happens once at construction. An unavailable request falls back
/// to the CPU device with a warning and is not retried.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceSpec {
    #[default]
    Cpu,
    /// Accelerator by index (e.g. a GPU). Not provided by the CPU backend.
    Accelerator(usize),
}

impl DeviceSpec {
    /// Resolve to an ndarray device.
    pub fn resolve_ndarray(&self) -> NdArrayDevice {
        match self {
            DeviceSpec::Cpu => NdArrayDevice::Cpu,
            DeviceSpec::Accelerator(index) => {
                log::warn!(
                    "accelerator {} requested but the ndarray backend is CPU-only; falling back to cpu",
                    index
                );
                NdArrayDevice::Cpu
            }
        }
    }
}
