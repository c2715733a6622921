//! SAC hyperparameters.

use serde::{Deserialize, Serialize};

use super::model::ModelKind;
use super::normalizer::NormalizerConfig;
use crate::config::{in_range, positive, ConfigError};

/// Configuration for the SAC learner.
///
/// Defaults follow the standard continuous-control setting. Use
/// [`SACConfig::avenue()`] for the image-based preset with a weaker entropy
/// reward and smaller batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SACConfig {
    // ========================================================================
    // Replay Memory
    // ========================================================================
    /// Transitions per training batch.
    pub batch_size: usize,

    /// Replay memory capacity.
    pub memory_size: usize,

    /// Extra warm-up: training waits for `max(batch_size, start_training)`
    /// transitions.
    pub start_training: usize,

    // ========================================================================
    // Algorithm
    // ========================================================================
    /// Learning rate shared by actor and critic optimizers.
    pub lr: f64,

    /// Reward discount γ.
    pub discount: f32,

    /// EMA factor τ for target critics and the target normalizer.
    pub target_update: f32,

    /// Multiplier on environment rewards.
    pub reward_scale: f32,

    /// Multiplier on the entropy reward component and the actor's entropy term.
    pub entropy_scale: f32,

    /// Number of critics (at least two for pessimistic bootstrapping).
    pub num_critics: usize,

    /// Return normalization.
    pub normalizer: NormalizerConfig,

    // ========================================================================
    // Optimization
    // ========================================================================
    /// Adam epsilon.
    pub adam_epsilon: f32,

    /// Gradient norm clipping. None = no clipping.
    pub max_grad_norm: Option<f32>,

    /// Seed for replay sampling. None = entropy-seeded.
    pub seed: Option<u64>,

    // ========================================================================
    // Model
    // ========================================================================
    /// Registered network family used to build actor and critics.
    pub model: ModelKind,
}

impl Default for SACConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            memory_size: 1_000_000,
            start_training: 0,
            lr: 3e-4,
            discount: 0.99,
            target_update: 0.005,
            reward_scale: 5.0,
            entropy_scale: 1.0,
            num_critics: 2,
            normalizer: NormalizerConfig::default(),
            adam_epsilon: 1e-8,
            max_grad_norm: None,
            seed: None,
            model: ModelKind::default(),
        }
    }
}

impl SACConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for image-stack observations (smaller batches, weak entropy reward).
    pub fn avenue() -> Self {
        Self {
            entropy_scale: 0.05,
            lr: 2e-4,
            memory_size: 500_000,
            batch_size: 100,
            ..Self::default()
        }
    }

    /// Transitions required before the first training step.
    pub fn min_memory(&self) -> usize {
        self.batch_size.max(self.start_training)
    }

    /// Check all values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("batch_size", self.batch_size)?;
        positive("memory_size", self.memory_size)?;
        if self.num_critics < 2 {
            return Err(ConfigError::OutOfRange {
                field: "num_critics",
                value: self.num_critics as f64,
                min: 2.0,
                max: f64::INFINITY,
            });
        }
        if self.memory_size < self.batch_size {
            return Err(ConfigError::MemoryTooSmall {
                capacity: self.memory_size,
                batch_size: self.batch_size,
            });
        }
        in_range("lr", self.lr, f64::MIN_POSITIVE, 1.0)?;
        in_range("discount", self.discount as f64, 0.0, 1.0)?;
        in_range("target_update", self.target_update as f64, 0.0, 1.0)?;
        in_range("reward_scale", self.reward_scale as f64, 0.0, f64::MAX)?;
        in_range("entropy_scale", self.entropy_scale as f64, 0.0, f64::MAX)?;
        in_range("adam_epsilon", self.adam_epsilon as f64, f64::MIN_POSITIVE, 1.0)?;
        in_range("normalizer.beta", self.normalizer.beta as f64, f64::MIN_POSITIVE, 1.0)?;
        in_range(
            "normalizer.std_floor",
            self.normalizer.std_floor as f64,
            f64::MIN_POSITIVE,
            self.normalizer.std_ceiling as f64,
        )?;
        if let Some(norm) = self.max_grad_norm {
            in_range("max_grad_norm", norm as f64, f64::MIN_POSITIVE, f64::MAX)?;
        }
        self.model.validate()
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_memory_size(mut self, memory_size: usize) -> Self {
        self.memory_size = memory_size;
        self
    }

    pub fn with_start_training(mut self, start_training: usize) -> Self {
        self.start_training = start_training;
        self
    }

    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    pub fn with_discount(mut self, discount: f32) -> Self {
        self.discount = discount;
        self
    }

    pub fn with_target_update(mut self, tau: f32) -> Self {
        self.target_update = tau;
        self
    }

    pub fn with_reward_scale(mut self, scale: f32) -> Self {
        self.reward_scale = scale;
        self
    }

    pub fn with_entropy_scale(mut self, scale: f32) -> Self {
        self.entropy_scale = scale;
        self
    }

    pub fn with_num_critics(mut self, n: usize) -> Self {
        self.num_critics = n;
        self
    }

    pub fn with_normalizer(mut self, normalizer: NormalizerConfig) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_max_grad_norm(mut self, norm: f32) -> Self {
        self.max_grad_norm = Some(norm);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_model(mut self, model: ModelKind) -> Self {
        self.model = model;
        self
    }
}
