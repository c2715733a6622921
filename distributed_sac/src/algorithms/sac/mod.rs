//! Soft Actor-Critic with entropy as a separately estimated reward component.
//!
//! Critics predict two values per `(observation, action)`: the value of the
//! environment reward and the value of the entropy bonus. Both targets are
//! normalized with adaptive (PopArt) statistics before regression, and the
//! actor maximizes the normalized sum of the pessimistic (component-wise min)
//! critic estimate.
//!
//! ```text
//! Actor
//! └── obs ─> trunk ─> (mean, log_std) ─> tanh-squashed Gaussian
//!
//! Critics (≥ 2, independently initialized)
//! ├── Q_i: (obs, action) ─> trunk ─> [reward value, entropy value]
//! └── Q_i target: EMA copy of Q_i
//!
//! ReturnNormalizer (online) + EMA copy (target)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let config = SACConfig::avenue();
//! let factory = config.model.resolve();
//! let model = factory.build(&schema, action_dim, config.num_critics, &device)?;
//! let (actor_optim, critic_optim) = create_optimizers(&config);
//! let mut learner = Learner::new(config, schema, action_dim, model,
//!     actor_optim, critic_optim, memory, device)?;
//! let metrics = learner.train_step(&shutdown)?;
//! ```

mod config;
mod distribution;
mod learner;
mod model;
mod normalizer;

pub use config::SACConfig;
pub use distribution::{clamp_log_std, SquashedGaussian, LOG_STD_MAX, LOG_STD_MIN};
pub use learner::{
    bootstrap_targets, component_min, create_optimizers, subtract_entropy, Learner, LearnerError,
    TrainMetrics, TrainingBatch,
};
pub use model::{
    MlpActor, MlpCritic, MlpFactory, ModelError, ModelFactory, ModelKind, SACActor, SACCritic,
    SACModel, VALUE_COMPONENTS,
};
pub use normalizer::{NormalizerConfig, NormalizerError, OutputRescale, ReturnNormalizer};
