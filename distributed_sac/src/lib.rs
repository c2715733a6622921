//! # Distributed SAC
//!
//! Soft Actor-Critic with twin critics, PopArt-normalized two-component values
//! (reward and entropy) and an asynchronous exchange between real-time
//! workers and one trainer.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  worker process(es)                  relay              trainer       │
//! │  ┌───────────────┐   channel   ┌────────────┐  push/pull  ┌─────────┐ │
//! │  │ RolloutWorker │ ──────────> │ WorkerLink │ ──────────> │         │ │
//! │  │ (RealTimeEnv) │             └────────────┘   samples   │ Relay   │ │
//! │  │ actor snapshot│ <── WeightSlot <─────────────────────── │ Server  │ │
//! │  └───────────────┘                               weights  │         │ │
//! │                                                           └────┬────┘ │
//! │                         ┌─────────────┐   samples  ┌───────────┴──┐   │
//! │                         │ ReplayMemory│ <───────── │ TrainerLink  │   │
//! │                         └──────┬──────┘            └───────────┬──┘   │
//! │                                ▼                     weights ▲ │      │
//! │                         ┌─────────────┐   publish  ┌─────────┴─┐      │
//! │                         │ Learner     │ ─────────> │ WeightSlot│      │
//! │                         │ (Trainer)   │            └───────────┘      │
//! │                         └─────────────┘                               │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Acting loops never block on the network: transitions go through a bounded
//! channel and weights are picked up from a versioned slot. Link threads do
//! all connecting, batching and retrying.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use distributed_sac::{create_optimizers, Learner, ModelFactory, ReplayMemory, SACConfig};
//!
//! let config = SACConfig::default().with_batch_size(64);
//! let factory = config.model.resolve();
//! let model = ModelFactory::<B>::build(&factory, &schema, action_dim, config.num_critics, &device)?;
//! let (actor_optim, critic_optim) = create_optimizers::<B, _, _>(&config);
//! let memory = Arc::new(ReplayMemory::new(config.memory_size));
//! let mut learner = Learner::new(config, schema, action_dim, model, actor_optim, critic_optim, memory, device)?;
//! let metrics = learner.train_step(&shutdown)?;
//! ```

pub mod actors;
pub mod algorithms;
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod environment;
pub mod exchange;
pub mod metrics;
pub mod runners;

pub use crate::core::observation::{FieldSpec, ObsField, Observation, ObservationBatch, ObservationSchema, SchemaError};
pub use crate::core::replay_memory::{ReplayMemory, SharedReplayMemory};
pub use crate::core::transition::Transition;
pub use crate::core::weight_slot::{weight_slot, SharedWeightSlot, WeightError, WeightSlot, WeightSnapshot};

pub use actors::{ActionMode, BenchmarkReport, RolloutWorker, WorkerConfig, WorkerError, WorkerStats};

pub use algorithms::sac::{
    create_optimizers, Learner, LearnerError, MlpActor, MlpCritic, MlpFactory, ModelFactory, ModelKind,
    NormalizerConfig, ReturnNormalizer, SACActor, SACConfig, SACCritic, SACModel, TrainMetrics,
};

pub use checkpoint::{CheckpointError, CheckpointInfo, Checkpointable, Checkpointer, CheckpointerConfig};
pub use config::{load_json, ConfigError, DeviceSpec};
pub use environment::{EnvError, Environment, RealTimeEnv, StepOutcome};
pub use exchange::{
    ExchangeConfig, ExchangeError, LocalRelay, RelayServer, RetryConfig, TrainerLink, WorkerLink,
};
pub use metrics::{ConsoleLogger, CsvLogger, MetricsLogger, MultiLogger};
pub use runners::{Trainer, TrainerConfig, TrainerError, TrainerReport, TrainingAgent};
