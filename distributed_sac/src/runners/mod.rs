//! Long-running loops built on the learner and the exchange.
//!
//! - [`Trainer`]: learning steps, metrics logging, actor publishing and
//!   periodic checkpoints

pub mod trainer;

pub use trainer::{Trainer, TrainerConfig, TrainerError, TrainerReport, TrainingAgent};
