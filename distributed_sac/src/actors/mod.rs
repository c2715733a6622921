//! Rollout workers.
//!
//! - `RolloutWorker`: runs the latest available actor snapshot against an
//!   environment and hands transitions to a non-blocking channel

pub mod worker;

pub use worker::{ActionMode, BenchmarkReport, RolloutWorker, WorkerConfig, WorkerError, WorkerStats};
