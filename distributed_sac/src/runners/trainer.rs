//! Trainer loop: learn, log, publish, checkpoint.
//!
//! ```text
//!   wait for memory ──> train_step ──┬──> every log_interval:     MetricsLogger
//!                          ▲         ├──> every publish_interval: WeightSlot
//!                          │         └──> every save_interval:    Checkpointer
//!                          └─────────────── until max_train_steps / shutdown
//! ```

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

use burn::module::AutodiffModule;
use burn::optim::Optimizer;
use burn::tensor::backend::AutodiffBackend;

use crate::algorithms::sac::{Learner, LearnerError, SACActor, SACCritic, TrainMetrics};
use crate::checkpoint::{CheckpointError, Checkpointable, Checkpointer, CheckpointerConfig};
use crate::core::weight_slot::{SharedWeightSlot, WeightError, WeightSlot};
use crate::metrics::MetricsLogger;

/// Trainer loop configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Stop after this many learning steps (`None` = until shutdown).
    pub max_train_steps: Option<u64>,
    /// Learning steps between actor publishes.
    pub publish_interval: u64,
    /// Learning steps between metrics records (0 = never).
    pub log_interval: u64,
    /// Periodic checkpoints (`None` = disabled).
    pub checkpoint: Option<CheckpointerConfig>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_train_steps: None,
            publish_interval: 100,
            log_interval: 1_000,
            checkpoint: None,
        }
    }
}

impl TrainerConfig {
    pub fn with_max_train_steps(mut self, steps: u64) -> Self {
        self.max_train_steps = Some(steps);
        self
    }

    pub fn with_publish_interval(mut self, interval: u64) -> Self {
        self.publish_interval = interval;
        self
    }

    pub fn with_log_interval(mut self, interval: u64) -> Self {
        self.log_interval = interval;
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: CheckpointerConfig) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }
}

/// Trainer failure.
#[derive(Debug)]
pub enum TrainerError {
    Learner(LearnerError),
    Weights(WeightError),
    Checkpoint(CheckpointError),
}

impl std::fmt::Display for TrainerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrainerError::Learner(e) => write!(f, "Learner error: {}", e),
            TrainerError::Weights(e) => write!(f, "{}", e),
            TrainerError::Checkpoint(e) => write!(f, "Checkpoint error: {}", e),
        }
    }
}

impl std::error::Error for TrainerError {}

impl From<LearnerError> for TrainerError {
    fn from(e: LearnerError) -> Self {
        TrainerError::Learner(e)
    }
}

impl From<WeightError> for TrainerError {
    fn from(e: WeightError) -> Self {
        TrainerError::Weights(e)
    }
}

impl From<CheckpointError> for TrainerError {
    fn from(e: CheckpointError) -> Self {
        TrainerError::Checkpoint(e)
    }
}

/// What the trainer loop drives.
pub trait TrainingAgent: Checkpointable {
    /// Completed learning steps.
    fn step(&self) -> u64;

    /// Block until training can start. `false` if `shutdown` was raised first.
    fn wait_until_ready(&self, shutdown: &AtomicBool) -> bool;

    /// One learning step.
    fn train_step(&mut self, shutdown: &AtomicBool) -> Result<TrainMetrics, LearnerError>;

    /// Publish the current actor, returning the new version.
    fn publish(&self, slot: &WeightSlot) -> Result<u64, WeightError>;
}

impl<B, A, C, AO, CO> TrainingAgent for Learner<B, A, C, AO, CO>
where
    B: AutodiffBackend,
    A: SACActor<B> + AutodiffModule<B>,
    A::InnerModule: SACActor<B::InnerBackend>,
    C: SACCritic<B> + AutodiffModule<B>,
    C::InnerModule: SACCritic<B::InnerBackend>,
    AO: Optimizer<A, B> + Clone,
    CO: Optimizer<Vec<C>, B> + Clone,
{
    fn step(&self) -> u64 {
        Learner::step(self)
    }

    fn wait_until_ready(&self, shutdown: &AtomicBool) -> bool {
        Learner::wait_until_ready(self, shutdown)
    }

    fn train_step(&mut self, shutdown: &AtomicBool) -> Result<TrainMetrics, LearnerError> {
        Learner::train_step(self, shutdown)
    }

    fn publish(&self, slot: &WeightSlot) -> Result<u64, WeightError> {
        Learner::publish(self, slot)
    }
}

/// Summary of one `run`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainerReport {
    /// Learning steps taken during this run.
    pub steps: u64,
    /// Latest published actor version.
    pub weights_version: u64,
    pub checkpoints: usize,
    pub last_metrics: Option<TrainMetrics>,
}

pub struct Trainer<L: TrainingAgent> {
    config: TrainerConfig,
    agent: L,
    weights: SharedWeightSlot,
    logger: Box<dyn MetricsLogger>,
    checkpointer: Option<Checkpointer>,
}

impl<L: TrainingAgent> Trainer<L> {
    /// Create a trainer publishing into `weights`.
    ///
    /// The checkpoint directory is created here when checkpointing is enabled.
    pub fn new(
        config: TrainerConfig,
        agent: L,
        weights: SharedWeightSlot,
        logger: Box<dyn MetricsLogger>,
    ) -> Result<Self, TrainerError> {
        let checkpointer = config.checkpoint.clone().map(Checkpointer::new).transpose()?;
        Ok(Self {
            config,
            agent,
            weights,
            logger,
            checkpointer,
        })
    }

    pub fn agent(&self) -> &L {
        &self.agent
    }

    pub fn into_agent(self) -> L {
        self.agent
    }

    pub fn weights(&self) -> &SharedWeightSlot {
        &self.weights
    }

    /// Restore the latest checkpoint, if there is one.
    pub fn resume(&mut self) -> Result<Option<u64>, TrainerError> {
        let Some(checkpointer) = &self.checkpointer else {
            return Ok(None);
        };
        match checkpointer.restore_latest(&mut self.agent) {
            Ok(step) => Ok(Some(step)),
            Err(CheckpointError::NoCheckpoints) => {
                log::info!("No checkpoint to resume from, starting fresh");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Train until `max_train_steps` or `shutdown`.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<TrainerReport, TrainerError> {
        let mut report = TrainerReport {
            weights_version: self.agent.publish(&self.weights)?,
            ..Default::default()
        };
        log::info!("Published initial actor (version {})", report.weights_version);

        if !self.agent.wait_until_ready(shutdown) {
            log::info!("Shutdown before training started");
            return Ok(report);
        }
        log::info!("Replay memory ready, training from step {}", self.agent.step());

        let start_step = self.agent.step();
        let mut last_saved = start_step;
        let mut last_published = start_step;

        while !shutdown.load(Ordering::Relaxed) {
            if self.config.max_train_steps.is_some_and(|max| self.agent.step() >= max) {
                break;
            }

            let metrics = match self.agent.train_step(shutdown) {
                Ok(metrics) => metrics,
                Err(LearnerError::Cancelled) => break,
                Err(e) => {
                    log::error!("Training step {} failed: {}", self.agent.step() + 1, e);
                    self.logger.flush();
                    return Err(e.into());
                }
            };
            let step = self.agent.step();

            if self.config.log_interval > 0 && step % self.config.log_interval == 0 {
                self.logger.log(&metrics);
            }
            if self.config.publish_interval > 0 && step % self.config.publish_interval == 0 {
                report.weights_version = self.agent.publish(&self.weights)?;
                last_published = step;
            }
            if let Some(checkpointer) = &mut self.checkpointer {
                if checkpointer.should_save(step) {
                    checkpointer.save(&self.agent, step)?;
                    report.checkpoints += 1;
                    last_saved = step;
                }
            }
            report.last_metrics = Some(metrics);
        }

        let step = self.agent.step();
        report.steps = step - start_step;
        if step > last_published {
            report.weights_version = self.agent.publish(&self.weights)?;
        }
        if let Some(checkpointer) = &mut self.checkpointer {
            if step > last_saved {
                checkpointer.save(&self.agent, step)?;
                report.checkpoints += 1;
            }
        }
        self.logger.flush();

        log::info!(
            "Trainer stopped at step {} ({} steps this run, actor version {})",
            step,
            report.steps,
            report.weights_version
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::weight_slot::weight_slot;
    use parking_lot::Mutex;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    /// Counts steps; optionally fails at a given step.
    struct Scripted {
        step: u64,
        ready: bool,
        fail_at: Option<u64>,
    }

    impl Scripted {
        fn new() -> Self {
            Self {
                step: 0,
                ready: true,
                fail_at: None,
            }
        }
    }

    impl Checkpointable for Scripted {
        fn save_state(&self, dir: &Path) -> Result<(), CheckpointError> {
            std::fs::write(dir.join("state.json"), serde_json::to_string(&self.step)?)?;
            Ok(())
        }

        fn load_state(&mut self, dir: &Path) -> Result<u64, CheckpointError> {
            self.step = serde_json::from_str(&std::fs::read_to_string(dir.join("state.json"))?)?;
            Ok(self.step)
        }
    }

    impl TrainingAgent for Scripted {
        fn step(&self) -> u64 {
            self.step
        }

        fn wait_until_ready(&self, _shutdown: &AtomicBool) -> bool {
            self.ready
        }

        fn train_step(&mut self, _shutdown: &AtomicBool) -> Result<TrainMetrics, LearnerError> {
            if self.fail_at == Some(self.step + 1) {
                return Err(LearnerError::ShapeMismatch {
                    expected: [4, 2],
                    found: [4, 3],
                });
            }
            self.step += 1;
            Ok(TrainMetrics {
                step: self.step,
                ..Default::default()
            })
        }

        fn publish(&self, slot: &WeightSlot) -> Result<u64, WeightError> {
            Ok(slot.publish(self.step.to_le_bytes().to_vec()))
        }
    }

    struct Steps(Arc<Mutex<Vec<u64>>>);

    impl MetricsLogger for Steps {
        fn log(&mut self, metrics: &TrainMetrics) {
            self.0.lock().push(metrics.step);
        }

        fn flush(&mut self) {}
    }

    #[test]
    fn test_runs_to_max_steps() {
        let logged = Arc::new(Mutex::new(Vec::new()));
        let config = TrainerConfig::default()
            .with_max_train_steps(10)
            .with_publish_interval(4)
            .with_log_interval(3);
        let weights = weight_slot();
        let mut trainer = Trainer::new(
            config,
            Scripted::new(),
            Arc::clone(&weights),
            Box::new(Steps(Arc::clone(&logged))),
        )
        .unwrap();

        let report = trainer.run(&AtomicBool::new(false)).unwrap();

        assert_eq!(report.steps, 10);
        assert_eq!(*logged.lock(), vec![3, 6, 9]);
        // initial, step 4, step 8, final at 10
        assert_eq!(report.weights_version, 4);
        assert_eq!(weights.latest().unwrap().actor, 10u64.to_le_bytes().to_vec());
        assert_eq!(report.last_metrics.unwrap().step, 10);
    }

    #[test]
    fn test_checkpoints_and_resume() {
        let dir = tempdir().unwrap();
        let checkpoint = CheckpointerConfig::new(dir.path()).with_save_interval(5);
        let config = TrainerConfig::default()
            .with_max_train_steps(12)
            .with_checkpoint(checkpoint);

        let mut trainer = Trainer::new(config.clone(), Scripted::new(), weight_slot(), Box::new(Steps(Default::default()))).unwrap();
        let report = trainer.run(&AtomicBool::new(false)).unwrap();
        // steps 5 and 10, plus the final one at 12
        assert_eq!(report.checkpoints, 3);

        let mut resumed = Trainer::new(
            config.with_max_train_steps(15),
            Scripted::new(),
            weight_slot(),
            Box::new(Steps(Default::default())),
        )
        .unwrap();
        assert_eq!(resumed.resume().unwrap(), Some(12));
        let report = resumed.run(&AtomicBool::new(false)).unwrap();
        assert_eq!(report.steps, 3);
        assert_eq!(resumed.agent().step(), 15);
    }

    #[test]
    fn test_resume_without_checkpoints() {
        let dir = tempdir().unwrap();
        let config = TrainerConfig::default().with_checkpoint(CheckpointerConfig::new(dir.path()));
        let mut trainer = Trainer::new(config, Scripted::new(), weight_slot(), Box::new(Steps(Default::default()))).unwrap();
        assert_eq!(trainer.resume().unwrap(), None);

        let mut plain = Trainer::new(TrainerConfig::default(), Scripted::new(), weight_slot(), Box::new(Steps(Default::default()))).unwrap();
        assert_eq!(plain.resume().unwrap(), None);
    }

    #[test]
    fn test_step_failure_is_returned() {
        let agent = Scripted {
            fail_at: Some(3),
            ..Scripted::new()
        };
        let config = TrainerConfig::default().with_max_train_steps(10);
        let mut trainer = Trainer::new(config, agent, weight_slot(), Box::new(Steps(Default::default()))).unwrap();

        let err = trainer.run(&AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, TrainerError::Learner(LearnerError::ShapeMismatch { .. })));
        assert_eq!(trainer.agent().step(), 2);
    }

    #[test]
    fn test_shutdown_before_ready() {
        let agent = Scripted {
            ready: false,
            ..Scripted::new()
        };
        let weights = weight_slot();
        let mut trainer = Trainer::new(TrainerConfig::default(), agent, Arc::clone(&weights), Box::new(Steps(Default::default()))).unwrap();

        let report = trainer.run(&AtomicBool::new(true)).unwrap();
        assert_eq!(report.steps, 0);
        // workers still get an actor to start from
        assert_eq!(weights.version(), 1);
    }
}
