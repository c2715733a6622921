//! Rollout worker: acts with the latest actor snapshot it has managed to load.
//!
//! ```text
//!              WeightSlot (latest published snapshot)
//!                  │ newer_than(known) every `weights_refresh_interval` steps
//!                  ▼
//! env.reset ─> act(obs) ─> env.step ─> Transition ─> try_send ─> link / memory
//!     ▲                        │
//!     └── terminal, truncated, │
//!         or max_episode_steps ┘
//! ```
//!
//! The acting loop never blocks on the exchange: the transition sink is a
//! bounded channel written with `try_send`, and a full channel drops the
//! transition (counted in [`WorkerStats::dropped`]). Weight refresh reads an
//! already decoded-and-published snapshot; if decoding fails the worker keeps
//! acting with the weights it had.

use burn::tensor::backend::Backend;
use crossbeam_channel::{Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::algorithms::sac::SACActor;
use crate::config::{positive, ConfigError};
use crate::core::observation::{Observation, ObservationBatch, SchemaError};
use crate::core::transition::Transition;
use crate::core::weight_slot::{load_snapshot, SharedWeightSlot};
use crate::environment::{EnvError, Environment, StepOutcome};

/// How the worker turns the policy distribution into an action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionMode {
    /// Sample from the squashed Gaussian (exploration).
    #[default]
    Sample,
    /// `tanh(mean)`.
    Deterministic,
}

/// Worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker ID (for logging and thread names)
    pub worker_id: usize,
    pub action_mode: ActionMode,
    /// Record transitions. Test and benchmark runs never record.
    pub train: bool,
    /// Reset after this many steps without marking the step terminal.
    pub max_episode_steps: Option<usize>,
    /// Steps between checks for a newer weight snapshot
    pub weights_refresh_interval: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: 0,
            action_mode: ActionMode::Sample,
            train: true,
            max_episode_steps: None,
            weights_refresh_interval: 10,
        }
    }
}

impl WorkerConfig {
    /// Create config for a specific worker ID.
    pub fn for_worker(worker_id: usize) -> Self {
        Self {
            worker_id,
            ..Default::default()
        }
    }

    pub fn with_action_mode(mut self, mode: ActionMode) -> Self {
        self.action_mode = mode;
        self
    }

    pub fn with_train(mut self, train: bool) -> Self {
        self.train = train;
        self
    }

    pub fn with_max_episode_steps(mut self, steps: usize) -> Self {
        self.max_episode_steps = Some(steps);
        self
    }

    pub fn with_weights_refresh_interval(mut self, steps: usize) -> Self {
        self.weights_refresh_interval = steps;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("weights_refresh_interval", self.weights_refresh_interval)?;
        if let Some(steps) = self.max_episode_steps {
            positive("max_episode_steps", steps)?;
        }
        Ok(())
    }
}

/// Fatal worker failure.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerError {
    Config(ConfigError),
    /// The environment adapter failed.
    Environment(EnvError),
    /// The environment emitted an observation that does not fit its schema.
    Observation(SchemaError),
    /// The policy or the environment disagree on the action size.
    ActionDim { expected: usize, found: usize },
    /// Action tensor could not be read back.
    Inference(String),
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::Config(e) => write!(f, "invalid worker config: {}", e),
            WorkerError::Environment(e) => write!(f, "{}", e),
            WorkerError::Observation(e) => write!(f, "environment broke its observation schema: {}", e),
            WorkerError::ActionDim { expected, found } => {
                write!(f, "expected action of size {}, policy produced {}", expected, found)
            }
            WorkerError::Inference(e) => write!(f, "inference failed: {}", e),
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<EnvError> for WorkerError {
    fn from(e: EnvError) -> Self {
        WorkerError::Environment(e)
    }
}

impl From<SchemaError> for WorkerError {
    fn from(e: SchemaError) -> Self {
        WorkerError::Observation(e)
    }
}

impl From<ConfigError> for WorkerError {
    fn from(e: ConfigError) -> Self {
        WorkerError::Config(e)
    }
}

/// Counters accumulated over the worker's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub steps: u64,
    pub episodes: u64,
    /// Transitions handed to the sink.
    pub sent: u64,
    /// Transitions dropped because the sink was full.
    pub dropped: u64,
    /// Snapshots successfully loaded.
    pub weight_updates: u64,
    /// Snapshots that failed to decode (old weights kept).
    pub failed_weight_loads: u64,
    pub last_episode_return: Option<f32>,
}

/// Environment and inference timings.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkReport {
    pub steps: u64,
    pub mean_step: Duration,
    pub max_step: Duration,
    pub mean_inference: Duration,
}

impl std::fmt::Display for BenchmarkReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} steps | env step mean {:?} max {:?} | inference mean {:?}",
            self.steps, self.mean_step, self.max_step, self.mean_inference
        )
    }
}

/// Acts in one environment with a locally held actor.
pub struct RolloutWorker<B: Backend, A, E> {
    config: WorkerConfig,
    env: E,
    actor: A,
    device: B::Device,
    weights: SharedWeightSlot,
    weights_version: u64,
    sink: Option<Sender<Transition>>,
    stats: WorkerStats,
}

impl<B, A, E> RolloutWorker<B, A, E>
where
    B: Backend,
    A: SACActor<B>,
    E: Environment,
{
    /// Create a worker acting with `actor` until a snapshot shows up in `weights`.
    pub fn new(
        config: WorkerConfig,
        env: E,
        actor: A,
        weights: SharedWeightSlot,
        device: B::Device,
    ) -> Result<Self, WorkerError> {
        config.validate()?;
        env.schema().validate_self()?;
        positive("action_dim", env.action_dim())?;
        Ok(Self {
            config,
            env,
            actor,
            device,
            weights,
            weights_version: 0,
            sink: None,
            stats: WorkerStats::default(),
        })
    }

    /// Where recorded transitions go.
    pub fn with_sink(mut self, sink: Sender<Transition>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn actor(&self) -> &A {
        &self.actor
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    /// Version of the snapshot the actor was last loaded from (0 = initial weights).
    pub fn weights_version(&self) -> u64 {
        self.weights_version
    }

    /// Load a newer snapshot if one is published. Returns whether weights changed.
    pub fn refresh_weights(&mut self) -> bool {
        let Some(snapshot) = self.weights.newer_than(self.weights_version) else {
            return false;
        };
        // the version is consumed either way so a bad snapshot is not retried every step
        self.weights_version = snapshot.version;
        match load_snapshot(self.actor.clone(), &snapshot.actor, &self.device) {
            Ok(actor) => {
                self.actor = actor;
                self.stats.weight_updates += 1;
                if self.stats.weight_updates == 1 {
                    log::info!(
                        "Worker {} loaded first weights (version {})",
                        self.config.worker_id,
                        snapshot.version
                    );
                }
                true
            }
            Err(e) => {
                self.stats.failed_weight_loads += 1;
                log::warn!(
                    "Worker {} keeps previous weights, snapshot {} unusable: {}",
                    self.config.worker_id,
                    snapshot.version,
                    e
                );
                false
            }
        }
    }

    /// Choose an action for one observation.
    pub fn act(&self, obs: &Observation) -> Result<Vec<f32>, WorkerError> {
        let batch = ObservationBatch::<B>::from_observations(self.env.schema(), &[obs], &self.device)?;
        let policy = self.actor.forward(&batch);
        let action = match self.config.action_mode {
            ActionMode::Sample => policy.sample().0,
            ActionMode::Deterministic => policy.mode(),
        };
        let values = action
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| WorkerError::Inference(format!("{:?}", e)))?;
        let expected = self.env.action_dim();
        if values.len() != expected {
            return Err(WorkerError::ActionDim {
                expected,
                found: values.len(),
            });
        }
        Ok(values)
    }

    /// Collect until `shutdown` is raised.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<WorkerStats, WorkerError> {
        log::info!(
            "Worker {} started ({:?}, train={})",
            self.config.worker_id,
            self.config.action_mode,
            self.config.train
        );
        self.collect(None, shutdown)
    }

    /// Collect at most `steps` environment steps.
    pub fn run_for(&mut self, steps: u64, shutdown: &AtomicBool) -> Result<WorkerStats, WorkerError> {
        self.collect(Some(steps), shutdown)
    }

    /// Play `episodes` full episodes without recording, returning each return.
    pub fn run_test_episodes(
        &mut self,
        episodes: usize,
        shutdown: &AtomicBool,
    ) -> Result<Vec<f32>, WorkerError> {
        self.refresh_weights();
        let mut returns = Vec::with_capacity(episodes);
        while returns.len() < episodes && !shutdown.load(Ordering::Relaxed) {
            let mut obs = self.reset()?;
            let mut total = 0.0f32;
            let mut length = 0usize;
            loop {
                let action = self.act(&obs)?;
                let outcome = self.env_step(&action)?;
                total += outcome.reward;
                length += 1;
                if outcome.is_done() || self.time_limit(length) || shutdown.load(Ordering::Relaxed) {
                    break;
                }
                obs = outcome.obs;
            }
            self.stats.episodes += 1;
            self.stats.last_episode_return = Some(total);
            log::info!(
                "Worker {} test episode {}: return {:.3} over {} steps",
                self.config.worker_id,
                returns.len() + 1,
                total,
                length
            );
            returns.push(total);
        }
        Ok(returns)
    }

    /// Time environment steps and policy inference.
    pub fn run_env_benchmark(
        &mut self,
        steps: u64,
        shutdown: &AtomicBool,
    ) -> Result<BenchmarkReport, WorkerError> {
        let mut obs = self.reset()?;
        let mut env_total = Duration::ZERO;
        let mut env_max = Duration::ZERO;
        let mut inference_total = Duration::ZERO;
        let mut done_steps = 0u64;
        let mut length = 0usize;

        while done_steps < steps && !shutdown.load(Ordering::Relaxed) {
            let started = Instant::now();
            let action = self.act(&obs)?;
            inference_total += started.elapsed();

            let started = Instant::now();
            let outcome = self.env_step(&action)?;
            let elapsed = started.elapsed();
            env_total += elapsed;
            env_max = env_max.max(elapsed);

            done_steps += 1;
            length += 1;
            obs = if outcome.is_done() || self.time_limit(length) {
                length = 0;
                self.reset()?
            } else {
                outcome.obs
            };
        }

        let divisor = done_steps.max(1) as u32;
        let report = BenchmarkReport {
            steps: done_steps,
            mean_step: env_total / divisor,
            max_step: env_max,
            mean_inference: inference_total / divisor,
        };
        log::info!("Worker {} benchmark: {}", self.config.worker_id, report);
        Ok(report)
    }

    fn time_limit(&self, episode_steps: usize) -> bool {
        self.config
            .max_episode_steps
            .is_some_and(|limit| episode_steps >= limit)
    }

    fn reset(&mut self) -> Result<Observation, WorkerError> {
        let obs = self.env.reset()?;
        self.env.schema().check(&obs)?;
        Ok(obs)
    }

    fn env_step(&mut self, action: &[f32]) -> Result<StepOutcome, WorkerError> {
        let outcome = self.env.step(action)?;
        self.env.schema().check(&outcome.obs)?;
        self.stats.steps += 1;
        Ok(outcome)
    }

    /// Hand a transition to the sink without blocking. Returns false once the
    /// receiving side is gone.
    fn send(&mut self, transition: Transition) -> bool {
        let Some(sink) = &self.sink else {
            return true;
        };
        match sink.try_send(transition) {
            Ok(()) => {
                self.stats.sent += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                self.stats.dropped += 1;
                log::debug!("Worker {} sink full, transition dropped", self.config.worker_id);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    fn collect(&mut self, max_steps: Option<u64>, shutdown: &AtomicBool) -> Result<WorkerStats, WorkerError> {
        let record = self.config.train && self.sink.is_some();
        if self.config.train && self.sink.is_none() {
            log::warn!("Worker {} in train mode has no sink; nothing is recorded", self.config.worker_id);
        }

        let mut obs = self.reset()?;
        let mut episode_steps = 0usize;
        let mut episode_return = 0.0f32;
        let mut taken = 0u64;
        let interval = self.config.weights_refresh_interval as u64;

        while !shutdown.load(Ordering::Relaxed) && max_steps.map_or(true, |m| taken < m) {
            if taken % interval == 0 {
                self.refresh_weights();
            }

            let action = self.act(&obs)?;
            let StepOutcome {
                obs: next_obs,
                reward,
                terminal,
                truncated,
                info,
            } = self.env_step(&action)?;
            taken += 1;
            episode_steps += 1;
            episode_return += reward;
            let done = terminal || truncated || self.time_limit(episode_steps);

            if record {
                let transition =
                    Transition::new(obs, action, reward, next_obs.clone(), terminal).with_info(info);
                if !self.send(transition) {
                    log::warn!("Worker {} sink closed, stopping", self.config.worker_id);
                    break;
                }
            }

            obs = if done {
                self.stats.episodes += 1;
                self.stats.last_episode_return = Some(episode_return);
                log::debug!(
                    "Worker {} episode {} return {:.3} ({} steps)",
                    self.config.worker_id,
                    self.stats.episodes,
                    episode_return,
                    episode_steps
                );
                episode_steps = 0;
                episode_return = 0.0;
                self.reset()?
            } else {
                next_obs
            };
        }

        Ok(self.stats.clone())
    }
}
