//! SAC learner with entropy as a separate reward component.
//!
//! # Training step
//!
//! ```text
//!  batch ──┬─> frozen actor(next_obs).sample() ──> a', log π(a'|s')
//!          │                                        │
//!          │   min over target critics(next_obs, a') ─> unnormalize (target stats)
//!          │                                        │
//!          │   [r·reward_scale, -(1-d)·γ·log π · entropy_scale] + (1-d)·γ·next_value
//!          │                                        │
//!          │                    normalizer.update ──┴─> y (detached), output rescale
//!          │
//!          ├─> Σ_critics MSE(critic(obs, a), y) ──> critic optimizer step
//!          │
//!          ├─> actor(obs).rsample() ──> ã, log π(ã|s)
//!          │   min over critics(obs, ã) ─> unnormalize ─> entropy column -= entropy_scale · log π
//!          │   -mean(normalize_sum(row sum)) ──> actor optimizer step
//!          │
//!          └─> EMA(target critics, target normalizer)
//! ```
//!
//! The bootstrap (frozen actor, target critics) runs on the inner backend so
//! no graph is ever built for it. The fresh reparameterized action is drawn
//! before the critic update, which does not depend on it, and its width is
//! checked against `action_dim` first.
//!
//! Normalizer statistics and output-layer rescaling are staged on copies and
//! only committed once every critic output has the expected
//! `[batch, VALUE_COMPONENTS]` shape. The actor pass feeds the same critics
//! an action of the already checked width, so a misconfigured actor or
//! critic head aborts the step without touching any state.

use burn::grad_clipping::GradientClippingConfig;
use burn::module::{AutodiffModule, Module};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::AtomicBool;

use super::config::SACConfig;
use super::model::{SACActor, SACCritic, SACModel, VALUE_COMPONENTS};
use super::normalizer::{NormalizerError, ReturnNormalizer};
use crate::checkpoint::{CheckpointError, Checkpointable};
use crate::config::ConfigError;
use crate::core::observation::{Observation, ObservationBatch, ObservationSchema, SchemaError};
use crate::core::replay_memory::SharedReplayMemory;
use crate::core::target_network::{snapshot, soft_update};
use crate::core::transition::Transition;
use crate::core::weight_slot::{snapshot_bytes, WeightError, WeightSlot};

// ============================================================================
// Errors and metrics
// ============================================================================

/// Training step failure. No learner state changes when one is returned.
#[derive(Debug, Clone, PartialEq)]
pub enum LearnerError {
    /// Invalid configuration at construction.
    Config(ConfigError),
    /// A sampled observation does not match the schema.
    Observation(SchemaError),
    /// A sampled action has the wrong length.
    ActionDim { expected: usize, found: usize },
    /// A critic returned something other than `[batch, VALUE_COMPONENTS]`.
    ShapeMismatch {
        expected: [usize; 2],
        found: [usize; 2],
    },
    /// Return statistics could not be updated.
    Normalizer(NormalizerError),
    /// Training step asked for an empty batch.
    EmptyBatch,
    /// Shutdown was requested while waiting for data.
    Cancelled,
}

impl std::fmt::Display for LearnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LearnerError::Config(e) => write!(f, "invalid learner config: {}", e),
            LearnerError::Observation(e) => write!(f, "bad observation in batch: {}", e),
            LearnerError::ActionDim { expected, found } => {
                write!(f, "expected action of size {}, got {}", expected, found)
            }
            LearnerError::ShapeMismatch { expected, found } => write!(
                f,
                "critic output shape {:?} does not match target shape {:?}",
                found, expected
            ),
            LearnerError::Normalizer(e) => write!(f, "return normalizer: {}", e),
            LearnerError::EmptyBatch => write!(f, "cannot train on an empty batch"),
            LearnerError::Cancelled => write!(f, "training cancelled"),
        }
    }
}

impl std::error::Error for LearnerError {}

impl From<SchemaError> for LearnerError {
    fn from(e: SchemaError) -> Self {
        LearnerError::Observation(e)
    }
}

impl From<NormalizerError> for LearnerError {
    fn from(e: NormalizerError) -> Self {
        LearnerError::Normalizer(e)
    }
}

impl From<ConfigError> for LearnerError {
    fn from(e: ConfigError) -> Self {
        LearnerError::Config(e)
    }
}

/// Observability record of one training step.
///
/// Only for logging; nothing in the training loop branches on it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainMetrics {
    pub step: u64,
    pub loss_actor: f32,
    pub loss_critic: f32,
    pub reward_mean: f32,
    pub entropy_mean: f32,
    pub reward_std: f32,
    pub entropy_std: f32,
    pub memory_size: usize,
}

// ============================================================================
// Batch tensors
// ============================================================================

/// A sampled batch as tensors.
#[derive(Debug, Clone)]
pub struct TrainingBatch<B: Backend> {
    pub obs: ObservationBatch<B>,
    pub next_obs: ObservationBatch<B>,
    /// `[batch, action_dim]`
    pub actions: Tensor<B, 2>,
    /// `[batch, 1]`, unscaled
    pub rewards: Tensor<B, 2>,
    /// `[batch, 1]`, 1.0 for terminal
    pub terminals: Tensor<B, 2>,
}

impl<B: Backend> TrainingBatch<B> {
    /// Stack transitions into tensors, checking observation and action sizes.
    pub fn from_transitions(
        schema: &ObservationSchema,
        action_dim: usize,
        transitions: &[Transition],
        device: &B::Device,
    ) -> Result<Self, LearnerError> {
        let n = transitions.len();
        let mut actions = Vec::with_capacity(n * action_dim);
        let mut rewards = Vec::with_capacity(n);
        let mut terminals = Vec::with_capacity(n);
        for t in transitions {
            if t.action.len() != action_dim {
                return Err(LearnerError::ActionDim {
                    expected: action_dim,
                    found: t.action.len(),
                });
            }
            actions.extend_from_slice(&t.action);
            rewards.push(t.reward);
            terminals.push(if t.terminal { 1.0f32 } else { 0.0 });
        }

        let obs: Vec<&Observation> = transitions.iter().map(|t| &t.obs).collect();
        let next_obs: Vec<&Observation> = transitions.iter().map(|t| &t.next_obs).collect();

        Ok(Self {
            obs: ObservationBatch::from_observations(schema, &obs, device)?,
            next_obs: ObservationBatch::from_observations(schema, &next_obs, device)?,
            actions: Tensor::<B, 1>::from_floats(actions.as_slice(), device).reshape([n, action_dim]),
            rewards: Tensor::<B, 1>::from_floats(rewards.as_slice(), device).reshape([n, 1]),
            terminals: Tensor::<B, 1>::from_floats(terminals.as_slice(), device).reshape([n, 1]),
        })
    }
}

impl<B: AutodiffBackend> TrainingBatch<B> {
    /// The same batch on the inner backend.
    pub fn inner(&self) -> TrainingBatch<B::InnerBackend> {
        TrainingBatch {
            obs: self.obs.inner(),
            next_obs: self.next_obs.inner(),
            actions: self.actions.clone().inner(),
            rewards: self.rewards.clone().inner(),
            terminals: self.terminals.clone().inner(),
        }
    }
}

// ============================================================================
// Pure pieces of the update
// ============================================================================

/// Component-wise minimum across critic outputs, checking every shape.
///
/// Each component is minimized independently, so one critic's low reward
/// estimate cannot hide another's high entropy estimate.
pub fn component_min<B: Backend>(
    values: Vec<Tensor<B, 2>>,
    expected: [usize; 2],
) -> Result<Tensor<B, 2>, LearnerError> {
    let mut min: Option<Tensor<B, 2>> = None;
    for value in values {
        check_shape(&value, expected)?;
        min = Some(match min {
            Some(m) => m.min_pair(value),
            None => value,
        });
    }
    min.ok_or(LearnerError::EmptyBatch)
}

fn check_shape<B: Backend>(value: &Tensor<B, 2>, expected: [usize; 2]) -> Result<(), LearnerError> {
    let found = value.dims();
    if found != expected {
        return Err(LearnerError::ShapeMismatch { expected, found });
    }
    Ok(())
}

/// Raw two-component bootstrap target.
///
/// ```text
/// components = [reward_scale · r, entropy_scale · -(1 - d) · γ · log π(a'|s')]
/// target     = components + (1 - d) · γ · next_value
/// ```
///
/// `rewards`, `terminals`, `next_log_prob` are `[batch, 1]`; `next_value` is
/// `[batch, 2]` in raw units.
pub fn bootstrap_targets<B: Backend>(
    rewards: Tensor<B, 2>,
    terminals: Tensor<B, 2>,
    next_log_prob: Tensor<B, 2>,
    next_value: Tensor<B, 2>,
    discount: f32,
    reward_scale: f32,
    entropy_scale: f32,
) -> Tensor<B, 2> {
    let not_done = terminals.neg().add_scalar(1.0);
    let entropy_reward = next_log_prob
        .neg()
        .mul(not_done.clone())
        .mul_scalar(discount * entropy_scale);
    let components = Tensor::cat(vec![rewards.mul_scalar(reward_scale), entropy_reward], 1);
    components + next_value * not_done.mul_scalar(discount)
}

/// Subtract `entropy_scale · log π` from the entropy (last) column only.
pub fn subtract_entropy<B: Backend>(
    value: Tensor<B, 2>,
    log_prob: Tensor<B, 2>,
    entropy_scale: f32,
) -> Tensor<B, 2> {
    let [_, components] = value.dims();
    let reward = value.clone().narrow(1, 0, components - 1);
    let entropy = value.narrow(1, components - 1, 1) - log_prob.mul_scalar(entropy_scale);
    Tensor::cat(vec![reward, entropy], 1)
}

fn scalar<B: Backend>(t: &Tensor<B, 1>) -> f32 {
    t.clone().into_scalar().elem::<f32>()
}

/// Adam optimizers for the actor and for the whole critic ensemble.
pub fn create_optimizers<B, A, C>(
    config: &SACConfig,
) -> (impl Optimizer<A, B> + Clone, impl Optimizer<Vec<C>, B> + Clone)
where
    B: AutodiffBackend,
    A: AutodiffModule<B>,
    C: AutodiffModule<B>,
{
    let mut actor_config = AdamConfig::new().with_epsilon(config.adam_epsilon);
    let mut critic_config = AdamConfig::new().with_epsilon(config.adam_epsilon);
    if let Some(max_norm) = config.max_grad_norm {
        actor_config = actor_config.with_grad_clipping(Some(GradientClippingConfig::Norm(max_norm)));
        critic_config = critic_config.with_grad_clipping(Some(GradientClippingConfig::Norm(max_norm)));
    }
    (actor_config.init::<B, A>(), critic_config.init::<B, Vec<C>>())
}

// ============================================================================
// Learner
// ============================================================================

/// Persisted non-tensor learner state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LearnerState {
    step: u64,
    normalizer: ReturnNormalizer,
    target_normalizer: ReturnNormalizer,
}

/// Owns the model, its targets, both optimizers and the return normalizers.
pub struct Learner<B, A, C, AO, CO>
where
    B: AutodiffBackend,
    A: SACActor<B> + AutodiffModule<B>,
    A::InnerModule: SACActor<B::InnerBackend>,
    C: SACCritic<B> + AutodiffModule<B>,
    C::InnerModule: SACCritic<B::InnerBackend>,
    AO: Optimizer<A, B>,
    CO: Optimizer<Vec<C>, B>,
{
    config: SACConfig,
    schema: ObservationSchema,
    action_dim: usize,
    actor: A,
    critics: Vec<C>,
    target_critics: Vec<C::InnerModule>,
    actor_optim: AO,
    critic_optim: CO,
    normalizer: ReturnNormalizer,
    target_normalizer: ReturnNormalizer,
    memory: SharedReplayMemory,
    device: B::Device,
    step: u64,
}

impl<B, A, C, AO, CO> Learner<B, A, C, AO, CO>
where
    B: AutodiffBackend,
    A: SACActor<B> + AutodiffModule<B>,
    A::InnerModule: SACActor<B::InnerBackend>,
    C: SACCritic<B> + AutodiffModule<B>,
    C::InnerModule: SACCritic<B::InnerBackend>,
    AO: Optimizer<A, B>,
    CO: Optimizer<Vec<C>, B>,
{
    /// Create a learner. Target critics start as snapshots of `model.critics`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SACConfig,
        schema: ObservationSchema,
        action_dim: usize,
        model: SACModel<A, C>,
        actor_optim: AO,
        critic_optim: CO,
        memory: SharedReplayMemory,
        device: B::Device,
    ) -> Result<Self, LearnerError> {
        config.validate()?;
        schema.validate_self()?;
        if model.critics.len() < 2 {
            return Err(ConfigError::OutOfRange {
                field: "critics",
                value: model.critics.len() as f64,
                min: 2.0,
                max: f64::INFINITY,
            }
            .into());
        }

        let target_critics = model.critics.iter().map(|c| snapshot(&c.valid())).collect();
        let normalizer = ReturnNormalizer::new(VALUE_COMPONENTS, config.normalizer.clone());
        let target_normalizer = normalizer.clone();

        Ok(Self {
            config,
            schema,
            action_dim,
            actor: model.actor,
            critics: model.critics,
            target_critics,
            actor_optim,
            critic_optim,
            normalizer,
            target_normalizer,
            memory,
            device,
            step: 0,
        })
    }

    pub fn config(&self) -> &SACConfig {
        &self.config
    }

    pub fn actor(&self) -> &A {
        &self.actor
    }

    pub fn critics(&self) -> &[C] {
        &self.critics
    }

    pub fn target_critics(&self) -> &[C::InnerModule] {
        &self.target_critics
    }

    pub fn normalizer(&self) -> &ReturnNormalizer {
        &self.normalizer
    }

    pub fn target_normalizer(&self) -> &ReturnNormalizer {
        &self.target_normalizer
    }

    pub fn memory(&self) -> &SharedReplayMemory {
        &self.memory
    }

    /// Completed training steps.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Block until enough transitions are stored to start training.
    ///
    /// Returns `false` if `shutdown` was raised first.
    pub fn wait_until_ready(&self, shutdown: &AtomicBool) -> bool {
        self.memory.wait_for_len(self.config.min_memory(), shutdown)
    }

    /// Sample a batch (blocking until one is available) and train on it.
    pub fn train_step(&mut self, shutdown: &AtomicBool) -> Result<TrainMetrics, LearnerError> {
        let batch = self
            .memory
            .sample_blocking(self.config.batch_size, shutdown)
            .ok_or(LearnerError::Cancelled)?;
        self.train_on_batch(&batch)
    }

    /// One full SAC update on the given transitions.
    pub fn train_on_batch(&mut self, transitions: &[Transition]) -> Result<TrainMetrics, LearnerError> {
        if transitions.is_empty() {
            return Err(LearnerError::EmptyBatch);
        }
        let batch = TrainingBatch::<B>::from_transitions(&self.schema, self.action_dim, transitions, &self.device)?;

        let (new_action, new_log_prob) = self.actor.forward(&batch.obs).rsample();
        let found = new_action.dims()[1];
        if found != self.action_dim {
            return Err(LearnerError::ActionDim {
                expected: self.action_dim,
                found,
            });
        }

        let loss_critic = self.update_critics(&batch)?;
        let loss_actor = self.update_actor(&batch, new_action, new_log_prob)?;
        self.update_targets();

        self.step += 1;
        let last = VALUE_COMPONENTS - 1;
        Ok(TrainMetrics {
            step: self.step,
            loss_actor,
            loss_critic,
            reward_mean: self.normalizer.mean()[0],
            entropy_mean: self.normalizer.mean()[last],
            reward_std: self.normalizer.std()[0],
            entropy_std: self.normalizer.std()[last],
            memory_size: self.memory.len(),
        })
    }

    /// Critic regression toward the bootstrapped target. Commits the critics
    /// and the online normalizer, returns the critic loss.
    pub(crate) fn update_critics(&mut self, batch: &TrainingBatch<B>) -> Result<f32, LearnerError> {
        let expected = [batch.actions.dims()[0], VALUE_COMPONENTS];
        let cfg = &self.config;
        let inner = batch.inner();

        // Bootstrap target from a frozen actor and the target critics.
        let frozen_actor = self.actor.valid();
        let (next_action, next_log_prob) = frozen_actor.forward(&inner.next_obs).sample();
        let next_values = self
            .target_critics
            .iter()
            .map(|c| c.forward(&inner.next_obs, next_action.clone()))
            .collect();
        let next_value = self
            .target_normalizer
            .unnormalize(component_min(next_values, expected)?);
        let raw_target = bootstrap_targets(
            inner.rewards,
            inner.terminals,
            next_log_prob,
            next_value,
            cfg.discount,
            cfg.reward_scale,
            cfg.entropy_scale,
        );

        // Stage the statistics shift; commit after the shape checks below.
        let mut normalizer = self.normalizer.clone();
        let (target, rescale) = normalizer.update(raw_target)?;
        let critics: Vec<C> = match &rescale {
            Some(rescale) => self
                .critics
                .iter()
                .cloned()
                .map(|c| c.rescale_output(rescale))
                .collect(),
            None => self.critics.clone(),
        };
        let target = Tensor::<B, 2>::from_inner(target);

        let values: Vec<Tensor<B, 2>> = critics
            .iter()
            .map(|c| c.forward(&batch.obs, batch.actions.clone()))
            .collect();
        for value in &values {
            check_shape(value, expected)?;
        }
        let critic_loss = values
            .into_iter()
            .map(|v| (v - target.clone()).powf_scalar(2.0).mean())
            .reduce(|a, b| a + b)
            .ok_or(LearnerError::EmptyBatch)?;
        let loss_critic = scalar(&critic_loss);

        let grads = critic_loss.backward();
        let grads = GradientsParams::from_grads(grads, &critics);
        self.critics = self.critic_optim.step(cfg.lr, critics, grads);
        self.normalizer = normalizer;
        Ok(loss_critic)
    }

    /// Actor step against the current critics, which are evaluated without
    /// tracking their parameters. `action` and `log_prob` come from
    /// `actor(batch.obs).rsample()`.
    pub(crate) fn update_actor(
        &mut self,
        batch: &TrainingBatch<B>,
        action: Tensor<B, 2>,
        log_prob: Tensor<B, 2>,
    ) -> Result<f32, LearnerError> {
        let expected = [batch.actions.dims()[0], VALUE_COMPONENTS];
        let cfg = &self.config;

        let frozen_critics = self.critics.clone().no_grad();
        let values = frozen_critics
            .iter()
            .map(|c| c.forward(&batch.obs, action.clone()))
            .collect();
        let value = self.normalizer.unnormalize(component_min(values, expected)?);
        let adjusted = subtract_entropy(value, log_prob, cfg.entropy_scale);
        let actor_loss = self
            .normalizer
            .normalize_sum(adjusted.sum_dim(1))
            .mean()
            .neg();
        let loss_actor = scalar(&actor_loss);

        let grads = actor_loss.backward();
        let grads = GradientsParams::from_grads(grads, &self.actor);
        self.actor = self.actor_optim.step(cfg.lr, self.actor.clone(), grads);
        Ok(loss_actor)
    }

    /// Targets follow the online networks.
    fn update_targets(&mut self) {
        let tau = self.config.target_update;
        let targets = std::mem::take(&mut self.target_critics);
        self.target_critics = soft_update(&self.critics.valid(), targets, tau);
        self.target_normalizer.ema_toward(&self.normalizer, tau);
    }

    /// Serialize the current actor (inner backend copy, no optimizer state).
    pub fn actor_snapshot(&self) -> Result<Vec<u8>, WeightError> {
        snapshot_bytes(&self.actor.valid())
    }

    /// Publish the current actor into `slot`, returning the new version.
    pub fn publish(&self, slot: &WeightSlot) -> Result<u64, WeightError> {
        Ok(slot.publish(self.actor_snapshot()?))
    }
}

fn recorder_err(e: impl std::fmt::Display) -> CheckpointError {
    CheckpointError::Recorder(e.to_string())
}

impl<B, A, C, AO, CO> Checkpointable for Learner<B, A, C, AO, CO>
where
    B: AutodiffBackend,
    A: SACActor<B> + AutodiffModule<B>,
    A::InnerModule: SACActor<B::InnerBackend>,
    C: SACCritic<B> + AutodiffModule<B>,
    C::InnerModule: SACCritic<B::InnerBackend>,
    AO: Optimizer<A, B> + Clone,
    CO: Optimizer<Vec<C>, B> + Clone,
{
    fn save_state(&self, dir: &Path) -> Result<(), CheckpointError> {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        self.actor
            .clone()
            .save_file(dir.join("actor"), &recorder)
            .map_err(recorder_err)?;
        self.critics
            .clone()
            .save_file(dir.join("critics"), &recorder)
            .map_err(recorder_err)?;
        self.target_critics
            .clone()
            .save_file(dir.join("target_critics"), &recorder)
            .map_err(recorder_err)?;
        Recorder::<B>::record(&recorder, self.actor_optim.to_record(), dir.join("actor_optim"))
            .map_err(recorder_err)?;
        Recorder::<B>::record(&recorder, self.critic_optim.to_record(), dir.join("critic_optim"))
            .map_err(recorder_err)?;

        let state = LearnerState {
            step: self.step,
            normalizer: self.normalizer.clone(),
            target_normalizer: self.target_normalizer.clone(),
        };
        let json = serde_json::to_string_pretty(&state)?;
        std::fs::write(dir.join("state.json"), json)?;
        Ok(())
    }

    fn load_state(&mut self, dir: &Path) -> Result<u64, CheckpointError> {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        let json = std::fs::read_to_string(dir.join("state.json"))?;
        let state: LearnerState = serde_json::from_str(&json)?;

        let actor = self
            .actor
            .clone()
            .load_file(dir.join("actor"), &recorder, &self.device)
            .map_err(recorder_err)?;
        let critics = self
            .critics
            .clone()
            .load_file(dir.join("critics"), &recorder, &self.device)
            .map_err(recorder_err)?;
        let target_critics = self
            .target_critics
            .clone()
            .load_file(dir.join("target_critics"), &recorder, &self.device)
            .map_err(recorder_err)?;
        let actor_optim_record = Recorder::<B>::load::<AO::Record>(&recorder, dir.join("actor_optim"), &self.device)
            .map_err(recorder_err)?;
        let critic_optim_record = Recorder::<B>::load::<CO::Record>(&recorder, dir.join("critic_optim"), &self.device)
            .map_err(recorder_err)?;

        // Everything decoded; commit.
        self.actor = actor;
        self.critics = critics;
        self.target_critics = target_critics;
        self.actor_optim = self.actor_optim.clone().load_record(actor_optim_record);
        self.critic_optim = self.critic_optim.clone().load_record(critic_optim_record);
        self.normalizer = state.normalizer;
        self.target_normalizer = state.target_normalizer;
        self.step = state.step;
        Ok(self.step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    fn values(t: Tensor<B, 2>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    fn column(rows: &[f32]) -> Tensor<B, 2> {
        Tensor::<B, 1>::from_floats(rows, &Default::default()).reshape([rows.len(), 1])
    }

    #[test]
    fn test_bootstrap_non_terminal() {
        let device = Default::default();
        let next_value = Tensor::<B, 2>::from_floats([[2.0, 4.0]], &device);
        let target = bootstrap_targets(
            column(&[1.0]),
            column(&[0.0]),
            column(&[-0.5]),
            next_value,
            0.9,
            5.0,
            0.5,
        );
        let out = values(target);
        // reward: 5·1 + 0.9·2
        assert!((out[0] - 6.8).abs() < 1e-5);
        // entropy: 0.5·0.9·0.5 + 0.9·4
        assert!((out[1] - 3.825).abs() < 1e-5);
    }

    #[test]
    fn test_bootstrap_terminal_masks_future() {
        let device = Default::default();
        let next_value = Tensor::<B, 2>::from_floats([[100.0, -100.0], [100.0, -100.0]], &device);
        let target = bootstrap_targets(
            column(&[1.0, 1.0]),
            column(&[1.0, 0.0]),
            column(&[-3.0, -3.0]),
            next_value,
            0.99,
            2.0,
            1.0,
        );
        let out = values(target);
        assert_eq!(out[0], 2.0);
        assert_eq!(out[1], 0.0);
        assert!(out[2] > 2.0);
        assert!(out[3] < 0.0);
    }

    #[test]
    fn test_component_min_is_per_column() {
        let device = Default::default();
        let a = Tensor::<B, 2>::from_floats([[1.0, 5.0]], &device);
        let b = Tensor::<B, 2>::from_floats([[3.0, 2.0]], &device);
        let min = component_min(vec![a, b], [1, 2]).unwrap();
        assert_eq!(values(min), vec![1.0, 2.0]);
    }

    #[test]
    fn test_component_min_rejects_wrong_shape() {
        let device = Default::default();
        let a = Tensor::<B, 2>::zeros([4, 2], &device);
        let b = Tensor::<B, 2>::zeros([4, 3], &device);
        let err = component_min(vec![a, b], [4, 2]).unwrap_err();
        assert_eq!(
            err,
            LearnerError::ShapeMismatch {
                expected: [4, 2],
                found: [4, 3]
            }
        );
    }

    #[test]
    fn test_subtract_entropy_touches_only_entropy_column() {
        let device = Default::default();
        let value = Tensor::<B, 2>::from_floats([[1.0, 1.0], [2.0, 2.0]], &device);
        let out = values(subtract_entropy(value, column(&[0.5, -1.0]), 0.1));
        assert_eq!(out[0], 1.0);
        assert!((out[1] - 0.95).abs() < 1e-6);
        assert_eq!(out[2], 2.0);
        assert!((out[3] - 2.1).abs() < 1e-6);
    }

    #[test]
    fn test_batch_rejects_wrong_action_size() {
        let schema = ObservationSchema::vector(2);
        let t = Transition::new(
            Observation::vector(vec![0.0, 0.0]),
            vec![0.1, 0.2, 0.3],
            1.0,
            Observation::vector(vec![0.0, 0.0]),
            false,
        );
        let err = TrainingBatch::<B>::from_transitions(&schema, 2, &[t], &Default::default()).unwrap_err();
        assert_eq!(err, LearnerError::ActionDim { expected: 2, found: 3 });
    }
}
