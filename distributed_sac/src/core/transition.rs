//! Experience record produced by workers and stored by the trainer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::observation::Observation;

/// One environment step as seen by the learner.
///
/// Created by a worker, copied into replay memory, never mutated afterwards.
/// `terminal` is only set for true episode ends; time-limit resets keep it
/// `false` so the bootstrap term survives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// Observation the action was taken from.
    pub obs: Observation,
    /// Action taken, in the policy's squashed `[-1, 1]` range.
    pub action: Vec<f32>,
    /// Raw environment reward (unscaled).
    pub reward: f32,
    /// Observation after the step.
    pub next_obs: Observation,
    /// Episode ended in a terminal state.
    pub terminal: bool,
    /// Scalar diagnostics reported by the environment for this step.
    #[serde(default)]
    pub info: BTreeMap<String, f32>,
}

impl Transition {
    /// Create a transition without environment info.
    pub fn new(
        obs: Observation,
        action: Vec<f32>,
        reward: f32,
        next_obs: Observation,
        terminal: bool,
    ) -> Self {
        Self {
            obs,
            action,
            reward,
            next_obs,
            terminal,
            info: BTreeMap::new(),
        }
    }

    /// Attach environment info.
    pub fn with_info(mut self, info: BTreeMap<String, f32>) -> Self {
        self.info = info;
        self
    }
}
