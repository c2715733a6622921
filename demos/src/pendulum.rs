//! Pendulum swing-up.
//!
//! - Observation: `[cos θ, sin θ, θ̇]`
//! - Action: one value in `[-1, 1]`, scaled to a torque in `[-2, 2]`
//! - Reward: `-(θ² + 0.1·θ̇² + 0.001·torque²)` with θ wrapped to `[-π, π]`
//!
//! Episodes never terminate; the worker's `max_episode_steps` cuts them.

use distributed_sac::{EnvError, Environment, Observation, ObservationSchema, StepOutcome};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

const MAX_SPEED: f32 = 8.0;
const MAX_TORQUE: f32 = 2.0;
const G: f32 = 10.0;
const M: f32 = 1.0;
const L: f32 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PendulumConfig {
    /// Integration step, also the real-time step period.
    pub dt_ms: u64,
    /// Pace steps in wall-clock time.
    pub real_time: bool,
    pub seed: Option<u64>,
}

impl Default for PendulumConfig {
    fn default() -> Self {
        Self {
            dt_ms: 50,
            real_time: true,
            seed: None,
        }
    }
}

pub struct Pendulum {
    schema: ObservationSchema,
    dt: f32,
    theta: f32,
    theta_dot: f32,
    rng: fastrand::Rng,
}

impl Pendulum {
    pub fn new(config: &PendulumConfig) -> Self {
        Self {
            schema: ObservationSchema::vector(3),
            dt: config.dt_ms as f32 / 1000.0,
            theta: PI,
            theta_dot: 0.0,
            rng: config.seed.map_or_else(fastrand::Rng::new, fastrand::Rng::with_seed),
        }
    }

    fn observe(&self) -> Observation {
        Observation::vector(vec![self.theta.cos(), self.theta.sin(), self.theta_dot])
    }
}

fn angle_normalize(x: f32) -> f32 {
    (x + PI).rem_euclid(2.0 * PI) - PI
}

impl Environment for Pendulum {
    fn schema(&self) -> &ObservationSchema {
        &self.schema
    }

    fn action_dim(&self) -> usize {
        1
    }

    fn reset(&mut self) -> Result<Observation, EnvError> {
        self.theta = (self.rng.f32() * 2.0 - 1.0) * PI;
        self.theta_dot = self.rng.f32() * 2.0 - 1.0;
        Ok(self.observe())
    }

    fn step(&mut self, action: &[f32]) -> Result<StepOutcome, EnvError> {
        let Some(&a) = action.first() else {
            return Err(EnvError::new("pendulum expects one action value"));
        };
        let torque = a.clamp(-1.0, 1.0) * MAX_TORQUE;

        let theta = angle_normalize(self.theta);
        let cost = theta * theta + 0.1 * self.theta_dot * self.theta_dot + 0.001 * torque * torque;

        self.theta_dot = (self.theta_dot
            + (3.0 * G / (2.0 * L) * self.theta.sin() + 3.0 / (M * L * L) * torque) * self.dt)
            .clamp(-MAX_SPEED, MAX_SPEED);
        self.theta += self.theta_dot * self.dt;

        Ok(StepOutcome::new(self.observe(), -cost).with_info("cost", cost))
    }
}
