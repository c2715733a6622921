//! Environment contract used by rollout workers.
//!
//! Environments produce [`Observation`]s matching their own
//! [`ObservationSchema`] and accept actions in the policy's squashed
//! `[-1, 1]` range; rescaling to physical units is the environment's job.
//!
//! [`RealTimeEnv`] wraps any environment and paces `step` calls to a fixed
//! wall-clock period, for environments that run in real time and expect
//! actions at a steady rate.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::core::observation::{Observation, ObservationSchema};

/// Environment adapter failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvError {
    pub message: String,
}

impl EnvError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for EnvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Environment error: {}", self.message)
    }
}

impl std::error::Error for EnvError {}

/// Result of one environment step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// Observation after the step.
    pub obs: Observation,
    /// Raw reward.
    pub reward: f32,
    /// True episode end (goal reached, failure).
    pub terminal: bool,
    /// Episode cut by the environment's own time limit. Not terminal.
    pub truncated: bool,
    /// Scalar diagnostics, copied into the transition.
    pub info: BTreeMap<String, f32>,
}

impl StepOutcome {
    /// Non-terminal step without info.
    pub fn new(obs: Observation, reward: f32) -> Self {
        Self {
            obs,
            reward,
            terminal: false,
            truncated: false,
            info: BTreeMap::new(),
        }
    }

    pub fn with_terminal(mut self, terminal: bool) -> Self {
        self.terminal = terminal;
        self
    }

    pub fn with_truncated(mut self, truncated: bool) -> Self {
        self.truncated = truncated;
        self
    }

    pub fn with_info(mut self, key: impl Into<String>, value: f32) -> Self {
        self.info.insert(key.into(), value);
        self
    }

    /// Episode is over for either reason.
    pub fn is_done(&self) -> bool {
        self.terminal || self.truncated
    }
}

/// A single (non-vectorized) environment.
pub trait Environment: Send {
    /// Layout of every observation this environment emits.
    fn schema(&self) -> &ObservationSchema;

    /// Number of continuous action dimensions.
    fn action_dim(&self) -> usize;

    /// Start a new episode.
    fn reset(&mut self) -> Result<Observation, EnvError>;

    /// Apply `action` (length `action_dim`, values in `[-1, 1]`).
    fn step(&mut self, action: &[f32]) -> Result<StepOutcome, EnvError>;
}

impl<E: Environment + ?Sized> Environment for Box<E> {
    fn schema(&self) -> &ObservationSchema {
        (**self).schema()
    }

    fn action_dim(&self) -> usize {
        (**self).action_dim()
    }

    fn reset(&mut self) -> Result<Observation, EnvError> {
        (**self).reset()
    }

    fn step(&mut self, action: &[f32]) -> Result<StepOutcome, EnvError> {
        (**self).step(action)
    }
}

// ============================================================================
// Real-time pacing
// ============================================================================

/// Spaces consecutive `step` calls by a fixed period.
///
/// If the caller (inference plus bookkeeping) takes longer than the period,
/// the step runs immediately and the overrun is counted.
pub struct RealTimeEnv<E> {
    inner: E,
    period: Duration,
    last_step: Option<Instant>,
    overruns: u64,
}

impl<E: Environment> RealTimeEnv<E> {
    pub fn new(inner: E, period: Duration) -> Self {
        Self {
            inner,
            period,
            last_step: None,
            overruns: 0,
        }
    }

    /// Steps that started later than their slot.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn into_inner(self) -> E {
        self.inner
    }

    fn wait_for_slot(&mut self) {
        if let Some(last) = self.last_step {
            let elapsed = last.elapsed();
            if elapsed < self.period {
                std::thread::sleep(self.period - elapsed);
            } else if elapsed > self.period {
                self.overruns += 1;
                log::debug!(
                    "Real-time step overrun: {:?} since last step (period {:?})",
                    elapsed,
                    self.period
                );
            }
        }
        self.last_step = Some(Instant::now());
    }
}

impl<E: Environment> Environment for RealTimeEnv<E> {
    fn schema(&self) -> &ObservationSchema {
        self.inner.schema()
    }

    fn action_dim(&self) -> usize {
        self.inner.action_dim()
    }

    fn reset(&mut self) -> Result<Observation, EnvError> {
        self.last_step = None;
        self.inner.reset()
    }

    fn step(&mut self, action: &[f32]) -> Result<StepOutcome, EnvError> {
        self.wait_for_slot();
        self.inner.step(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        schema: ObservationSchema,
        t: f32,
        work: Duration,
    }

    impl Counter {
        fn new(work: Duration) -> Self {
            Self {
                schema: ObservationSchema::vector(1),
                t: 0.0,
                work,
            }
        }
    }

    impl Environment for Counter {
        fn schema(&self) -> &ObservationSchema {
            &self.schema
        }

        fn action_dim(&self) -> usize {
            1
        }

        fn reset(&mut self) -> Result<Observation, EnvError> {
            self.t = 0.0;
            Ok(Observation::vector(vec![self.t]))
        }

        fn step(&mut self, _action: &[f32]) -> Result<StepOutcome, EnvError> {
            std::thread::sleep(self.work);
            self.t += 1.0;
            Ok(StepOutcome::new(Observation::vector(vec![self.t]), 1.0))
        }
    }

    #[test]
    fn test_outcome_flags() {
        let outcome = StepOutcome::new(Observation::vector(vec![0.0]), 0.0);
        assert!(!outcome.is_done());
        assert!(outcome.clone().with_truncated(true).is_done());
        let outcome = outcome.with_terminal(true).with_info("speed", 3.0);
        assert!(outcome.is_done());
        assert_eq!(outcome.info.get("speed"), Some(&3.0));
    }

    #[test]
    fn test_real_time_spacing() {
        let mut env = RealTimeEnv::new(Counter::new(Duration::ZERO), Duration::from_millis(20));
        env.reset().unwrap();
        let start = Instant::now();
        for _ in 0..3 {
            env.step(&[0.0]).unwrap();
        }
        // first step is free, the next two wait for their slot
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(env.overruns(), 0);
    }

    #[test]
    fn test_real_time_overrun_is_counted() {
        let mut env = RealTimeEnv::new(Counter::new(Duration::from_millis(10)), Duration::from_millis(1));
        env.reset().unwrap();
        for _ in 0..3 {
            env.step(&[0.0]).unwrap();
        }
        assert_eq!(env.overruns(), 2);
        assert_eq!(env.inner().t, 3.0);
    }
}
