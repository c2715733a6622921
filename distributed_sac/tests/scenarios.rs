//! End-to-end scenarios through the public API.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use burn::backend::{Autodiff, NdArray};
use burn::tensor::{Tensor, TensorData};

use distributed_sac::algorithms::sac::bootstrap_targets;
use distributed_sac::core::weight_slot::snapshot_bytes;
use distributed_sac::{
    create_optimizers, weight_slot, EnvError, Environment, Learner, MlpActor, MlpCritic, MlpFactory, ModelFactory,
    ModelKind, Observation, ObservationSchema, ReplayMemory, RolloutWorker, SACConfig, StepOutcome, Transition,
    WorkerConfig,
};

type IB = NdArray<f32>;
type AB = Autodiff<IB>;

fn transition(i: usize, reward: f32, terminal: bool) -> Transition {
    let x = i as f32 * 0.1;
    Transition::new(
        Observation::vector(vec![x, 1.0 - x]),
        vec![0.1],
        reward,
        Observation::vector(vec![x + 0.1, 0.9 - x]),
        terminal,
    )
}

/// Walks along a line; never ends on its own.
struct Line {
    schema: ObservationSchema,
    pos: f32,
}

impl Line {
    fn new() -> Self {
        Self {
            schema: ObservationSchema::vector(2),
            pos: 0.0,
        }
    }
}

impl Environment for Line {
    fn schema(&self) -> &ObservationSchema {
        &self.schema
    }

    fn action_dim(&self) -> usize {
        1
    }

    fn reset(&mut self) -> Result<Observation, EnvError> {
        self.pos = 0.0;
        Ok(Observation::vector(vec![self.pos, 1.0]))
    }

    fn step(&mut self, action: &[f32]) -> Result<StepOutcome, EnvError> {
        self.pos += action[0];
        Ok(StepOutcome::new(Observation::vector(vec![self.pos, 1.0]), -self.pos.abs()))
    }
}

#[test]
fn scenario_a_one_step_on_four_transitions() {
    let config = SACConfig::new()
        .with_batch_size(4)
        .with_memory_size(10)
        .with_seed(11)
        .with_model(ModelKind::Mlp {
            hidden_sizes: vec![32, 32],
        });
    let schema = ObservationSchema::vector(2);
    let device = Default::default();
    let model = <MlpFactory as ModelFactory<AB>>::build(&config.model.resolve(), &schema, 1, 2, &device).unwrap();
    let (actor_optim, critic_optim) = create_optimizers::<AB, MlpActor<AB>, MlpCritic<AB>>(&config);

    let memory = Arc::new(ReplayMemory::with_seed(config.memory_size, 11));
    memory.extend((0..4).map(|i| transition(i, 1.0, false)));

    let mut learner = Learner::new(
        config,
        schema,
        1,
        model,
        actor_optim,
        critic_optim,
        Arc::clone(&memory),
        device,
    )
    .unwrap();
    let shutdown = AtomicBool::new(false);
    assert!(learner.wait_until_ready(&shutdown));
    let metrics = learner.train_step(&shutdown).unwrap();

    assert!(metrics.loss_critic.is_finite());
    assert!(metrics.loss_actor.is_finite());
    assert_eq!(metrics.memory_size, 4);
    assert_eq!(metrics.step, 1);
}

#[test]
fn scenario_b_terminal_masks_future_terms() {
    let device = Default::default();
    let rewards = Tensor::<IB, 2>::from_data(TensorData::new(vec![1.0f32, 1.0], [2, 1]), &device);
    let terminals = Tensor::<IB, 2>::from_data(TensorData::new(vec![1.0f32, 0.0], [2, 1]), &device);
    let next_log_prob = Tensor::<IB, 2>::from_data(TensorData::new(vec![-0.7f32, -0.7], [2, 1]), &device);
    let next_value = Tensor::<IB, 2>::from_data(TensorData::new(vec![10.0f32, 20.0, 10.0, 20.0], [2, 2]), &device);

    let target = bootstrap_targets(rewards, terminals, next_log_prob, next_value, 0.9, 2.0, 1.0);
    let values = target.into_data().to_vec::<f32>().unwrap();

    // terminal row: reward only, no future value and no entropy bonus
    assert_eq!(&values[..2], &[2.0, 0.0]);
    // live row: 2 + 0.9·10 and 0.9·0.7 + 0.9·20
    assert!((values[2] - 11.0).abs() < 1e-5);
    assert!((values[3] - 18.63).abs() < 1e-4);
}

#[test]
fn scenario_c_oldest_transitions_fall_out() {
    let memory = ReplayMemory::with_seed(10, 5);
    for i in 0..12 {
        memory.append(transition(i, i as f32, false));
    }
    assert_eq!(memory.len(), 10);

    let mut retained: Vec<f32> = memory.retained().iter().map(|t| t.reward).collect();
    retained.sort_by(f32::total_cmp);
    let expected: Vec<f32> = (2..12).map(|i| i as f32).collect();
    assert_eq!(retained, expected);

    for _ in 0..50 {
        let batch = memory.sample(10).unwrap();
        assert!(batch.iter().all(|t| t.reward >= 2.0));
    }
}

#[test]
fn scenario_d_stale_worker_keeps_acting() {
    let device = Default::default();
    let actor = <MlpFactory as ModelFactory<IB>>::actor(&MlpFactory::new(vec![16]), &ObservationSchema::vector(2), 1, &device).unwrap();
    let before = snapshot_bytes(&actor).unwrap();

    let (tx, rx) = crossbeam_channel::unbounded();
    let mut worker = RolloutWorker::new(
        WorkerConfig::default().with_weights_refresh_interval(1).with_max_episode_steps(20),
        Line::new(),
        actor,
        weight_slot(),
        device,
    )
    .unwrap()
    .with_sink(tx);

    let stats = worker.run_for(100, &AtomicBool::new(false)).unwrap();
    assert_eq!(stats.steps, 100);
    assert_eq!(stats.weight_updates, 0);
    assert_eq!(worker.weights_version(), 0);
    assert_eq!(snapshot_bytes(worker.actor()).unwrap(), before);

    let sent: Vec<Transition> = rx.try_iter().collect();
    assert_eq!(sent.len(), 100);
    assert!(sent
        .iter()
        .all(|t| t.action.len() == 1 && t.action[0].abs() <= 1.0 && t.reward.is_finite() && !t.terminal));
}
