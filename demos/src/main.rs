//! `sac-node`: run one role of a distributed SAC setup on the pendulum task.
//!
//! ```bash
//! # relay
//! cargo run --release -- --server
//!
//! # trainer and any number of workers, each in its own shell
//! cargo run --release -- --trainer
//! cargo run --release -- --worker --worker-id 0
//! cargo run --release -- --worker --worker-id 1
//!
//! # evaluate the latest published actor, or time the environment
//! cargo run --release -- --test --episodes 5
//! cargo run --release -- --benchmark --steps 2000
//! ```
//!
//! Every role reads the same optional JSON config (`--config node.json`);
//! missing fields take their defaults.

mod pendulum;

use anyhow::Context;
use burn::backend::{Autodiff, NdArray};
use clap::{ArgGroup, Parser};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use distributed_sac::exchange::{Connection, Request, Response};
use distributed_sac::{
    create_optimizers, load_json, weight_slot, ActionMode, ConsoleLogger, CsvLogger, DeviceSpec, Environment,
    ExchangeConfig, Learner, MlpActor, MlpCritic, ModelFactory, MultiLogger, RealTimeEnv, RelayServer, ReplayMemory,
    RolloutWorker, SACConfig, Trainer, TrainerConfig, TrainerLink, WeightSlot, WorkerConfig, WorkerLink,
};
use pendulum::{Pendulum, PendulumConfig};

type InferenceBackend = NdArray<f32>;
type TrainBackend = Autodiff<InferenceBackend>;

/// Distributed SAC node
#[derive(Parser, Debug)]
#[command(name = "sac-node")]
#[command(about = "Run one role of a distributed SAC setup", long_about = None)]
#[command(group(
    ArgGroup::new("role")
        .required(true)
        .args(["server", "worker", "trainer", "test", "benchmark"]),
))]
struct Cli {
    /// Run the exchange relay
    #[arg(long)]
    server: bool,

    /// Collect experience with the latest published actor
    #[arg(long)]
    worker: bool,

    /// Train on experience pulled from the relay
    #[arg(long)]
    trainer: bool,

    /// Play evaluation episodes with the latest published actor
    #[arg(long)]
    test: bool,

    /// Time environment steps and inference
    #[arg(long)]
    benchmark: bool,

    /// JSON node configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Relay address, overrides the config file
    #[arg(long)]
    address: Option<String>,

    #[arg(long, default_value_t = 0)]
    worker_id: usize,

    /// Episodes for --test
    #[arg(long, default_value_t = 5)]
    episodes: usize,

    /// Steps for --benchmark
    #[arg(long, default_value_t = 1000)]
    steps: u64,

    /// Stop after this many seconds
    #[arg(long)]
    max_seconds: Option<u64>,

    /// Do not write the metrics CSV
    #[arg(long)]
    no_csv: bool,
}

/// Everything a node can be configured with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct NodeConfig {
    sac: SACConfig,
    worker: WorkerConfig,
    exchange: ExchangeConfig,
    trainer: TrainerConfig,
    env: PendulumConfig,
    device: DeviceSpec,
    /// Metrics CSV written by the trainer.
    csv_path: Option<PathBuf>,
}

impl NodeConfig {
    fn load(cli: &Cli) -> anyhow::Result<Self> {
        let mut config: NodeConfig = match &cli.config {
            Some(path) => load_json(path).with_context(|| format!("loading {}", path.display()))?,
            None => NodeConfig::default(),
        };
        if let Some(address) = &cli.address {
            config.exchange.address = address.clone();
        }
        if config.worker.max_episode_steps.is_none() {
            config.worker.max_episode_steps = Some(200);
        }
        config.worker.worker_id = cli.worker_id;
        config.sac.validate()?;
        config.exchange.validate()?;
        config.worker.validate()?;
        Ok(config)
    }

    fn env(&self) -> Box<dyn Environment> {
        let pendulum = Pendulum::new(&self.env);
        if self.env.real_time {
            Box::new(RealTimeEnv::new(pendulum, Duration::from_millis(self.env.dt_ms)))
        } else {
            Box::new(pendulum)
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = NodeConfig::load(&cli)?;
    let shutdown = Arc::new(AtomicBool::new(false));
    if let Some(seconds) = cli.max_seconds {
        let flag = Arc::clone(&shutdown);
        std::thread::Builder::new()
            .name("deadline".to_string())
            .spawn(move || {
                std::thread::sleep(Duration::from_secs(seconds));
                log::info!("Time limit of {}s reached, shutting down", seconds);
                flag.store(true, Ordering::Relaxed);
            })?;
    }

    if cli.server {
        run_server(&config, &shutdown)
    } else if cli.worker {
        run_worker(&config, &shutdown)
    } else if cli.trainer {
        run_trainer(&config, &cli, &shutdown)
    } else if cli.test {
        run_test(&config, cli.episodes, &shutdown)
    } else {
        run_benchmark(&config, cli.steps, &shutdown)
    }
}

fn run_server(config: &NodeConfig, shutdown: &AtomicBool) -> anyhow::Result<()> {
    let server = RelayServer::bind(&config.exchange)?;
    log::info!("Role: server on {}", server.local_addr());
    let state = Arc::clone(server.state());
    server.serve_until(shutdown);
    let stats = state.stats();
    log::info!(
        "Relay stopped: {} received, {} delivered, {} dropped",
        stats.received,
        stats.delivered,
        stats.dropped
    );
    Ok(())
}

fn fresh_actor(config: &NodeConfig, env: &dyn Environment) -> anyhow::Result<MlpActor<InferenceBackend>> {
    let device = config.device.resolve_ndarray();
    let factory = config.sac.model.resolve();
    Ok(ModelFactory::<InferenceBackend>::actor(
        &factory,
        env.schema(),
        env.action_dim(),
        &device,
    )?)
}

fn run_worker(config: &NodeConfig, shutdown: &Arc<AtomicBool>) -> anyhow::Result<()> {
    log::info!("Role: worker {} -> {}", config.worker.worker_id, config.exchange.address);
    let env = config.env();
    let actor = fresh_actor(config, env.as_ref())?;
    let weights = weight_slot();

    let (sink, samples) = WorkerLink::channel(&config.exchange);
    let link = WorkerLink::spawn(
        config.exchange.clone(),
        samples,
        Arc::clone(&weights),
        Arc::clone(shutdown),
    )?;

    let mut worker = RolloutWorker::new(
        config.worker.clone(),
        env,
        actor,
        weights,
        config.device.resolve_ndarray(),
    )?
    .with_sink(sink);
    let result = worker.run(shutdown);
    // dropping the worker closes the channel so the link flushes and exits
    drop(worker);
    let link_stats = link.join();

    let stats = result?;
    log::info!(
        "Worker stopped: {} steps, {} episodes, {} sent to link, {} dropped, {} transitions pushed",
        stats.steps,
        stats.episodes,
        stats.sent,
        stats.dropped,
        link_stats.samples_sent
    );
    Ok(())
}

fn run_trainer(config: &NodeConfig, cli: &Cli, shutdown: &Arc<AtomicBool>) -> anyhow::Result<()> {
    log::info!("Role: trainer <- {}", config.exchange.address);
    let device = config.device.resolve_ndarray();
    let env = Pendulum::new(&config.env);
    let schema = env.schema().clone();
    let action_dim = env.action_dim();

    let factory = config.sac.model.resolve();
    let model = ModelFactory::<TrainBackend>::build(&factory, &schema, action_dim, config.sac.num_critics, &device)?;
    let (actor_optim, critic_optim) =
        create_optimizers::<TrainBackend, MlpActor<TrainBackend>, MlpCritic<TrainBackend>>(&config.sac);
    let memory = Arc::new(match config.sac.seed {
        Some(seed) => ReplayMemory::with_seed(config.sac.memory_size, seed),
        None => ReplayMemory::new(config.sac.memory_size),
    });
    let learner = Learner::new(
        config.sac.clone(),
        schema,
        action_dim,
        model,
        actor_optim,
        critic_optim,
        Arc::clone(&memory),
        device,
    )?;

    let mut logger = MultiLogger::new().add(ConsoleLogger::new());
    if !cli.no_csv {
        let path = config.csv_path.clone().unwrap_or_else(|| PathBuf::from("metrics.csv"));
        logger = logger.add(CsvLogger::new(&path).with_context(|| format!("creating {}", path.display()))?);
    }

    // versions stay above anything workers saw from an earlier trainer, even
    // when the relay was restarted too
    let weights = Arc::new(WeightSlot::starting_after(clock_floor()));
    let link = TrainerLink::spawn(
        config.exchange.clone(),
        memory,
        Arc::clone(&weights),
        Arc::clone(shutdown),
    )?;

    let mut trainer = Trainer::new(config.trainer.clone(), learner, weights, Box::new(logger))?;
    if let Some(step) = trainer.resume()? {
        log::info!("Resumed from step {}", step);
    }
    let result = trainer.run(shutdown);
    let link_stats = link.stop();
    let report = result?;
    log::info!(
        "Trainer done: {} steps, actor version {}, {} transitions received",
        report.steps,
        report.weights_version,
        link_stats.samples_received
    );
    Ok(())
}

/// Milliseconds since the Unix epoch, 0 if the clock is set before it.
fn clock_floor() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

fn run_test(config: &NodeConfig, episodes: usize, shutdown: &AtomicBool) -> anyhow::Result<()> {
    log::info!("Role: test ({} episodes)", episodes);
    let env = config.env();
    let actor = fresh_actor(config, env.as_ref())?;
    let weights = weight_slot();

    let mut conn = Connection::new(&config.exchange);
    let mut backoff = config.exchange.retry.backoff();
    match conn.request_with_retry(&Request::PullWeights { known_version: 0 }, &mut backoff, shutdown)? {
        Response::Weights(Some(snapshot)) => {
            log::info!("Evaluating actor version {}", snapshot.version);
            weights.install(snapshot);
        }
        Response::Weights(None) => log::warn!("Relay has no actor yet, evaluating a fresh one"),
        other => anyhow::bail!("unexpected relay reply: {:?}", other),
    }

    let worker_config = config
        .worker
        .clone()
        .with_train(false)
        .with_action_mode(ActionMode::Deterministic);
    let mut worker = RolloutWorker::new(worker_config, env, actor, weights, config.device.resolve_ndarray())?;
    let returns = worker.run_test_episodes(episodes, shutdown)?;
    if !returns.is_empty() {
        let mean = returns.iter().sum::<f32>() / returns.len() as f32;
        log::info!("Mean return over {} episodes: {:.3}", returns.len(), mean);
    }
    Ok(())
}

fn run_benchmark(config: &NodeConfig, steps: u64, shutdown: &AtomicBool) -> anyhow::Result<()> {
    log::info!("Role: benchmark ({} steps)", steps);
    let env = config.env();
    let actor = fresh_actor(config, env.as_ref())?;
    let worker_config = config.worker.clone().with_train(false);
    let mut worker = RolloutWorker::new(worker_config, env, actor, weight_slot(), config.device.resolve_ndarray())?;
    let report = worker.run_env_benchmark(steps, shutdown)?;
    log::info!("{}", report);
    Ok(())
}
