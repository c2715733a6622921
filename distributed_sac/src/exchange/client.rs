//! Client side of the relay: a reconnecting connection and the two link
//! threads that keep network I/O off the acting and learning loops.
//!
//! - [`WorkerLink`]: drains the worker's transition channel in batches of
//!   `samples_per_push` and polls for newer actor weights.
//! - [`TrainerLink`]: publishes the trainer's weight slot when its version
//!   moves and pulls pending transitions into replay memory. A snapshot the
//!   relay refuses as stale is renumbered above the relay's version and sent
//!   again, so a restarted trainer reaches workers right away.
//!
//! Both links retry failed requests with exponential backoff and hold on to
//! whatever they have not delivered yet.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::config::ExchangeConfig;
use super::protocol::{read_frame, write_frame, ExchangeError, Request, Response};
use super::retry::{sleep_unless, Backoff};
use crate::core::replay_memory::SharedReplayMemory;
use crate::core::transition::Transition;
use crate::core::weight_slot::SharedWeightSlot;

/// Lazily (re)connected request/response stream to the relay.
pub struct Connection {
    address: String,
    io_timeout: Duration,
    max_frame_bytes: usize,
    stream: Option<TcpStream>,
}

impl Connection {
    pub fn new(config: &ExchangeConfig) -> Self {
        Self {
            address: config.address.clone(),
            io_timeout: config.io_timeout(),
            max_frame_bytes: config.max_frame_bytes,
            stream: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn connect(&self) -> Result<TcpStream, ExchangeError> {
        let addrs: Vec<SocketAddr> = self.address.to_socket_addrs()?.collect();
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.io_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(Some(self.io_timeout))?;
                    stream.set_write_timeout(Some(self.io_timeout))?;
                    log::debug!("Connected to relay at {}", addr);
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => e.into(),
            None => ExchangeError::Protocol(format!("address {} did not resolve", self.address)),
        })
    }

    /// Send one request and wait for its response.
    ///
    /// Any failure drops the socket; the next call reconnects.
    pub fn request(&mut self, request: &Request) -> Result<Response, ExchangeError> {
        let result = self.round_trip(request);
        if result.is_err() {
            self.stream = None;
        }
        match result? {
            Response::Error(message) => Err(ExchangeError::Protocol(message)),
            response => Ok(response),
        }
    }

    fn round_trip(&mut self, request: &Request) -> Result<Response, ExchangeError> {
        let stream = match self.stream.take() {
            Some(stream) => stream,
            None => self.connect()?,
        };
        let stream = self.stream.insert(stream);
        write_frame(stream, request, self.max_frame_bytes)?;
        read_frame(stream, self.max_frame_bytes)
    }

    /// [`request`](Self::request) until it succeeds or `shutdown` is raised.
    ///
    /// A request too large to ever fit in a frame is returned immediately.
    pub fn request_with_retry(
        &mut self,
        request: &Request,
        backoff: &mut Backoff,
        shutdown: &AtomicBool,
    ) -> Result<Response, ExchangeError> {
        loop {
            match self.request(request) {
                Ok(response) => {
                    backoff.reset();
                    return Ok(response);
                }
                Err(e @ ExchangeError::FrameTooLarge { .. }) => return Err(e),
                Err(e) => {
                    let delay = backoff.next_delay();
                    log::warn!(
                        "Relay request failed ({}), retry {} in {:?}",
                        e,
                        backoff.attempts(),
                        delay
                    );
                    if !sleep_unless(shutdown, delay) {
                        return Err(ExchangeError::Cancelled);
                    }
                }
            }
        }
    }
}

/// Link counters reported when a link thread exits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub samples_sent: u64,
    pub samples_received: u64,
    pub weights_sent: u64,
    pub weights_received: u64,
}

/// Worker-side link thread.
pub struct WorkerLink {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<LinkStats>>,
}

impl WorkerLink {
    /// Channel between a worker's acting loop and its link.
    pub fn channel(config: &ExchangeConfig) -> (Sender<Transition>, Receiver<Transition>) {
        bounded(config.worker_queue.max(1))
    }

    /// Start the link. Newer weights are installed into `weights`.
    ///
    /// The link exits when `shutdown` is raised or every sender of `samples`
    /// is dropped, after one last attempt to flush its partial batch.
    pub fn spawn(
        config: ExchangeConfig,
        samples: Receiver<Transition>,
        weights: SharedWeightSlot,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, ExchangeError> {
        let flag = Arc::clone(&shutdown);
        let thread = std::thread::Builder::new()
            .name("worker-link".to_string())
            .spawn(move || worker_link_loop(&config, &samples, &weights, &flag))?;
        Ok(Self {
            shutdown,
            thread: Some(thread),
        })
    }

    /// Raise the shutdown flag and wait for the thread.
    pub fn stop(mut self) -> LinkStats {
        self.shutdown.store(true, Ordering::Relaxed);
        self.join_inner()
    }

    /// Wait for the thread to exit on its own.
    pub fn join(mut self) -> LinkStats {
        self.join_inner()
    }

    fn join_inner(&mut self) -> LinkStats {
        match self.thread.take().map(JoinHandle::join) {
            Some(Ok(stats)) => stats,
            Some(Err(_)) => {
                log::error!("Worker link thread panicked");
                LinkStats::default()
            }
            None => LinkStats::default(),
        }
    }
}

fn worker_link_loop(
    config: &ExchangeConfig,
    samples: &Receiver<Transition>,
    weights: &SharedWeightSlot,
    shutdown: &AtomicBool,
) -> LinkStats {
    let mut conn = Connection::new(config);
    let mut push_backoff = config.retry.backoff();
    let mut pull_backoff = config.retry.backoff();
    let mut stats = LinkStats::default();
    let push_size = config.samples_per_push.max(1);
    let mut batch: Vec<Transition> = Vec::with_capacity(push_size);
    let mut next_poll = Instant::now();
    let mut closed = false;

    while !closed && !shutdown.load(Ordering::Relaxed) {
        let wait = next_poll
            .saturating_duration_since(Instant::now())
            .min(config.samples_poll());
        match samples.recv_timeout(wait) {
            Ok(t) => {
                batch.push(t);
                while batch.len() < push_size {
                    match samples.try_recv() {
                        Ok(t) => batch.push(t),
                        Err(_) => break,
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => closed = true,
        }

        if batch.len() >= push_size {
            match push_batch(&mut conn, &mut batch, &mut push_backoff, shutdown) {
                Ok(n) => stats.samples_sent += n as u64,
                Err(ExchangeError::Cancelled) => break,
                Err(e) => {
                    log::error!("Dropping {} transitions: {}", batch.len(), e);
                    batch.clear();
                }
            }
        }

        if Instant::now() >= next_poll {
            let request = Request::PullWeights {
                known_version: weights.version(),
            };
            // a failed poll is retried on the next tick, not in a tight loop
            match conn.request(&request) {
                Ok(Response::Weights(Some(snapshot))) => {
                    let version = snapshot.version;
                    if weights.install(snapshot) {
                        stats.weights_received += 1;
                        log::debug!("Worker link received weights version {}", version);
                    }
                    pull_backoff.reset();
                    next_poll = Instant::now() + config.weights_poll();
                }
                Ok(Response::Weights(None)) => {
                    pull_backoff.reset();
                    next_poll = Instant::now() + config.weights_poll();
                }
                Ok(other) => {
                    log::warn!("Unexpected reply to weight poll: {:?}", other);
                    next_poll = Instant::now() + config.weights_poll();
                }
                Err(e) => {
                    let delay = pull_backoff.next_delay();
                    log::warn!("Weight poll failed ({}), retry in {:?}", e, delay);
                    next_poll = Instant::now() + delay;
                }
            }
        }
    }

    if !batch.is_empty() {
        match push_batch(&mut conn, &mut batch, &mut push_backoff, shutdown) {
            Ok(n) => stats.samples_sent += n as u64,
            Err(e) => log::warn!("Final flush lost {} transitions: {}", batch.len(), e),
        }
    }
    log::info!(
        "Worker link stopped: {} transitions sent, {} weight updates",
        stats.samples_sent,
        stats.weights_received
    );
    stats
}

/// Push `batch`. On failure the transitions are put back into `batch`.
fn push_batch(
    conn: &mut Connection,
    batch: &mut Vec<Transition>,
    backoff: &mut Backoff,
    shutdown: &AtomicBool,
) -> Result<usize, ExchangeError> {
    let request = Request::PushSamples(std::mem::take(batch));
    let error = match conn.request_with_retry(&request, backoff, shutdown) {
        Ok(Response::Ack { accepted }) => return Ok(accepted),
        Ok(other) => ExchangeError::Protocol(format!("unexpected reply to push: {:?}", other)),
        Err(e) => e,
    };
    if let Request::PushSamples(unsent) = request {
        *batch = unsent;
    }
    Err(error)
}

/// Trainer-side link thread.
pub struct TrainerLink {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<LinkStats>>,
}

impl TrainerLink {
    /// Start the link: snapshots appearing in `weights` are pushed to the
    /// relay, pulled transitions are appended to `memory`.
    pub fn spawn(
        config: ExchangeConfig,
        memory: SharedReplayMemory,
        weights: SharedWeightSlot,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, ExchangeError> {
        let flag = Arc::clone(&shutdown);
        let thread = std::thread::Builder::new()
            .name("trainer-link".to_string())
            .spawn(move || trainer_link_loop(&config, &memory, &weights, &flag))?;
        Ok(Self {
            shutdown,
            thread: Some(thread),
        })
    }

    /// Raise the shutdown flag and wait for the thread.
    pub fn stop(mut self) -> LinkStats {
        self.shutdown.store(true, Ordering::Relaxed);
        match self.thread.take().map(JoinHandle::join) {
            Some(Ok(stats)) => stats,
            Some(Err(_)) => {
                log::error!("Trainer link thread panicked");
                LinkStats::default()
            }
            None => LinkStats::default(),
        }
    }
}

fn trainer_link_loop(
    config: &ExchangeConfig,
    memory: &SharedReplayMemory,
    weights: &SharedWeightSlot,
    shutdown: &AtomicBool,
) -> LinkStats {
    let mut conn = Connection::new(config);
    let mut backoff = config.retry.backoff();
    let mut stats = LinkStats::default();
    let mut published = 0u64;

    while !shutdown.load(Ordering::Relaxed) {
        if let Some(snapshot) = weights.newer_than(published) {
            match conn.request(&Request::PushWeights((*snapshot).clone())) {
                Ok(Response::WeightsAck { installed: true, .. }) => {
                    published = snapshot.version;
                    stats.weights_sent += 1;
                    backoff.reset();
                }
                Ok(Response::WeightsAck {
                    installed: false,
                    version,
                }) => {
                    // the relay outlived an earlier trainer; number past it
                    published = snapshot.version;
                    backoff.reset();
                    if let Some(next) = weights.republish_above(version) {
                        log::info!(
                            "Relay already holds version {}, republishing actor as version {}",
                            version,
                            next
                        );
                    }
                    continue;
                }
                Ok(other) => log::warn!("Unexpected reply to weight push: {:?}", other),
                Err(e) => {
                    let delay = backoff.next_delay();
                    log::warn!("Weight push failed ({}), retry in {:?}", e, delay);
                    sleep_unless(shutdown, delay);
                    continue;
                }
            }
        }

        let request = Request::PullSamples {
            max: config.max_pull_samples,
        };
        match conn.request(&request) {
            Ok(Response::Samples(batch)) => {
                backoff.reset();
                if batch.is_empty() {
                    sleep_unless(shutdown, config.samples_poll());
                } else {
                    stats.samples_received += batch.len() as u64;
                    memory.extend(batch);
                }
            }
            Ok(other) => {
                log::warn!("Unexpected reply to sample pull: {:?}", other);
                sleep_unless(shutdown, config.samples_poll());
            }
            Err(e) => {
                let delay = backoff.next_delay();
                log::warn!("Sample pull failed ({}), retry in {:?}", e, delay);
                sleep_unless(shutdown, delay);
            }
        }
    }

    log::info!(
        "Trainer link stopped: {} transitions received, {} snapshots published",
        stats.samples_received,
        stats.weights_sent
    );
    stats
}
