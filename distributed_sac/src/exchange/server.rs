//! TCP relay between workers and the trainer.
//!
//! ```text
//!  worker links ──PushSamples──┐                 ┌──PullSamples── trainer link
//!                              ▼                 │
//!                      pending FIFO (bounded) ───┘  removed once the reply is written
//!  worker links ──PullWeights──> WeightSlot <──PushWeights── trainer link
//! ```
//!
//! One accept thread plus one thread per connection. All shared state lives in
//! [`RelayState`], which serializes writers through a single mutex so
//! concurrent pushes never lose transitions.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::config::ExchangeConfig;
use super::protocol::{read_frame_body, read_frame_len, write_frame, ExchangeError, Request, Response};
use crate::core::transition::Transition;
use crate::core::weight_slot::{weight_slot, SharedWeightSlot};

/// How often idle server threads look at the shutdown flag.
const POLL: Duration = Duration::from_millis(50);

/// Relay counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub received: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub pending: usize,
    pub weights_version: u64,
}

/// Pending transitions plus the sequence number of the front one.
///
/// `head` counts every transition that ever left the front, whether it was
/// delivered or dropped on overflow, so an in-flight pull can tell which of
/// its transitions are still queued when it commits.
#[derive(Default)]
struct Backlog {
    items: VecDeque<Transition>,
    head: u64,
}

impl Backlog {
    fn pop_front_n(&mut self, n: usize) {
        let n = n.min(self.items.len());
        self.items.drain(..n);
        self.head += n as u64;
    }
}

/// Transitions copied out for one pull, still queued until committed.
struct PendingPull {
    start: u64,
    batch: Vec<Transition>,
}

/// Shared relay state: pending transitions and the latest weights.
pub struct RelayState {
    pending: Mutex<Backlog>,
    /// Held from peek to commit so two pullers never get the same transitions.
    pulling: Mutex<()>,
    max_pending: usize,
    max_pull: usize,
    max_frame_bytes: usize,
    weights: SharedWeightSlot,
    received: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl RelayState {
    pub fn new(max_pending: usize, max_pull: usize, max_frame_bytes: usize) -> Self {
        Self {
            pending: Mutex::new(Backlog::default()),
            pulling: Mutex::new(()),
            max_pending: max_pending.max(1),
            max_pull: max_pull.max(1),
            max_frame_bytes,
            weights: weight_slot(),
            received: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &ExchangeConfig) -> Self {
        Self::new(config.max_pending_samples, config.max_pull_samples, config.max_frame_bytes)
    }

    /// The relay's weight slot.
    pub fn weights(&self) -> &SharedWeightSlot {
        &self.weights
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            pending: self.pending.lock().items.len(),
            weights_version: self.weights.version(),
        }
    }

    /// Serve one request in memory.
    ///
    /// A `PullSamples` served here is committed at once; the socket path goes
    /// through [`respond`](Self::respond) instead.
    pub fn handle(&self, request: Request) -> Response {
        match request {
            Request::PushSamples(batch) => {
                let accepted = batch.len();
                let mut pending = self.pending.lock();
                pending.items.extend(batch);
                let overflow = pending.items.len().saturating_sub(self.max_pending);
                pending.pop_front_n(overflow);
                drop(pending);

                self.received.fetch_add(accepted as u64, Ordering::Relaxed);
                if overflow > 0 {
                    self.dropped.fetch_add(overflow as u64, Ordering::Relaxed);
                    log::warn!("Relay backlog full, dropped {} oldest transitions", overflow);
                }
                Response::Ack { accepted }
            }
            Request::PullSamples { max } => {
                let _pulling = self.pulling.lock();
                let pull = self.peek_samples(max);
                self.commit_samples(pull.start, pull.batch.len());
                Response::Samples(pull.batch)
            }
            Request::PushWeights(snapshot) => {
                let offered = snapshot.version;
                let installed = self.weights.install(snapshot);
                if installed {
                    log::debug!("Relay installed weights version {}", offered);
                }
                Response::WeightsAck {
                    installed,
                    version: self.weights.version(),
                }
            }
            Request::PullWeights { known_version } => {
                Response::Weights(self.weights.newer_than(known_version).map(|s| (*s).clone()))
            }
        }
    }

    /// Serve one request and write its reply.
    ///
    /// Pulled transitions leave the backlog only after the reply frame has been
    /// written, so a failed or oversized write loses nothing.
    pub fn respond<W: Write>(&self, request: Request, writer: &mut W) -> Result<(), ExchangeError> {
        match request {
            Request::PullSamples { max } => {
                let _pulling = self.pulling.lock();
                let pull = self.peek_samples(max);
                let count = pull.batch.len();
                write_frame(writer, &Response::Samples(pull.batch), self.max_frame_bytes)?;
                self.commit_samples(pull.start, count);
                Ok(())
            }
            other => write_frame(writer, &self.handle(other), self.max_frame_bytes),
        }
    }

    /// Copy the oldest transitions that fit in one reply frame.
    fn peek_samples(&self, max: usize) -> PendingPull {
        let limit = max.min(self.max_pull);
        let mut budget = self.max_frame_bytes.saturating_sub(samples_envelope());
        let mut pending = self.pending.lock();
        let mut batch = Vec::new();

        while batch.len() < limit {
            let Some(t) = pending.items.get(batch.len()) else {
                break;
            };
            let size = bincode::serialized_size(t).map_or(usize::MAX, |s| s as usize);
            if size <= budget {
                budget -= size;
                batch.push(t.clone());
            } else if batch.is_empty() {
                // can never be delivered, and would block everything behind it
                pending.pop_front_n(1);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Relay dropped a {} byte transition that exceeds the {} byte frame limit",
                    size,
                    self.max_frame_bytes
                );
            } else {
                break;
            }
        }
        PendingPull {
            start: pending.head,
            batch,
        }
    }

    /// Remove a delivered pull from the backlog.
    ///
    /// Transitions already pushed out by overflow since the peek are skipped.
    fn commit_samples(&self, start: u64, count: usize) {
        let mut pending = self.pending.lock();
        let end = start + count as u64;
        let still_queued = end.saturating_sub(pending.head) as usize;
        pending.pop_front_n(still_queued);
        drop(pending);
        self.delivered.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Encoded size of an empty `Samples` reply.
fn samples_envelope() -> usize {
    bincode::serialized_size(&Response::Samples(Vec::new())).map_or(0, |s| s as usize)
}

/// Running relay server.
pub struct RelayServer {
    local_addr: SocketAddr,
    state: Arc<RelayState>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RelayServer {
    /// Bind `config.address` and start serving.
    pub fn bind(config: &ExchangeConfig) -> Result<Self, ExchangeError> {
        let listener = TcpListener::bind(&config.address)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let state = Arc::new(RelayState::from_config(config));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread = {
            let state = Arc::clone(&state);
            let shutdown = Arc::clone(&shutdown);
            let max_frame = config.max_frame_bytes;
            let io_timeout = config.io_timeout();
            std::thread::Builder::new()
                .name("relay-accept".to_string())
                .spawn(move || accept_loop(listener, state, shutdown, max_frame, io_timeout))?
        };

        log::info!("Relay listening on {}", local_addr);
        Ok(Self {
            local_addr,
            state,
            shutdown,
            thread: Some(thread),
        })
    }

    /// Actual bound address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &Arc<RelayState> {
        &self.state
    }

    pub fn stats(&self) -> RelayStats {
        self.state.stats()
    }

    /// Block until `external` is raised, then stop.
    pub fn serve_until(mut self, external: &AtomicBool) {
        while !external.load(Ordering::Relaxed) {
            std::thread::sleep(POLL);
        }
        self.stop();
    }

    /// Stop accepting and wait for the accept thread.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Relay accept thread panicked");
            }
        }
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    state: Arc<RelayState>,
    shutdown: Arc<AtomicBool>,
    max_frame: usize,
    io_timeout: Duration,
) {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                log::info!("Relay: connection from {}", peer);
                let state = Arc::clone(&state);
                let shutdown = Arc::clone(&shutdown);
                let spawned = std::thread::Builder::new()
                    .name(format!("relay-{}", peer))
                    .spawn(move || {
                        match serve_connection(stream, &state, &shutdown, max_frame, io_timeout) {
                            Ok(()) | Err(ExchangeError::Disconnected) => {
                                log::info!("Relay: {} disconnected", peer)
                            }
                            Err(e) => log::warn!("Relay: connection {} closed: {}", peer, e),
                        }
                    });
                match spawned {
                    Ok(handle) => connections.push(handle),
                    Err(e) => log::error!("Relay: cannot spawn connection thread: {}", e),
                }
                connections.retain(|handle| !handle.is_finished());
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::sleep(POLL),
            Err(e) => {
                log::warn!("Relay: accept failed: {}", e);
                std::thread::sleep(POLL);
            }
        }
    }
    for handle in connections {
        let _ = handle.join();
    }
}

fn serve_connection(
    mut stream: TcpStream,
    state: &RelayState,
    shutdown: &AtomicBool,
    max_frame: usize,
    io_timeout: Duration,
) -> Result<(), ExchangeError> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_write_timeout(Some(io_timeout))?;

    while !shutdown.load(Ordering::Relaxed) {
        // short timeout between requests so shutdown is noticed
        stream.set_read_timeout(Some(POLL))?;
        let Some(len) = read_frame_len(&mut stream, max_frame)? else {
            continue;
        };
        stream.set_read_timeout(Some(io_timeout))?;
        let request: Request = read_frame_body(&mut stream, len)?;
        state.respond(request, &mut stream)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::observation::Observation;
    use crate::core::weight_slot::WeightSnapshot;
    use crate::exchange::protocol::read_frame;
    use std::io::Cursor;

    fn batch(range: std::ops::Range<usize>) -> Vec<Transition> {
        range
            .map(|i| {
                Transition::new(
                    Observation::vector(vec![i as f32]),
                    vec![0.0],
                    i as f32,
                    Observation::vector(vec![i as f32 + 1.0]),
                    false,
                )
            })
            .collect()
    }

    fn rewards(response: Response) -> Vec<f32> {
        match response {
            Response::Samples(samples) => samples.iter().map(|t| t.reward).collect(),
            other => panic!("expected samples, got {:?}", other),
        }
    }

    #[test]
    fn test_push_then_pull_preserves_order() {
        let state = RelayState::new(100, 100, 1 << 20);
        assert_eq!(state.handle(Request::PushSamples(batch(0..5))), Response::Ack { accepted: 5 });

        assert_eq!(rewards(state.handle(Request::PullSamples { max: 3 })), vec![0.0, 1.0, 2.0]);
        assert_eq!(rewards(state.handle(Request::PullSamples { max: 10 })), vec![3.0, 4.0]);
        assert!(rewards(state.handle(Request::PullSamples { max: 10 })).is_empty());

        let stats = state.stats();
        assert_eq!(stats.received, 5);
        assert_eq!(stats.delivered, 5);
    }

    #[test]
    fn test_backlog_drops_oldest() {
        let state = RelayState::new(4, 100, 1 << 20);
        state.handle(Request::PushSamples(batch(0..3)));
        state.handle(Request::PushSamples(batch(3..6)));

        assert_eq!(state.stats().dropped, 2);
        assert_eq!(rewards(state.handle(Request::PullSamples { max: 10 })), vec![2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_pull_is_capped() {
        let state = RelayState::new(100, 2, 1 << 20);
        state.handle(Request::PushSamples(batch(0..5)));
        assert_eq!(rewards(state.handle(Request::PullSamples { max: 100 })).len(), 2);
    }

    #[test]
    fn test_weights_only_when_newer() {
        let state = RelayState::new(10, 10, 1 << 20);
        assert_eq!(
            state.handle(Request::PullWeights { known_version: 0 }),
            Response::Weights(None)
        );

        let snapshot = WeightSnapshot {
            version: 3,
            actor: vec![7; 8],
        };
        assert_eq!(
            state.handle(Request::PushWeights(snapshot.clone())),
            Response::WeightsAck {
                installed: true,
                version: 3
            }
        );
        // stale publish is ignored, and the reply says what the relay holds
        assert_eq!(
            state.handle(Request::PushWeights(WeightSnapshot {
                version: 2,
                actor: vec![]
            })),
            Response::WeightsAck {
                installed: false,
                version: 3
            }
        );

        assert_eq!(
            state.handle(Request::PullWeights { known_version: 0 }),
            Response::Weights(Some(snapshot))
        );
        assert_eq!(
            state.handle(Request::PullWeights { known_version: 3 }),
            Response::Weights(None)
        );
    }

    #[test]
    fn test_concurrent_pushes_lose_nothing() {
        let state = Arc::new(RelayState::new(100_000, 100_000, 1 << 20));
        let handles: Vec<_> = (0..4)
            .map(|w| {
                let state = Arc::clone(&state);
                std::thread::spawn(move || {
                    for chunk in 0..25 {
                        let start = w * 1000 + chunk * 10;
                        state.handle(Request::PushSamples(batch(start..start + 10)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(state.stats().pending, 1000);
        assert_eq!(state.stats().received, 1000);
    }

    /// Size of a `Samples` reply carrying `n` transitions from `batch`.
    fn reply_size(n: usize) -> usize {
        bincode::serialized_size(&Response::Samples(batch(0..n))).unwrap() as usize
    }

    fn decode_samples(bytes: Vec<u8>) -> Vec<f32> {
        rewards(read_frame(&mut Cursor::new(bytes), 1 << 20).unwrap())
    }

    #[test]
    fn test_pull_fits_frame_limit() {
        // room for three transitions per reply
        let state = RelayState::new(100, 10_000, reply_size(3));
        state.handle(Request::PushSamples(batch(0..10)));

        let mut seen = Vec::new();
        for _ in 0..4 {
            let mut wire = Vec::new();
            state.respond(Request::PullSamples { max: 10_000 }, &mut wire).unwrap();
            let got = decode_samples(wire);
            assert!(got.len() <= 3);
            seen.extend(got);
        }
        assert_eq!(seen, (0..10).map(|i| i as f32).collect::<Vec<_>>());

        let stats = state.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.delivered, 10);
        assert_eq!(stats.dropped, 0);
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer went away"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_reply_keeps_transitions() {
        let state = RelayState::new(100, 100, 1 << 20);
        state.handle(Request::PushSamples(batch(0..5)));

        let result = state.respond(Request::PullSamples { max: 100 }, &mut BrokenPipe);
        assert!(matches!(result, Err(ExchangeError::Disconnected)));
        assert_eq!(state.stats().pending, 5);
        assert_eq!(state.stats().delivered, 0);

        let mut wire = Vec::new();
        state.respond(Request::PullSamples { max: 100 }, &mut wire).unwrap();
        assert_eq!(decode_samples(wire), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(state.stats().pending, 0);
    }

    /// Pushes more transitions while the pull reply is being written.
    struct PushDuringWrite<'a> {
        state: &'a RelayState,
        extra: Option<Vec<Transition>>,
        wire: Vec<u8>,
    }

    impl Write for PushDuringWrite<'_> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(extra) = self.extra.take() {
                self.state.handle(Request::PushSamples(extra));
            }
            self.wire.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_overflow_during_pull_keeps_new_transitions() {
        let state = RelayState::new(4, 100, 1 << 20);
        state.handle(Request::PushSamples(batch(0..4)));

        let mut writer = PushDuringWrite {
            state: &state,
            extra: Some(batch(4..6)),
            wire: Vec::new(),
        };
        state.respond(Request::PullSamples { max: 100 }, &mut writer).unwrap();
        assert_eq!(decode_samples(writer.wire), vec![0.0, 1.0, 2.0, 3.0]);

        // 0 and 1 were pushed out by overflow mid-pull; only the new ones remain
        assert_eq!(rewards(state.handle(Request::PullSamples { max: 100 })), vec![4.0, 5.0]);
        assert_eq!(state.stats().pending, 0);
    }

    #[test]
    fn test_oversized_transition_is_skipped() {
        let state = RelayState::new(100, 100, reply_size(1));
        let mut big = batch(0..1);
        big[0].action = vec![0.0; 64];
        state.handle(Request::PushSamples(big));
        state.handle(Request::PushSamples(batch(1..2)));

        assert_eq!(rewards(state.handle(Request::PullSamples { max: 100 })), vec![1.0]);
        assert_eq!(state.stats().dropped, 1);
    }

    #[test]
    fn test_small_frames_lose_nothing_over_tcp() {
        let one = reply_size(1);
        let config = ExchangeConfig {
            max_frame_bytes: 8 * one,
            ..ExchangeConfig::new("127.0.0.1:0")
        };
        let server = RelayServer::bind(&config).unwrap();
        let mut conn = crate::exchange::client::Connection::new(&ExchangeConfig {
            address: server.local_addr().to_string(),
            ..config
        });

        for chunk in 0..10 {
            let pushed = conn
                .request(&Request::PushSamples(batch(chunk * 5..chunk * 5 + 5)))
                .unwrap();
            assert_eq!(pushed, Response::Ack { accepted: 5 });
        }

        let mut seen = Vec::new();
        while seen.len() < 50 {
            match conn.request(&Request::PullSamples { max: 10_000 }).unwrap() {
                Response::Samples(got) => {
                    assert!(!got.is_empty());
                    seen.extend(got.iter().map(|t| t.reward));
                }
                other => panic!("expected samples, got {:?}", other),
            }
        }
        assert_eq!(seen, (0..50).map(|i| i as f32).collect::<Vec<_>>());
        assert_eq!(server.stats().delivered, 50);
        assert_eq!(server.stats().pending, 0);
    }
}
