//! In-process relay: the same channel boundary as [`WorkerLink`](super::WorkerLink),
//! but transitions go straight into replay memory and workers share the
//! trainer's weight slot.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::protocol::ExchangeError;
use crate::core::replay_memory::SharedReplayMemory;
use crate::core::transition::Transition;

const DRAIN_BATCH: usize = 256;
const POLL: Duration = Duration::from_millis(20);

/// Thread moving transitions from worker channels into memory.
pub struct LocalRelay {
    shutdown: Arc<AtomicBool>,
    delivered: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl LocalRelay {
    pub fn spawn(
        samples: Receiver<Transition>,
        memory: SharedReplayMemory,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, ExchangeError> {
        let delivered = Arc::new(AtomicU64::new(0));
        let thread = {
            let shutdown = Arc::clone(&shutdown);
            let delivered = Arc::clone(&delivered);
            std::thread::Builder::new()
                .name("local-relay".to_string())
                .spawn(move || drain_loop(&samples, &memory, &shutdown, &delivered))?
        };
        Ok(Self {
            shutdown,
            delivered,
            thread: Some(thread),
        })
    }

    /// Transitions appended to memory so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Stop after draining what is already queued.
    pub fn stop(mut self) -> u64 {
        self.shutdown.store(true, Ordering::Relaxed);
        self.join_thread();
        self.delivered()
    }

    /// Wait until every sender is gone and the queue is empty.
    pub fn join(mut self) -> u64 {
        self.join_thread();
        self.delivered()
    }

    fn join_thread(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Local relay thread panicked");
            }
        }
    }
}

fn drain_loop(
    samples: &Receiver<Transition>,
    memory: &SharedReplayMemory,
    shutdown: &AtomicBool,
    delivered: &AtomicU64,
) {
    let mut batch = Vec::with_capacity(DRAIN_BATCH);
    loop {
        match samples.recv_timeout(POLL) {
            Ok(t) => {
                batch.push(t);
                batch.extend(samples.try_iter().take(DRAIN_BATCH - 1));
                delivered.fetch_add(batch.len() as u64, Ordering::Relaxed);
                memory.extend(batch.drain(..));
                if shutdown.load(Ordering::Relaxed) && samples.is_empty() {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::debug!("Local relay stopped after {} transitions", delivered.load(Ordering::Relaxed));
}
