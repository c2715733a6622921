//! Exchange channel between workers and the trainer.
//!
//! Two independent flows share one transport:
//!
//! - experience: worker → relay → trainer memory, batched, at-least-once
//! - weights: trainer → relay → workers, whole snapshots, newest wins
//!
//! Acting and learning loops only ever touch a channel or a weight slot;
//! all blocking, reconnecting and retrying happens on link threads.

pub mod client;
pub mod config;
pub mod local;
pub mod protocol;
pub mod retry;
pub mod server;

pub use client::{Connection, LinkStats, TrainerLink, WorkerLink};
pub use config::ExchangeConfig;
pub use local::LocalRelay;
pub use protocol::{read_frame, write_frame, ExchangeError, Request, Response};
pub use retry::{sleep_unless, Backoff, RetryConfig};
pub use server::{RelayServer, RelayState, RelayStats};
