//! Core types shared by workers, the relay and the trainer.
//!
//! - [`observation`]: tagged observation union, its schema and batch tensors
//! - [`transition`]: one environment step as stored in memory
//! - [`replay_memory`]: thread-shared ring buffer with uniform sampling
//! - [`weight_slot`]: versioned actor snapshots (the weight flow endpoint)
//! - [`target_network`]: parameter snapshots and EMA updates

pub mod observation;
pub mod replay_memory;
pub mod target_network;
pub mod transition;
pub mod weight_slot;

pub use observation::{
    FieldSpec, FieldTensor, ObsField, Observation, ObservationBatch, ObservationSchema, SchemaError,
};
pub use replay_memory::{ReplayMemory, SharedReplayMemory};
pub use target_network::{snapshot, soft_update};
pub use transition::Transition;
pub use weight_slot::{
    load_snapshot, snapshot_bytes, weight_slot, SharedWeightSlot, WeightError, WeightSlot, WeightSnapshot,
};
