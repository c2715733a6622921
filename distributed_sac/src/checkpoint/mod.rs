//! Training checkpoints.
//!
//! Each checkpoint is a directory `checkpoint_<step>/` written by a
//! [`Checkpointable`] component (for the SAC learner: networks, target
//! networks, optimizer state and return statistics). The [`Checkpointer`]
//! decides when to save, names and rotates directories, and finds the latest
//! one on resume.
//!
//! ```rust,ignore
//! let config = CheckpointerConfig::new("./checkpoints")
//!     .with_save_interval(10_000)
//!     .with_keep_last_n(5);
//! let mut checkpointer = Checkpointer::new(config)?;
//!
//! if checkpointer.should_save(step) {
//!     checkpointer.save(&learner, step)?;
//! }
//!
//! // on restart
//! let step = checkpointer.restore_latest(&mut learner)?;
//! ```

pub mod checkpointer;

pub use checkpointer::{
    CheckpointError, CheckpointInfo, Checkpointable, Checkpointer, CheckpointerConfig,
};
