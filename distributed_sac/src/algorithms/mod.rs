//! Learning algorithms.
//!
//! - `sac`: Soft Actor-Critic with separate reward and entropy value components

pub mod sac;
