//! Versioned actor weight snapshots.
//!
//! The trainer serializes a fully committed copy of its actor into bytes and
//! publishes it here. Readers (the relay, worker links, in-process workers)
//! only ever see whole snapshots: the slot swaps an `Arc` under a lock, so a
//! reader holds either the previous snapshot or the new one, never a mix.
//!
//! ```text
//! Trainer                                     Worker
//! ┌──────────────────┐                        ┌──────────────────┐
//! │ actor.valid()    │                        │ load_record()    │
//! │       ↓          │                        │       ↑          │
//! │ snapshot_bytes() │                        │ load_snapshot()  │
//! │       ↓          │                        │       ↑          │
//! │   Vec<u8>  ─────────── WeightSlot ──────────→ Arc<Snapshot>  │
//! └──────────────────┘      (version)         └──────────────────┘
//! ```

use burn::module::Module;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::Backend;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Serialized actor parameters tagged with a publish version.
///
/// Holds no optimizer state and no gradients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightSnapshot {
    /// Monotonic publish counter.
    pub version: u64,
    /// Actor record encoded with full precision.
    pub actor: Vec<u8>,
}

/// Failure to encode or decode a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightError(pub String);

impl std::fmt::Display for WeightError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Weight snapshot error: {}", self.0)
    }
}

impl std::error::Error for WeightError {}

/// Encode a module's parameters (bit-exact f32).
pub fn snapshot_bytes<B: Backend, M: Module<B>>(module: &M) -> Result<Vec<u8>, WeightError> {
    BinBytesRecorder::<FullPrecisionSettings>::default()
        .record(module.clone().into_record(), ())
        .map_err(|e| WeightError(e.to_string()))
}

/// Decode snapshot bytes into a module of the same architecture.
///
/// On failure the template is dropped and the caller keeps whatever module it
/// was acting with before.
pub fn load_snapshot<B: Backend, M: Module<B>>(
    template: M,
    bytes: &[u8],
    device: &B::Device,
) -> Result<M, WeightError> {
    let record = BinBytesRecorder::<FullPrecisionSettings>::default()
        .load(bytes.to_vec(), device)
        .map_err(|e| WeightError(e.to_string()))?;
    Ok(template.load_record(record))
}

/// Thread-safe holder of the latest weight snapshot.
pub struct WeightSlot {
    latest: Mutex<Option<Arc<WeightSnapshot>>>,
    version: AtomicU64,
}

impl WeightSlot {
    /// Create an empty slot (version 0).
    pub fn new() -> Self {
        Self::starting_after(0)
    }

    /// Create an empty slot whose first publish gets version `floor + 1`.
    pub fn starting_after(floor: u64) -> Self {
        Self {
            latest: Mutex::new(None),
            version: AtomicU64::new(floor),
        }
    }

    /// Version of the latest snapshot, or the starting floor when empty.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Publish freshly encoded weights under the next version.
    ///
    /// Returns the assigned version.
    pub fn publish(&self, actor: Vec<u8>) -> u64 {
        let mut guard = self.latest.lock();
        let version = self.version.load(Ordering::Acquire) + 1;
        *guard = Some(Arc::new(WeightSnapshot { version, actor }));
        self.version.store(version, Ordering::Release);
        version
    }

    /// Install a snapshot received from elsewhere, keeping its version.
    ///
    /// Older or equal versions are ignored. Returns whether it was installed.
    pub fn install(&self, snapshot: WeightSnapshot) -> bool {
        let mut guard = self.latest.lock();
        if snapshot.version <= self.version.load(Ordering::Acquire) {
            return false;
        }
        let version = snapshot.version;
        *guard = Some(Arc::new(snapshot));
        self.version.store(version, Ordering::Release);
        true
    }

    /// Re-issue the latest snapshot under version `floor + 1`.
    ///
    /// For a peer that already holds versions up to `floor` from an earlier
    /// publisher. Returns `None` when the slot is empty or already above
    /// `floor`; later publishes continue from the new version.
    pub fn republish_above(&self, floor: u64) -> Option<u64> {
        let mut guard = self.latest.lock();
        if self.version.load(Ordering::Acquire) > floor {
            return None;
        }
        let actor = guard.as_ref()?.actor.clone();
        let version = floor + 1;
        *guard = Some(Arc::new(WeightSnapshot { version, actor }));
        self.version.store(version, Ordering::Release);
        Some(version)
    }

    /// Latest snapshot, if any.
    pub fn latest(&self) -> Option<Arc<WeightSnapshot>> {
        self.latest.lock().clone()
    }

    /// Latest snapshot only if it is newer than `known_version`.
    pub fn newer_than(&self, known_version: u64) -> Option<Arc<WeightSnapshot>> {
        if self.version() <= known_version {
            return None;
        }
        self.latest
            .lock()
            .as_ref()
            .filter(|s| s.version > known_version)
            .cloned()
    }
}

impl Default for WeightSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe shared weight slot.
pub type SharedWeightSlot = Arc<WeightSlot>;

/// Create a new shared weight slot.
pub fn weight_slot() -> SharedWeightSlot {
    Arc::new(WeightSlot::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::nn::{Linear, LinearConfig};

    type B = NdArray<f32>;

    #[test]
    fn test_publish_bumps_version() {
        let slot = WeightSlot::new();
        assert_eq!(slot.version(), 0);
        assert!(slot.latest().is_none());

        assert_eq!(slot.publish(vec![1, 2, 3]), 1);
        assert_eq!(slot.publish(vec![4]), 2);
        let latest = slot.latest().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.actor, vec![4]);
    }

    #[test]
    fn test_newer_than() {
        let slot = weight_slot();
        assert!(slot.newer_than(0).is_none());
        slot.publish(vec![9]);
        assert_eq!(slot.newer_than(0).map(|s| s.version), Some(1));
        assert!(slot.newer_than(1).is_none());
    }

    #[test]
    fn test_install_ignores_stale() {
        let slot = WeightSlot::new();
        assert!(slot.install(WeightSnapshot { version: 5, actor: vec![5] }));
        assert!(!slot.install(WeightSnapshot { version: 3, actor: vec![3] }));
        assert!(!slot.install(WeightSnapshot { version: 5, actor: vec![0] }));
        assert_eq!(slot.latest().unwrap().actor, vec![5]);
        assert_eq!(slot.publish(vec![6]), 6);
    }

    #[test]
    fn test_republish_above_peer_version() {
        let slot = WeightSlot::new();
        assert_eq!(slot.republish_above(5), None);

        slot.publish(vec![1]);
        slot.publish(vec![2]);
        assert_eq!(slot.republish_above(5), Some(6));
        let latest = slot.latest().unwrap();
        assert_eq!(latest.version, 6);
        assert_eq!(latest.actor, vec![2]);

        assert_eq!(slot.publish(vec![3]), 7);
        assert_eq!(slot.republish_above(3), None);
        assert_eq!(slot.latest().unwrap().actor, vec![3]);
    }

    #[test]
    fn test_starting_after_floor() {
        let slot = WeightSlot::starting_after(100);
        assert_eq!(slot.version(), 100);
        assert!(slot.latest().is_none());
        assert!(slot.newer_than(0).is_none());
        assert_eq!(slot.publish(vec![1]), 101);
        assert_eq!(slot.newer_than(100).map(|s| s.version), Some(101));
    }

    #[test]
    fn test_snapshot_round_trip_is_bit_exact() {
        let device = Default::default();
        let source: Linear<B> = LinearConfig::new(3, 2).init(&device);
        let bytes = snapshot_bytes(&source).unwrap();

        let template: Linear<B> = LinearConfig::new(3, 2).init(&device);
        let loaded = load_snapshot(template, &bytes, &device).unwrap();

        let a = source.weight.val().into_data().to_vec::<f32>().unwrap();
        let b = loaded.weight.val().into_data().to_vec::<f32>().unwrap();
        let a_bits: Vec<u32> = a.iter().map(|x| x.to_bits()).collect();
        let b_bits: Vec<u32> = b.iter().map(|x| x.to_bits()).collect();
        assert_eq!(a_bits, b_bits);
    }

    #[test]
    fn test_load_garbage_fails() {
        let device = Default::default();
        let template: Linear<B> = LinearConfig::new(3, 2).init(&device);
        assert!(load_snapshot(template, &[0xde, 0xad], &device).is_err());
    }
}
