//! PopArt return normalization for multi-component value targets.
//!
//! Critics are trained on a normalized scale. The normalizer tracks a running
//! mean and second moment per value component (reward, entropy) and maps
//! between raw and normalized units:
//!
//! ```text
//! normalize(x)     = (x - μ) / σ
//! unnormalize(v)   = v · σ + μ
//! normalize_sum(s) = (s - Σμ) / Σσ        (row-sum of all components)
//! ```
//!
//! Statistics move with
//! `β_t = max(1 / (n + 1), β)` (zero-debiased) or the fixed `β`:
//!
//! ```text
//! μ  ← (1 - β_t) μ  + β_t · mean(x)
//! ν  ← (1 - β_t) ν  + β_t · mean(x²)
//! σ  = clamp(sqrt(ν - μ²), floor, ceiling)
//! ```
//!
//! When the statistics shift, the critics' final linear layers can be
//! rescaled so their unnormalized outputs are unchanged ("preserving outputs
//! precisely"); [`ReturnNormalizer::update`] returns the [`OutputRescale`]
//! that does this.
//!
//! State lives on the host: it is a handful of floats per component, it is
//! checkpointed as JSON, and target copies follow it by EMA.

use burn::nn::Linear;
use burn::module::Param;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::core::target_network::leaf;

/// Normalizer hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Smallest statistics step size.
    pub beta: f32,
    /// Use `max(1 / (n + 1), beta)` so early statistics are unbiased.
    pub zero_debias: bool,
    /// Number of updates before output layers start being rescaled.
    pub start_pop: u64,
    /// Lower bound on σ.
    pub std_floor: f32,
    /// Upper bound on σ.
    pub std_ceiling: f32,
    /// Emit output-layer corrections from `update`.
    pub preserve_outputs: bool,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            beta: 3e-4,
            zero_debias: true,
            start_pop: 8,
            std_floor: 1e-4,
            std_ceiling: 1e6,
            preserve_outputs: true,
        }
    }
}

impl NormalizerConfig {
    /// Set the statistics step size.
    pub fn with_beta(mut self, beta: f32) -> Self {
        self.beta = beta;
        self
    }

    /// Set when output rescaling starts.
    pub fn with_start_pop(mut self, start_pop: u64) -> Self {
        self.start_pop = start_pop;
        self
    }

    /// Enable or disable output-layer rescaling.
    pub fn with_preserve_outputs(mut self, preserve: bool) -> Self {
        self.preserve_outputs = preserve;
        self
    }
}

/// Normalizer failure. Either case aborts the training step untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizerError {
    /// Input has a different component count than the normalizer.
    Components { expected: usize, found: usize },
    /// Batch statistics came out NaN or infinite.
    NonFinite { mean: Vec<f32>, std: Vec<f32> },
    /// Tensor data could not be read back.
    Data(String),
}

impl std::fmt::Display for NormalizerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NormalizerError::Components { expected, found } => {
                write!(f, "expected {} value components, got {}", expected, found)
            }
            NormalizerError::NonFinite { mean, std } => {
                write!(f, "non-finite return statistics: mean {:?}, std {:?}", mean, std)
            }
            NormalizerError::Data(e) => write!(f, "cannot read tensor data: {}", e),
        }
    }
}

impl std::error::Error for NormalizerError {}

/// Per-component affine correction for a critic's output layer.
///
/// `W ← W · scale`, `b ← b · scale + shift`, with
/// `scale = σ_old / σ_new` and `shift = (μ_old - μ_new) / σ_new`.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRescale {
    pub scale: Vec<f32>,
    pub shift: Vec<f32>,
}

impl OutputRescale {
    /// Apply to a linear layer whose outputs are the value components.
    pub fn apply<B: Backend>(&self, mut layer: Linear<B>) -> Linear<B> {
        let weight = layer.weight.val();
        let device = weight.device();
        let tracked = weight.is_require_grad();
        let n = self.scale.len();
        let scale = Tensor::<B, 1>::from_floats(self.scale.as_slice(), &device);

        let scaled = weight.detach() * scale.clone().reshape([1, n]);
        layer.weight = Param::initialized(layer.weight.id.clone(), leaf(scaled, tracked));

        if let Some(bias) = layer.bias.take() {
            let shift = Tensor::<B, 1>::from_floats(self.shift.as_slice(), &device);
            let value = bias.val();
            let tracked = value.is_require_grad();
            let moved = value.detach() * scale + shift;
            layer.bias = Some(Param::initialized(bias.id.clone(), leaf(moved, tracked)));
        }
        layer
    }
}

/// Running return statistics (PopArt).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnNormalizer {
    config: NormalizerConfig,
    mean: Vec<f32>,
    mean_square: Vec<f32>,
    std: Vec<f32>,
    updates: u64,
}

impl ReturnNormalizer {
    /// Identity normalizer over `components` values (μ = 0, σ = 1).
    pub fn new(components: usize, config: NormalizerConfig) -> Self {
        Self {
            config,
            mean: vec![0.0; components],
            mean_square: vec![1.0; components],
            std: vec![1.0; components],
            updates: 0,
        }
    }

    /// Number of value components.
    pub fn components(&self) -> usize {
        self.mean.len()
    }

    /// Running mean per component.
    pub fn mean(&self) -> &[f32] {
        &self.mean
    }

    /// Running standard deviation per component.
    pub fn std(&self) -> &[f32] {
        &self.std
    }

    /// Number of `update` calls so far.
    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Absorb a batch of raw targets `[batch, components]` and return it on the
    /// normalized scale, detached from the graph.
    ///
    /// Also returns the output-layer correction matching this shift once
    /// rescaling is active. On error no state changes.
    pub fn update<B: Backend>(
        &mut self,
        raw: Tensor<B, 2>,
    ) -> Result<(Tensor<B, 2>, Option<OutputRescale>), NormalizerError> {
        let [_, components] = raw.dims();
        if components != self.components() {
            return Err(NormalizerError::Components {
                expected: self.components(),
                found: components,
            });
        }

        let raw = raw.detach();
        let batch_mean = host_vec(raw.clone().mean_dim(0))?;
        let batch_sq = host_vec(raw.clone().powf_scalar(2.0).mean_dim(0))?;

        let beta = if self.config.zero_debias {
            (1.0 / (self.updates as f32 + 1.0)).max(self.config.beta)
        } else {
            self.config.beta
        };

        let mut mean = Vec::with_capacity(components);
        let mut mean_square = Vec::with_capacity(components);
        let mut std = Vec::with_capacity(components);
        for c in 0..components {
            let m = (1.0 - beta) * self.mean[c] + beta * batch_mean[c];
            let sq = (1.0 - beta) * self.mean_square[c] + beta * batch_sq[c];
            let s = (sq - m * m)
                .max(0.0)
                .sqrt()
                .clamp(self.config.std_floor, self.config.std_ceiling);
            mean.push(m);
            mean_square.push(sq);
            std.push(s);
        }

        if mean.iter().chain(&mean_square).chain(&std).any(|v| !v.is_finite()) {
            return Err(NormalizerError::NonFinite { mean, std });
        }

        self.updates += 1;
        let rescale = if self.config.preserve_outputs && self.updates >= self.config.start_pop {
            Some(OutputRescale {
                scale: (0..components).map(|c| self.std[c] / std[c]).collect(),
                shift: (0..components)
                    .map(|c| (self.mean[c] - mean[c]) / std[c])
                    .collect(),
            })
        } else {
            None
        };

        self.mean = mean;
        self.mean_square = mean_square;
        self.std = std;

        Ok((self.normalize(raw), rescale))
    }

    /// Raw units to normalized units, per component.
    pub fn normalize<B: Backend>(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let (mean, std) = self.row_stats(&x.device());
        (x - mean) / std
    }

    /// Normalized units back to raw units, per component.
    pub fn unnormalize<B: Backend>(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let (mean, std) = self.row_stats(&x.device());
        x * std + mean
    }

    /// Normalize a per-sample sum of all components.
    pub fn normalize_sum<B: Backend, const D: usize>(&self, sum: Tensor<B, D>) -> Tensor<B, D> {
        let mean: f32 = self.mean.iter().sum();
        let std: f32 = self.std.iter().sum();
        sum.sub_scalar(mean).div_scalar(std)
    }

    /// Move this (target) normalizer toward `online` by EMA with factor `tau`.
    ///
    /// The update counter is not averaged.
    pub fn ema_toward(&mut self, online: &ReturnNormalizer, tau: f32) {
        blend(&mut self.mean, &online.mean, tau);
        blend(&mut self.mean_square, &online.mean_square, tau);
        blend(&mut self.std, &online.std, tau);
    }

    fn row_stats<B: Backend>(&self, device: &B::Device) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let n = self.components();
        let mean = Tensor::<B, 1>::from_floats(self.mean.as_slice(), device).reshape([1, n]);
        let std = Tensor::<B, 1>::from_floats(self.std.as_slice(), device).reshape([1, n]);
        (mean, std)
    }
}

fn blend(target: &mut [f32], online: &[f32], tau: f32) {
    for (t, o) in target.iter_mut().zip(online) {
        *t = (1.0 - tau) * *t + tau * o;
    }
}

fn host_vec<B: Backend>(row: Tensor<B, 2>) -> Result<Vec<f32>, NormalizerError> {
    row.into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| NormalizerError::Data(format!("{:?}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::nn::LinearConfig;
    use burn::tensor::Distribution;

    type B = NdArray<f32>;

    fn to_vec(t: Tensor<B, 2>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    fn no_rescale() -> NormalizerConfig {
        NormalizerConfig::default().with_preserve_outputs(false)
    }

    #[test]
    fn test_starts_as_identity() {
        let device = Default::default();
        let norm = ReturnNormalizer::new(2, NormalizerConfig::default());
        let x = Tensor::<B, 2>::from_floats([[1.5, -2.0], [0.0, 3.0]], &device);
        assert_eq!(to_vec(norm.normalize(x.clone())), to_vec(x.clone()));
        assert_eq!(to_vec(norm.unnormalize(x.clone())), to_vec(x));
    }

    #[test]
    fn test_first_update_uses_batch_statistics() {
        let device = Default::default();
        let mut norm = ReturnNormalizer::new(2, no_rescale());
        let raw = Tensor::<B, 2>::from_floats([[1.0, 10.0], [3.0, 30.0]], &device);

        let (normalized, rescale) = norm.update(raw).unwrap();
        assert!(rescale.is_none());
        assert_eq!(norm.updates(), 1);
        assert!((norm.mean()[0] - 2.0).abs() < 1e-5);
        assert!((norm.mean()[1] - 20.0).abs() < 1e-4);
        assert!((norm.std()[0] - 1.0).abs() < 1e-4);
        assert!((norm.std()[1] - 10.0).abs() < 1e-3);

        let out = to_vec(normalized);
        for (got, want) in out.iter().zip([-1.0, -1.0, 1.0, 1.0]) {
            assert!((got - want).abs() < 1e-3, "got {}", got);
        }
    }

    #[test]
    fn test_std_is_floored_for_constant_targets() {
        let device = Default::default();
        let mut norm = ReturnNormalizer::new(2, no_rescale());
        let raw = Tensor::<B, 2>::from_floats([[5.0, 5.0], [5.0, 5.0]], &device);
        let (normalized, _) = norm.update(raw).unwrap();

        assert!(norm.std().iter().all(|&s| s >= 1e-4));
        assert!(to_vec(normalized).iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_rejects_wrong_component_count() {
        let device = Default::default();
        let mut norm = ReturnNormalizer::new(2, no_rescale());
        let raw = Tensor::<B, 2>::from_floats([[1.0, 2.0, 3.0]], &device);
        assert_eq!(
            norm.update(raw).unwrap_err(),
            NormalizerError::Components {
                expected: 2,
                found: 3
            }
        );
        assert_eq!(norm.updates(), 0);
    }

    #[test]
    fn test_non_finite_leaves_state_untouched() {
        let device = Default::default();
        let mut norm = ReturnNormalizer::new(2, no_rescale());
        let before = norm.clone();
        let raw = Tensor::<B, 2>::from_floats([[f32::NAN, 1.0]], &device);
        assert!(matches!(norm.update(raw), Err(NormalizerError::NonFinite { .. })));
        assert_eq!(norm, before);
    }

    #[test]
    fn test_converges_on_stationary_stream() {
        let device = Default::default();
        let mut norm = ReturnNormalizer::new(2, no_rescale());
        let mut last = None;
        for _ in 0..400 {
            let noise = Tensor::<B, 2>::random([256, 2], Distribution::Normal(0.0, 1.0), &device);
            let scale = Tensor::<B, 2>::from_floats([[2.0, 0.5]], &device);
            let shift = Tensor::<B, 2>::from_floats([[3.0, -7.0]], &device);
            let raw = noise * scale + shift;
            last = Some(norm.update(raw).unwrap().0);
        }

        let normalized = last.unwrap();
        let mean = to_vec(normalized.clone().mean_dim(0));
        let var = to_vec(normalized.var(0));
        for c in 0..2 {
            assert!(mean[c].abs() < 0.25, "component {} mean {}", c, mean[c]);
            assert!((var[c] - 1.0).abs() < 0.3, "component {} var {}", c, var[c]);
        }
        assert!((norm.mean()[0] - 3.0).abs() < 0.1);
        assert!((norm.std()[1] - 0.5).abs() < 0.05);
    }

    #[test]
    fn test_normalize_sum() {
        let device = Default::default();
        let mut norm = ReturnNormalizer::new(2, no_rescale());
        norm.mean = vec![1.0, 2.0];
        norm.std = vec![2.0, 2.0];
        let s = Tensor::<B, 1>::from_floats([7.0, 3.0], &device);
        let out = norm.normalize_sum(s).into_data().to_vec::<f32>().unwrap();
        assert_eq!(out, vec![1.0, 0.0]);
    }

    #[test]
    fn test_ema_toward() {
        let mut target = ReturnNormalizer::new(2, no_rescale());
        let mut online = ReturnNormalizer::new(2, no_rescale());
        online.mean = vec![10.0, -10.0];
        online.std = vec![3.0, 5.0];

        target.ema_toward(&online, 0.0);
        assert_eq!(target.mean(), &[0.0, 0.0]);

        target.ema_toward(&online, 0.5);
        assert_eq!(target.mean(), &[5.0, -5.0]);
        assert_eq!(target.std(), &[2.0, 3.0]);

        target.ema_toward(&online, 1.0);
        assert_eq!(target.mean(), online.mean());
    }

    #[test]
    fn test_rescale_preserves_unnormalized_output() {
        let device = Default::default();
        let config = NormalizerConfig::default().with_start_pop(1);
        let mut norm = ReturnNormalizer::new(2, config);
        let layer = LinearConfig::new(3, 2).init::<B>(&device);
        let input = Tensor::<B, 2>::random([5, 3], Distribution::Normal(0.0, 1.0), &device);

        let before = to_vec(norm.unnormalize(layer.forward(input.clone())));

        let raw = Tensor::<B, 2>::from_floats([[4.0, -1.0], [8.0, 3.0], [6.0, 1.0]], &device);
        let (_, rescale) = norm.update(raw).unwrap();
        let layer = rescale.expect("rescale active from first update").apply(layer);

        let after = to_vec(norm.unnormalize(layer.forward(input)));
        for (a, b) in before.iter().zip(&after) {
            assert!((a - b).abs() < 1e-3, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_rescale_waits_for_start_pop() {
        let device = Default::default();
        let mut norm = ReturnNormalizer::new(2, NormalizerConfig::default().with_start_pop(3));
        let raw = || Tensor::<B, 2>::from_floats([[1.0, 2.0], [3.0, 5.0]], &device);
        assert!(norm.update(raw()).unwrap().1.is_none());
        assert!(norm.update(raw()).unwrap().1.is_none());
        assert!(norm.update(raw()).unwrap().1.is_some());
    }
}
