//! Tanh-squashed diagonal Gaussian policy distribution.
//!
//! The actor predicts `(mean, log_std)` for a Gaussian over pre-squash
//! actions `u`; the emitted action is `a = tanh(u)` in `(-1, 1)`. Log
//! probabilities include the change-of-variables term:
//!
//! ```text
//! log π(a|s) = Σ_i [ log N(u_i; μ_i, σ_i) - log(1 - tanh²(u_i)) ]
//! ```

use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Tensor};

/// Soft bounds applied to the raw log-std head.
pub const LOG_STD_MIN: f32 = -5.0;
pub const LOG_STD_MAX: f32 = 2.0;

const EPSILON: f32 = 1e-6;

/// Map an unbounded log-std output smoothly into `[LOG_STD_MIN, LOG_STD_MAX]`.
///
/// Uses tanh rather than a hard clamp so the gradient never vanishes at the
/// bounds.
pub fn clamp_log_std<B: Backend>(raw_log_std: Tensor<B, 2>) -> Tensor<B, 2> {
    let half_range = (LOG_STD_MAX - LOG_STD_MIN) / 2.0;
    raw_log_std
        .tanh()
        .mul_scalar(half_range)
        .add_scalar(LOG_STD_MIN + half_range)
}

/// A batch of squashed Gaussians, `[batch, action_dim]`.
#[derive(Debug, Clone)]
pub struct SquashedGaussian<B: Backend> {
    pub mean: Tensor<B, 2>,
    pub log_std: Tensor<B, 2>,
}

impl<B: Backend> SquashedGaussian<B> {
    /// Build from a mean and an already bounded log-std.
    pub fn new(mean: Tensor<B, 2>, log_std: Tensor<B, 2>) -> Self {
        Self { mean, log_std }
    }

    /// Number of distributions in the batch.
    pub fn batch_size(&self) -> usize {
        self.mean.dims()[0]
    }

    /// Action dimensionality.
    pub fn action_dim(&self) -> usize {
        self.mean.dims()[1]
    }

    /// Reparameterized sample: gradients flow through `mean` and `log_std`.
    ///
    /// Returns `(action [batch, dim], log_prob [batch, 1])`.
    pub fn rsample(&self) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let noise = Tensor::<B, 2>::random(
            self.mean.dims(),
            Distribution::Normal(0.0, 1.0),
            &self.mean.device(),
        );
        let std = self.log_std.clone().exp();
        let pre_squash = self.mean.clone() + std * noise.clone();

        // (u - μ) / σ is exactly the drawn noise
        let log_prob = gaussian_log_prob(noise, self.log_std.clone())
            - squash_correction(pre_squash.clone());
        (pre_squash.tanh(), log_prob)
    }

    /// Ordinary sample, detached from the graph.
    pub fn sample(&self) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let detached = SquashedGaussian::new(self.mean.clone().detach(), self.log_std.clone().detach());
        let (action, log_prob) = detached.rsample();
        (action.detach(), log_prob.detach())
    }

    /// Deterministic action `tanh(mean)`.
    pub fn mode(&self) -> Tensor<B, 2> {
        self.mean.clone().tanh()
    }

    /// Log-probability of already squashed actions, `[batch, 1]`.
    pub fn log_prob(&self, action: Tensor<B, 2>) -> Tensor<B, 2> {
        let clamped = action.clamp(-1.0 + EPSILON, 1.0 - EPSILON);
        let pre_squash = atanh(clamped);
        let std = self.log_std.clone().exp();
        let z = (pre_squash.clone() - self.mean.clone()) / std;
        gaussian_log_prob(z, self.log_std.clone()) - squash_correction(pre_squash)
    }
}

/// `Σ log N(z; 0, 1) - log σ` over the action dimension, `[batch, 1]`.
fn gaussian_log_prob<B: Backend>(z: Tensor<B, 2>, log_std: Tensor<B, 2>) -> Tensor<B, 2> {
    let log_2pi = (2.0 * std::f32::consts::PI).ln();
    let per_dim = z.powf_scalar(2.0).mul_scalar(-0.5) - log_std;
    per_dim.sub_scalar(0.5 * log_2pi).sum_dim(1)
}

/// `Σ log(1 - tanh²(u))`, `[batch, 1]`.
fn squash_correction<B: Backend>(pre_squash: Tensor<B, 2>) -> Tensor<B, 2> {
    let t = pre_squash.tanh();
    let one_minus_sq = t.clone().mul(t).neg().add_scalar(1.0);
    one_minus_sq.clamp(EPSILON, 1.0).log().sum_dim(1)
}

fn atanh<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let num = x.clone().add_scalar(1.0);
    let den = x.neg().add_scalar(1.0);
    (num / den).log().mul_scalar(0.5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    type B = NdArray<f32>;
    type AB = Autodiff<NdArray<f32>>;

    fn values<const D: usize>(t: Tensor<B, D>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_clamp_log_std_bounds() {
        let device = Default::default();
        let raw = Tensor::<B, 2>::from_floats([[-100.0], [0.0], [100.0]], &device);
        let out = values(clamp_log_std(raw));
        assert!((out[0] - LOG_STD_MIN).abs() < 1e-4);
        assert!((out[1] - (LOG_STD_MIN + LOG_STD_MAX) / 2.0).abs() < 1e-4);
        assert!((out[2] - LOG_STD_MAX).abs() < 1e-4);
    }

    #[test]
    fn test_samples_are_bounded_and_shaped() {
        let device = Default::default();
        let dist = SquashedGaussian::new(
            Tensor::<B, 2>::from_floats([[0.0, 3.0], [-3.0, 0.5]], &device),
            Tensor::<B, 2>::from_floats([[0.0, 0.0], [1.0, -1.0]], &device),
        );
        let (action, log_prob) = dist.sample();
        assert_eq!(action.dims(), [2, 2]);
        assert_eq!(log_prob.dims(), [2, 1]);
        assert!(values(action).iter().all(|a| a.abs() < 1.0));
        assert!(values(log_prob).iter().all(|l| l.is_finite()));
    }

    #[test]
    fn test_log_prob_matches_sampling_path() {
        let device = Default::default();
        let dist = SquashedGaussian::new(
            Tensor::<B, 2>::from_floats([[0.2, -0.3]], &device),
            Tensor::<B, 2>::from_floats([[-0.5, -1.0]], &device),
        );
        let (action, sampled) = dist.rsample();
        let recomputed = dist.log_prob(action);
        let (a, b) = (values(sampled), values(recomputed));
        assert!((a[0] - b[0]).abs() < 1e-2, "{} vs {}", a[0], b[0]);
    }

    #[test]
    fn test_mode_is_tanh_mean() {
        let device = Default::default();
        let dist = SquashedGaussian::new(
            Tensor::<B, 2>::from_floats([[0.0, 1.0]], &device),
            Tensor::<B, 2>::zeros([1, 2], &device),
        );
        let mode = values(dist.mode());
        assert!(mode[0].abs() < 1e-6);
        assert!((mode[1] - 1.0f32.tanh()).abs() < 1e-6);
    }

    #[test]
    fn test_rsample_carries_gradient_sample_does_not() {
        let device = Default::default();
        let mean = Tensor::<AB, 2>::from_floats([[0.1, -0.2]], &device).require_grad();
        let log_std = Tensor::<AB, 2>::from_floats([[-1.0, -1.0]], &device).require_grad();
        let dist = SquashedGaussian::new(mean.clone(), log_std);

        let (action, _) = dist.rsample();
        let grads = action.sum().backward();
        assert!(mean.grad(&grads).is_some());

        let (action, log_prob) = dist.sample();
        assert!(!action.is_require_grad());
        assert!(!log_prob.is_require_grad());
    }
}
