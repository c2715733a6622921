//! Target copies updated by exponential moving average.
//!
//! ```text
//! θ_target ← (1 - τ) · θ_target + τ · θ_online
//! ```
//!
//! Targets are never trained. They start as an independent snapshot of the
//! online module ([`snapshot`]) and afterwards only move through
//! [`soft_update`]. Parameters are paired by traversal order, which is
//! deterministic for modules of the same architecture.

use burn::module::{Module, ModuleMapper, Param};
use burn::prelude::*;

/// Independent copy of a module's parameters.
///
/// The copy shares no storage with `online` (tensors are rebuilt from their
/// data) and carries no optimizer state.
pub fn snapshot<B: Backend, M: Module<B>>(online: &M) -> M {
    online.clone().map(&mut Detacher)
}

struct Detacher;

impl<B: Backend> ModuleMapper<B> for Detacher {
    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        let value = param.val();
        let tracked = value.is_require_grad();
        let copy = Tensor::from_data(value.to_data(), &value.device());
        Param::initialized(param.id.clone(), leaf(copy, tracked))
    }
}

/// Rebuild `tensor` as a graph leaf, restoring its grad flag.
pub(crate) fn leaf<B: Backend, const D: usize>(tensor: Tensor<B, D>, tracked: bool) -> Tensor<B, D> {
    let tensor = tensor.detach();
    if tracked {
        tensor.require_grad()
    } else {
        tensor
    }
}

/// Collects every float parameter of the online module, flattened.
struct Collect<B: Backend> {
    params: Vec<Tensor<B, 1>>,
}

impl<B: Backend> ModuleMapper<B> for Collect<B> {
    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        let value = param.val();
        let numel = value.shape().num_elements();
        self.params.push(value.reshape([numel]));
        param
    }
}

/// Moves each target parameter toward its online counterpart.
struct Blend<B: Backend> {
    online: std::vec::IntoIter<Tensor<B, 1>>,
    tau: f32,
}

impl<B: Backend> ModuleMapper<B> for Blend<B> {
    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        let Some(online) = self.online.next() else {
            return param;
        };
        let target = param.val();
        let tracked = target.is_require_grad();
        let shape = target.dims();
        let blended = target.mul_scalar(1.0 - self.tau) + online.reshape(shape).mul_scalar(self.tau);
        Param::initialized(param.id.clone(), leaf(blended, tracked))
    }
}

/// Soft update of `target` toward `online` with factor `tau`.
///
/// `tau = 0` returns `target` unchanged; `tau = 1` returns an exact copy of
/// `online`.
pub fn soft_update<B: Backend, M: Module<B>>(online: &M, target: M, tau: f32) -> M {
    if tau <= 0.0 {
        return target;
    }
    if tau >= 1.0 {
        return snapshot(online);
    }

    let mut collect = Collect { params: Vec::new() };
    let _ = online.clone().map(&mut collect);

    target.map(&mut Blend {
        online: collect.params.into_iter(),
        tau,
    })
}
