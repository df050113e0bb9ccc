//! Exponential moving average update of the key encoder.

use std::collections::HashMap;

use burn::module::{Module, ModuleMapper, ModuleVisitor, ParamId};
use burn::prelude::*;

/// Collects float tensors of a module, detached and flattened, keyed by id.
struct FloatTensors<B: Backend> {
    values: HashMap<ParamId, Tensor<B, 1>>,
    trainable_only: bool,
}

impl<B: Backend> ModuleVisitor<B> for FloatTensors<B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        if self.trainable_only && !tensor.is_require_grad() {
            return;
        }
        let numel = tensor.shape().num_elements();
        self.values.insert(id, tensor.clone().detach().reshape([numel]));
    }
}

/// Float tensors of `module` by id, flattened and detached.
///
/// With `trainable_only`, tensors that do not require gradients (BatchNorm
/// running statistics, frozen weights, everything on a non-autodiff backend)
/// are skipped.
pub fn float_tensors<B: Backend, M: Module<B>>(module: &M, trainable_only: bool) -> HashMap<ParamId, Tensor<B, 1>> {
    let mut visitor = FloatTensors {
        values: HashMap::new(),
        trainable_only,
    };
    module.visit(&mut visitor);
    visitor.values
}

/// Blends each key tensor with the query tensor of the same id.
struct MomentumBlend<B: Backend> {
    query: HashMap<ParamId, Tensor<B, 1>>,
    momentum: f64,
}

impl<B: Backend> ModuleMapper<B> for MomentumBlend<B> {
    fn map_float<const D: usize>(&mut self, id: ParamId, key: Tensor<B, D>) -> Tensor<B, D> {
        match self.query.remove(&id) {
            Some(q) => {
                let q: Tensor<B, D> = q.reshape(key.shape());
                key.detach().mul_scalar(self.momentum) + q.mul_scalar(1.0 - self.momentum)
            }
            None => key,
        }
    }
}

/// Momentum update: `key = key * m + query * (1 - m)` for every trainable
/// parameter of `query`, matched by parameter id.
///
/// The key model must share parameter ids with the query model (a clone, or
/// a fresh model loaded from the query's record). Tensors that do not require
/// gradients in `query`, such as BatchNorm running statistics, keep the key's
/// own values. No gradients are recorded and the returned key model has
/// gradients disabled.
pub fn momentum_update<B: Backend, M: Module<B>>(query: &M, key: M, momentum: f64) -> M {
    let mut blend = MomentumBlend {
        query: float_tensors(query, true),
        momentum,
    };
    let key = key.map(&mut blend);
    if !blend.query.is_empty() {
        tracing::warn!(
            missing = blend.query.len(),
            "Query parameters with no key counterpart; key encoder left unchanged for them"
        );
    }
    key.no_grad()
}
