//! Fixed-capacity circular queue of key embeddings used as negatives.

use burn::prelude::*;
use burn::tensor::Distribution;

use crate::error::MocoError;
use crate::training::loss::l2_normalize;

/// Circular buffer of `capacity` unit-norm embeddings of width `dim`.
///
/// Starts filled with random unit vectors; each [`enqueue`](Self::enqueue)
/// overwrites the oldest `batch_size` rows.
#[derive(Debug, Clone)]
pub struct EmbeddingQueue<B: Backend> {
    embeddings: Tensor<B, 2>,
    ptr: usize,
}

impl<B: Backend> EmbeddingQueue<B> {
    /// Create a queue of `capacity` random L2-normalized rows.
    pub fn new(capacity: usize, dim: usize, device: &B::Device) -> Result<Self, MocoError> {
        if capacity == 0 || dim == 0 {
            return Err(MocoError::InvalidConfig(format!(
                "queue needs a positive capacity and dimension, got {capacity}x{dim}"
            )));
        }
        let init = Tensor::<B, 2>::random([capacity, dim], Distribution::Normal(0.0, 1.0), device);
        Ok(Self {
            embeddings: l2_normalize(init).detach(),
            ptr: 0,
        })
    }

    /// Overwrite the rows at the pointer with `keys` and advance it.
    ///
    /// `keys` has shape `(batch_size, dim)`; `capacity` must be a multiple of
    /// `batch_size` so a batch never wraps around the end of the buffer.
    pub fn enqueue(&mut self, keys: Tensor<B, 2>) -> Result<(), MocoError> {
        let [batch_size, dim] = keys.dims();
        self.check_keys(batch_size, dim)?;

        let capacity = self.capacity();
        let start = self.ptr;
        self.embeddings = self
            .embeddings
            .clone()
            .slice_assign([start..start + batch_size, 0..dim], keys.detach());
        self.ptr = (start + batch_size) % capacity;
        Ok(())
    }

    /// Check that a `(batch_size, dim)` block of keys can be enqueued.
    pub fn check_keys(&self, batch_size: usize, dim: usize) -> Result<(), MocoError> {
        if dim != self.dim() {
            return Err(MocoError::DimensionMismatch {
                expected: self.dim(),
                actual: dim,
            });
        }
        let capacity = self.capacity();
        if batch_size == 0 || capacity % batch_size != 0 {
            return Err(MocoError::QueueBatchMismatch {
                capacity,
                batch_size,
            });
        }
        Ok(())
    }

    /// Current queue contents, shape `(capacity, dim)`.
    pub fn embeddings(&self) -> Tensor<B, 2> {
        self.embeddings.clone()
    }

    pub fn capacity(&self) -> usize {
        self.embeddings.dims()[0]
    }

    pub fn dim(&self) -> usize {
        self.embeddings.dims()[1]
    }

    /// Index of the next row to be overwritten.
    pub fn ptr(&self) -> usize {
        self.ptr
    }
}
