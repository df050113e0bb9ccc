//! InfoNCE loss for MoCo training.
//!
//! All functions are generic over `B: Backend` and expect L2-normalized
//! embeddings, so dot products are cosine similarities.

use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;

/// Lower bound on the norm in [`l2_normalize`].
pub const NORM_EPS: f64 = 1e-12;

/// Normalize each row of `x` to unit L2 norm.
///
/// The norm is clamped at [`NORM_EPS`], so all-zero rows stay zero.
pub fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let norm = x.clone().powf_scalar(2.0).sum_dim(1).sqrt().clamp_min(NORM_EPS);
    x / norm
}

/// Similarity logits of each query against the batch keys and the queue.
///
/// # Arguments
/// - `q`: shape `(N, d)` : query embeddings (gradient flows here)
/// - `k`: shape `(N, d)` : key embeddings from the momentum encoder
/// - `queue`: shape `(K, d)` : negatives from previous batches
///
/// # Returns
/// Logits of shape `(N, N + K)`. Row `i` has its positive at column `i`; the
/// other in-batch keys act as extra negatives.
pub fn moco_logits<B: Backend>(
    q: Tensor<B, 2>,
    k: Tensor<B, 2>,
    queue: Tensor<B, 2>,
    temperature: f64,
) -> Tensor<B, 2> {
    let candidates = Tensor::cat(vec![k, queue], 0); // (N + K, d)
    q.matmul(candidates.transpose()).div_scalar(temperature)
}

/// MoCo contrastive loss: cross-entropy of [`moco_logits`] against `0..N`.
///
/// # Returns
/// Scalar loss tensor of shape `(1,)`.
pub fn moco_loss<B: Backend>(
    q: Tensor<B, 2>,
    k: Tensor<B, 2>,
    queue: Tensor<B, 2>,
    temperature: f64,
) -> Tensor<B, 1> {
    let device = q.device();
    let logits = moco_logits(q, k, queue, temperature);
    let [n, _] = logits.dims();
    let labels = Tensor::<B, 1, Int>::arange(0..n as i64, &device);

    CrossEntropyLossConfig::new()
        .init(&device)
        .forward(logits, labels)
}
