//! MoCo training metrics with health checks.

use burn::prelude::*;

use crate::training::loss::moco_logits;

/// Per-batch contrastive metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct MocoMetrics {
    /// Contrastive loss value.
    pub loss: f64,
    /// Fraction of queries whose highest logit is their own key.
    pub top1_accuracy: f64,
    /// Mean cosine similarity between each query and its key.
    pub pos_similarity: f64,
    /// Mean cosine similarity between queries and queue entries.
    pub neg_similarity: f64,
    /// Number of candidates each query is ranked against (N + K).
    pub num_candidates: usize,
}

impl MocoMetrics {
    /// Compute metrics from normalized queries `(N, d)`, keys `(N, d)` and
    /// queue `(K, d)`. No gradients are involved.
    pub fn compute<B: Backend>(
        q: &Tensor<B, 2>,
        k: &Tensor<B, 2>,
        queue: &Tensor<B, 2>,
        loss: f64,
    ) -> Self {
        let q = q.clone().detach();
        let k = k.clone().detach();
        let queue = queue.clone().detach();
        let device = q.device();

        let logits = moco_logits(q.clone(), k.clone(), queue.clone(), 1.0);
        let [n, num_candidates] = logits.dims();
        let labels = Tensor::<B, 1, Int>::arange(0..n as i64, &device);
        let predicted = logits.argmax(1).reshape([n]);
        let top1_accuracy: f64 = predicted.equal(labels).float().mean().into_scalar().elem();

        let pos_similarity: f64 = (q.clone() * k).sum_dim(1).mean().into_scalar().elem();
        let neg_similarity: f64 = q.matmul(queue.transpose()).mean().into_scalar().elem();

        Self {
            loss,
            top1_accuracy,
            pos_similarity,
            neg_similarity,
            num_candidates,
        }
    }

    /// Accuracy of a uniform guess over the candidates.
    pub fn chance_accuracy(&self) -> f64 {
        if self.num_candidates == 0 {
            0.0
        } else {
            1.0 / self.num_candidates as f64
        }
    }

    /// Return warnings for signs of broken training.
    pub fn health_check(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.loss.is_finite() {
            warnings.push(format!("loss is not finite ({})", self.loss));
        }
        if self.neg_similarity > 0.9 {
            warnings.push(format!(
                "mean negative similarity {:.3} > 0.9, embeddings may have collapsed",
                self.neg_similarity
            ));
        }
        if self.pos_similarity - self.neg_similarity < 0.01 {
            warnings.push(format!(
                "positive similarity {:.3} barely above negative {:.3}",
                self.pos_similarity, self.neg_similarity
            ));
        }
        if self.num_candidates > 0 && self.top1_accuracy <= self.chance_accuracy() {
            warnings.push(format!(
                "top-1 accuracy {:.4} at or below chance {:.4}",
                self.top1_accuracy,
                self.chance_accuracy()
            ));
        }
        warnings
    }
}

/// Running average accumulator for metrics over a logging interval.
#[derive(Debug, Default)]
pub struct RunningAvg {
    loss: f64,
    top1: f64,
    pos: f64,
    neg: f64,
    num_candidates: usize,
    count: usize,
}

impl RunningAvg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, m: &MocoMetrics) {
        self.loss += m.loss;
        self.top1 += m.top1_accuracy;
        self.pos += m.pos_similarity;
        self.neg += m.neg_similarity;
        self.num_candidates = m.num_candidates;
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn display(&self) -> String {
        match self.average() {
            Some(m) => format!(
                "loss={:.4} top1={:.3} pos_sim={:.3} neg_sim={:.3}",
                m.loss, m.top1_accuracy, m.pos_similarity, m.neg_similarity
            ),
            None => "no data".to_string(),
        }
    }

    pub fn average(&self) -> Option<MocoMetrics> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        Some(MocoMetrics {
            loss: self.loss / n,
            top1_accuracy: self.top1 / n,
            pos_similarity: self.pos / n,
            neg_similarity: self.neg / n,
            num_candidates: self.num_candidates,
        })
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Metrics recorded at logging points, for inspection after training.
#[derive(Debug, Default)]
pub struct MetricsHistory {
    entries: Vec<(usize, MocoMetrics)>,
}

impl MetricsHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: usize, metrics: MocoMetrics) {
        self.entries.push((step, metrics));
    }

    pub fn entries(&self) -> &[(usize, MocoMetrics)] {
        &self.entries
    }

    pub fn last(&self) -> Option<&MocoMetrics> {
        self.entries.last().map(|(_, m)| m)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
