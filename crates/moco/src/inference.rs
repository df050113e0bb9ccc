//! Embedding extraction from a trained MoCo model.
//!
//! `Embedder<B>` wraps a [`MocoModel`] and turns host image buffers into
//! encoder representations (for downstream tasks) or normalized projections
//! (the space the contrastive loss operates in). Run it on a plain backend so
//! BatchNorm layers use their running statistics.

use std::path::Path;

use burn::prelude::*;

use crate::model::bridge::{images_to_tensor, tensor_to_rows};
use crate::model::moco_model::{MocoModel, MocoModelConfig};
use crate::training::learner::resume_from_checkpoint;

/// Batched feature extractor over a trained model.
pub struct Embedder<B: Backend> {
    model: MocoModel<B>,
    batch_size: usize,
    device: B::Device,
}

impl<B: Backend> Embedder<B> {
    pub fn new(model: MocoModel<B>, device: B::Device) -> Self {
        Self {
            model,
            batch_size: 64,
            device,
        }
    }

    /// Load an embedder from a checkpoint file.
    ///
    /// Creates a fresh `MocoModel` from config and loads saved weights.
    pub fn load(path: &Path, config: &MocoModelConfig, device: B::Device) -> anyhow::Result<Self> {
        let model = resume_from_checkpoint::<B>(path, config, &device)?;
        Ok(Self::new(model, device))
    }

    /// Number of images per forward pass. Clamped to at least 1.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn model(&self) -> &MocoModel<B> {
        &self.model
    }

    /// Encoder features, one `Vec<f32>` of `representation_dim` per image.
    pub fn representations(&self, images: &[Vec<f32>], shape: [usize; 3]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.run(images, shape, |x| self.model.encode(x))
    }

    /// Unit-norm projector outputs, one `Vec<f32>` of `projection_dim` per image.
    pub fn projections(&self, images: &[Vec<f32>], shape: [usize; 3]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.run(images, shape, |x| self.model.forward(x))
    }

    fn run<F>(&self, images: &[Vec<f32>], shape: [usize; 3], forward: F) -> anyhow::Result<Vec<Vec<f32>>>
    where
        F: Fn(Tensor<B, 4>) -> Tensor<B, 2>,
    {
        if images.is_empty() {
            return Ok(vec![]);
        }
        if shape[0] != self.model.in_channels() {
            anyhow::bail!(
                "Model expects {} input channels, images have {}",
                self.model.in_channels(),
                shape[0]
            );
        }
        let numel: usize = shape.iter().product();
        if let Some((i, img)) = images.iter().enumerate().find(|(_, img)| img.len() != numel) {
            anyhow::bail!("Image {i} has {} values, expected {numel} for shape {shape:?}", img.len());
        }

        let mut out = Vec::with_capacity(images.len());
        for chunk in images.chunks(self.batch_size) {
            let refs: Vec<&[f32]> = chunk.iter().map(|v| v.as_slice()).collect();
            let x = images_to_tensor::<B>(&refs, shape, &self.device);
            out.extend(tensor_to_rows(forward(x)));
        }
        Ok(out)
    }
}

/// Cosine similarity between two vectors. Returns 0 when either is all zeros.
///
/// # Panics
/// Panics if the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "vectors must have equal length");
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};

    use crate::model::encoder::ConvEncoderConfig;

    type TestBackend = NdArray<f32>;

    fn tiny_config() -> MocoModelConfig {
        MocoModelConfig::new()
            .with_encoder(ConvEncoderConfig::new().with_channels(vec![4, 8]))
            .with_hidden_size(16)
            .with_projection_size(8)
            .with_probe_size(8)
    }

    fn images(n: usize) -> Vec<Vec<f32>> {
        (0..n)
            .map(|i| (0..3 * 12 * 12).map(|j| ((i * 31 + j) as f32 * 0.01).sin()).collect())
            .collect()
    }

    #[test]
    fn test_projection_shapes_and_norms() {
        let device = Default::default();
        let embedder = Embedder::<TestBackend>::new(tiny_config().init(&device), device).with_batch_size(3);

        let proj = embedder.projections(&images(7), [3, 12, 12]).unwrap();
        assert_eq!(proj.len(), 7);
        for row in &proj {
            assert_eq!(row.len(), 8);
            let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4, "Expected unit norm, got {norm}");
        }

        let reps = embedder.representations(&images(7), [3, 12, 12]).unwrap();
        assert_eq!(reps.len(), 7);
        assert!(reps.iter().all(|r| r.len() == 8));
    }

    #[test]
    fn test_batching_matches_single_pass() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);
        let small = Embedder::new(model.clone(), device).with_batch_size(2);
        let large = Embedder::new(model, device).with_batch_size(16);

        let a = small.projections(&images(5), [3, 12, 12]).unwrap();
        let b = large.projections(&images(5), [3, 12, 12]).unwrap();
        for (ra, rb) in a.iter().zip(&b) {
            assert!(cosine_similarity(ra, rb) > 0.9999);
        }
    }

    #[test]
    fn test_rejects_bad_input() {
        let device = Default::default();
        let embedder = Embedder::<TestBackend>::new(tiny_config().init(&device), device);

        assert!(embedder.projections(&[], [3, 12, 12]).unwrap().is_empty());
        assert!(embedder.projections(&images(2), [1, 36, 12]).is_err());
        assert!(embedder.projections(&[vec![0.0; 10]], [3, 12, 12]).is_err());
    }

    #[test]
    fn test_load_roundtrip() {
        let device = Default::default();
        let config = tiny_config();
        let model = config.init::<TestBackend>(&device);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model");
        model
            .clone()
            .save_file(path.clone(), &NamedMpkFileRecorder::<FullPrecisionSettings>::new())
            .unwrap();

        let original = Embedder::new(model, device).projections(&images(2), [3, 12, 12]).unwrap();
        let loaded = Embedder::<TestBackend>::load(&path, &config, device)
            .unwrap()
            .projections(&images(2), [3, 12, 12])
            .unwrap();
        for (a, b) in original.iter().zip(&loaded) {
            for (x, y) in a.iter().zip(b) {
                assert!((x - y).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 2.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 1.0], &[-1.0, -1.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }
}
