//! In-memory image dataset and batching for MoCo training.
//!
//! Images are stored on the host as flat channel-major `C * H * W` buffers
//! and converted to `(N, C, H, W)` tensors per batch. MoCo needs no labels.

use rand::seq::SliceRandom;
use rand::Rng;

use burn::prelude::*;

use crate::error::MocoError;
use crate::model::bridge::images_to_tensor;

/// A set of same-shaped images.
#[derive(Debug, Clone)]
pub struct ImageDataset {
    images: Vec<Vec<f32>>,
    shape: [usize; 3],
}

impl ImageDataset {
    /// Wrap `images`, checking every buffer holds `C * H * W` values.
    pub fn new(images: Vec<Vec<f32>>, shape: [usize; 3]) -> Result<Self, MocoError> {
        let numel: usize = shape.iter().product();
        if numel == 0 {
            return Err(MocoError::InvalidConfig(format!(
                "image shape must be non-empty, got {shape:?}"
            )));
        }
        if let Some((i, img)) = images.iter().enumerate().find(|(_, img)| img.len() != numel) {
            return Err(MocoError::InvalidConfig(format!(
                "image {i} has {} values, expected {numel} for shape {shape:?}",
                img.len()
            )));
        }
        Ok(Self { images, shape })
    }

    /// Generate `n` structured random images of `channels x size x size`.
    ///
    /// Each channel is a sinusoidal grating with random frequency, phase and
    /// orientation plus a little pixel noise, scaled to roughly `[-1, 1]`.
    /// Useful as a stand-in dataset when exercising the training pipeline.
    pub fn synthetic(n: usize, channels: usize, size: usize, rng: &mut impl Rng) -> Self {
        let mut images = Vec::with_capacity(n);
        for _ in 0..n {
            let mut img = Vec::with_capacity(channels * size * size);
            for _ in 0..channels {
                let freq = rng.gen_range(0.5..4.0) * std::f32::consts::TAU / size.max(1) as f32;
                let phase = rng.gen_range(0.0..std::f32::consts::TAU);
                let angle = rng.gen_range(0.0..std::f32::consts::PI);
                let (sin_a, cos_a) = angle.sin_cos();
                for y in 0..size {
                    for x in 0..size {
                        let t = (x as f32 * cos_a + y as f32 * sin_a) * freq + phase;
                        let noise: f32 = rng.gen_range(-0.1..0.1);
                        img.push(0.9 * t.sin() + noise);
                    }
                }
            }
            images.push(img);
        }
        Self {
            images,
            shape: [channels, size, size],
        }
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// `[C, H, W]` of every image.
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// Split the dataset into batches of indices.
    ///
    /// With `drop_last`, a trailing batch smaller than `batch_size` is
    /// discarded (training keeps every batch the same size so it divides the
    /// queue evenly).
    pub fn batch_indices(
        &self,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
        rng: &mut impl Rng,
    ) -> Vec<Vec<usize>> {
        if batch_size == 0 {
            return Vec::new();
        }
        let mut order: Vec<usize> = (0..self.images.len()).collect();
        if shuffle {
            order.shuffle(rng);
        }
        order
            .chunks(batch_size)
            .filter(|chunk| !drop_last || chunk.len() == batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    /// Stack the images at `indices` into a `(len, C, H, W)` tensor.
    ///
    /// # Panics
    /// Panics if `indices` is empty or out of range.
    pub fn batch_tensor<B: Backend>(&self, indices: &[usize], device: &B::Device) -> Tensor<B, 4> {
        let refs: Vec<&[f32]> = indices.iter().map(|&i| self.images[i].as_slice()).collect();
        images_to_tensor::<B>(&refs, self.shape, device)
    }

    /// Iterate over the raw image buffers.
    pub fn images(&self) -> &[Vec<f32>] {
        &self.images
    }
}
