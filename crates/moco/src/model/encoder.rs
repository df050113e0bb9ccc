use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::prelude::*;

/// Configuration for the convolutional encoder backbone.
///
/// ```text
/// (batch, in_channels, H, W)
///   → [Conv2d(3x3, stride 2) → BatchNorm2d → ReLU] × len(channels)
///   → AdaptiveAvgPool2d(1x1) → flatten
///   → (batch, channels.last())
/// ```
#[derive(Config, Debug)]
pub struct ConvEncoderConfig {
    /// Number of input image channels.
    #[config(default = 3)]
    pub in_channels: usize,
    /// Output channels of each conv block. The last entry is the
    /// representation dimension.
    #[config(default = "vec![32, 64, 128]")]
    pub channels: Vec<usize>,
}

/// Conv → BatchNorm → ReLU block with stride 2.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);
        burn::tensor::activation::relu(x)
    }
}

/// Small strided CNN producing one feature vector per image.
#[derive(Module, Debug)]
pub struct ConvEncoder<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
    pool: AdaptiveAvgPool2d,
    in_channels: usize,
}

impl ConvEncoderConfig {
    /// Initialize a ConvEncoder with the given configuration.
    ///
    /// # Panics
    /// Panics if `channels` is empty.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvEncoder<B> {
        assert!(!self.channels.is_empty(), "encoder needs at least one conv block");

        let mut blocks = Vec::with_capacity(self.channels.len());
        let mut c_in = self.in_channels;
        for &c_out in &self.channels {
            blocks.push(ConvBlock {
                conv: Conv2dConfig::new([c_in, c_out], [3, 3])
                    .with_stride([2, 2])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device),
                norm: BatchNormConfig::new(c_out).init(device),
            });
            c_in = c_out;
        }

        ConvEncoder {
            blocks,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            in_channels: self.in_channels,
        }
    }
}

impl<B: Backend> ConvEncoder<B> {
    /// Input shape: `(batch, in_channels, H, W)`
    /// Output shape: `(batch, channels.last())`
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = images;
        for block in &self.blocks {
            x = block.forward(x);
        }
        self.pool.forward(x).flatten::<2>(1, 3)
    }

    /// Number of image channels the first conv expects.
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }
}
