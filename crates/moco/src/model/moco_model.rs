use burn::module::Ignored;
use burn::prelude::*;
use burn::tensor::Distribution;

use crate::model::encoder::{ConvEncoder, ConvEncoderConfig};
use crate::model::projector::{ProjectionHead, ProjectionHeadConfig};
use crate::training::loss::l2_normalize;

/// Configuration for a MoCo model: encoder backbone plus projection MLP.
///
/// The projector input width is discovered by probing the encoder with a
/// random `(2, in_channels, probe_size, probe_size)` batch, so any encoder
/// configuration works without spelling out its representation size.
#[derive(Config, Debug)]
pub struct MocoModelConfig {
    /// Encoder backbone.
    #[config(default = "ConvEncoderConfig::new()")]
    pub encoder: ConvEncoderConfig,
    /// Hidden width of the projection MLP.
    #[config(default = 256)]
    pub hidden_size: usize,
    /// Output width of the projection MLP (the embedding/queue dimension).
    #[config(default = 128)]
    pub projection_size: usize,
    /// BatchNorm in the projection MLP.
    #[config(default = false)]
    pub bn: bool,
    /// Number of linear layers in the projection MLP.
    #[config(default = 2)]
    pub nlayers: usize,
    /// Spatial size of the probe batch used to size the projector.
    #[config(default = 128)]
    pub probe_size: usize,
}

/// Query (and, once copied, key) network: `normalize(projector(encoder(x)))`.
#[derive(Module, Debug)]
pub struct MocoModel<B: Backend> {
    pub encoder: ConvEncoder<B>,
    pub projector: ProjectionHead<B>,
    config: Ignored<MocoModelConfig>,
}

impl MocoModelConfig {
    /// Build the encoder, probe its representation size, and attach a
    /// freshly initialized projector.
    pub fn init<B: Backend>(&self, device: &B::Device) -> MocoModel<B> {
        let encoder = self.encoder.init::<B>(device);
        let representation_dim = probe_representation_dim(&encoder, self.probe_size, device);
        tracing::debug!(representation_dim, "Probed encoder output");

        let projector = ProjectionHeadConfig::new(representation_dim)
            .with_d_hidden(self.hidden_size)
            .with_d_output(self.projection_size)
            .with_bn(self.bn)
            .with_n_layers(self.nlayers)
            .init(device);

        MocoModel {
            encoder,
            projector,
            config: Ignored(self.clone()),
        }
    }
}

/// Run a random batch through the encoder and read the feature dimension.
fn probe_representation_dim<B: Backend>(
    encoder: &ConvEncoder<B>,
    size: usize,
    device: &B::Device,
) -> usize {
    let probe = Tensor::<B, 4>::random(
        [2, encoder.in_channels(), size, size],
        Distribution::Normal(0.0, 1.0),
        device,
    );
    let [_, dim] = encoder.forward(probe).dims();
    dim
}

impl<B: Backend> MocoModel<B> {
    /// Forward pass to L2-normalized embeddings.
    ///
    /// Input shape: `(batch, C, H, W)`
    /// Output shape: `(batch, projection_dim)`, every row has unit norm.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        l2_normalize(self.projector.forward(self.encoder.forward(images)))
    }

    /// Encoder features without projection, used for downstream tasks.
    pub fn encode(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.encoder.forward(images)
    }

    /// Width of the embeddings produced by [`Self::forward`].
    pub fn projection_dim(&self) -> usize {
        self.projector.d_output()
    }

    pub fn in_channels(&self) -> usize {
        self.encoder.in_channels()
    }

    pub fn config(&self) -> &MocoModelConfig {
        &self.config
    }

    /// Copy with the same weights and parameter ids but its own BatchNorm
    /// running statistics.
    ///
    /// `Module::clone` shares running statistics between the copies, so a
    /// train-mode forward through one moves the other's statistics too.
    pub fn independent_copy(&self, device: &B::Device) -> Self {
        self.config
            .init::<B>(device)
            .load_record(self.clone().into_record())
    }
}
