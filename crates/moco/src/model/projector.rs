use burn::nn::{BatchNorm, BatchNormConfig, Initializer, Linear, LinearConfig};
use burn::prelude::*;

/// Configuration for the projection MLP on top of the encoder.
///
/// ```text
/// n_layers == 1:  Linear(d_input→d_output)
/// n_layers >= 2:  Linear(d_input→d_hidden) → [BN] → ReLU
///                 → (Linear(d_hidden→d_hidden) → [BN] → ReLU) × (n_layers - 2)
///                 → Linear(d_hidden→d_output)
/// ```
#[derive(Config, Debug)]
pub struct ProjectionHeadConfig {
    /// Encoder representation dimension.
    pub d_input: usize,
    /// Hidden layer width.
    #[config(default = 256)]
    pub d_hidden: usize,
    /// Projection (embedding) dimension.
    #[config(default = 128)]
    pub d_output: usize,
    /// Insert BatchNorm before each hidden ReLU.
    #[config(default = false)]
    pub bn: bool,
    /// Number of linear layers.
    #[config(default = 2)]
    pub n_layers: usize,
}

/// MLP projection head. Weights are Kaiming-normal initialized, biases zero.
#[derive(Module, Debug)]
pub struct ProjectionHead<B: Backend> {
    linears: Vec<Linear<B>>,
    /// One per hidden layer when `bn` is set, empty otherwise.
    norms: Vec<BatchNorm<B, 1>>,
    d_output: usize,
}

impl ProjectionHeadConfig {
    /// # Panics
    /// Panics if `n_layers` is zero.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ProjectionHead<B> {
        assert!(self.n_layers > 0, "projection head needs at least one layer");

        let mut dims = Vec::with_capacity(self.n_layers + 1);
        dims.push(self.d_input);
        dims.extend(std::iter::repeat(self.d_hidden).take(self.n_layers - 1));
        dims.push(self.d_output);

        let linears = dims
            .windows(2)
            .map(|w| {
                let mut linear = LinearConfig::new(w[0], w[1])
                    .with_initializer(Initializer::KaimingNormal {
                        gain: 2.0_f64.sqrt(),
                        fan_out_only: false,
                    })
                    .init(device);
                // Kaiming applies to weights only; biases start at zero.
                linear.bias = linear
                    .bias
                    .map(|bias| bias.map(|b| b.zeros_like().require_grad()));
                linear
            })
            .collect();

        let norms = if self.bn {
            (0..self.n_layers - 1)
                .map(|_| BatchNormConfig::new(self.d_hidden).init(device))
                .collect()
        } else {
            Vec::new()
        };

        ProjectionHead {
            linears,
            norms,
            d_output: self.d_output,
        }
    }
}

impl<B: Backend> ProjectionHead<B> {
    /// Input shape: `(batch, d_input)`
    /// Output shape: `(batch, d_output)`
    pub fn forward(&self, h: Tensor<B, 2>) -> Tensor<B, 2> {
        let last = self.linears.len() - 1;
        let mut x = h;
        for (i, linear) in self.linears.iter().enumerate() {
            x = linear.forward(x);
            if i == last {
                break;
            }
            if let Some(norm) = self.norms.get(i) {
                // BatchNorm1d over features: (batch, d) → (batch, d, 1)
                x = norm.forward(x.unsqueeze_dim::<3>(2)).squeeze::<2>(2);
            }
            x = burn::tensor::activation::relu(x);
        }
        x
    }

    /// Output features of the last linear layer.
    pub fn d_output(&self) -> usize {
        self.d_output
    }
}
