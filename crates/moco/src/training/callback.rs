//! Training-loop callbacks and the MoCo callback.
//!
//! The [`Learner`](crate::training::learner::Learner) calls every registered
//! [`Callback`] at fixed lifecycle points: once before fitting, before each
//! batch, to compute the loss, and after each optimizer step. [`MocoCallback`]
//! uses these hooks to maintain the momentum key encoder and the negative queue
//! and to supply the contrastive loss.

use std::path::Path;

use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::AutodiffBackend;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::augment::AugmentPipeline;
use crate::error::MocoError;
use crate::model::moco_model::MocoModel;
use crate::training::loss::moco_loss;
use crate::training::metrics::MocoMetrics;
use crate::training::momentum::momentum_update;
use crate::training::queue::EmbeddingQueue;

/// One training or validation batch as seen by callbacks.
#[derive(Debug, Clone)]
pub struct Batch<B: Backend> {
    /// Raw images from the dataset, `(N, C, H, W)`.
    pub x: Tensor<B, 4>,
    /// Model input. Defaults to `x`; callbacks may replace it.
    pub xb: Tensor<B, 4>,
    /// Targets handed to the loss, `(N, d)`. Set by callbacks.
    pub yb: Option<Tensor<B, 2>>,
}

impl<B: Backend> Batch<B> {
    pub fn new(x: Tensor<B, 4>) -> Self {
        Self {
            xb: x.clone(),
            x,
            yb: None,
        }
    }

    pub fn len(&self) -> usize {
        self.x.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lifecycle hooks invoked by the learner. Every hook has a no-op default.
pub trait Callback<B: AutodiffBackend> {
    fn name(&self) -> &'static str;

    /// Callbacks run in ascending order.
    fn order(&self) -> i32 {
        0
    }

    /// Whether `before_batch` also runs on validation batches.
    fn run_valid(&self) -> bool {
        false
    }

    fn before_fit(&mut self, _model: &MocoModel<B>, _device: &B::Device) -> Result<(), MocoError> {
        Ok(())
    }

    fn before_batch(&mut self, _batch: &mut Batch<B>) -> Result<(), MocoError> {
        Ok(())
    }

    /// Loss for the model output `pred`. The first callback returning
    /// `Some` owns the learner's loss.
    fn loss(&self, _pred: Tensor<B, 2>, _batch: &Batch<B>) -> Result<Option<Tensor<B, 1>>, MocoError> {
        Ok(None)
    }

    /// Batch metrics, computed after the loss.
    fn metrics(&self, _pred: &Tensor<B, 2>, _batch: &Batch<B>, _loss: f64) -> Option<MocoMetrics> {
        None
    }

    fn after_step(&mut self, _model: &MocoModel<B>, _batch: &Batch<B>) -> Result<(), MocoError> {
        Ok(())
    }

    /// Persist callback state into a checkpoint directory.
    fn save_checkpoint(&self, _dir: &Path) -> anyhow::Result<()> {
        Ok(())
    }

    /// Restore callback state before `before_fit` runs. `template` has the
    /// architecture of the learner's model.
    fn load_checkpoint(
        &mut self,
        _dir: &Path,
        _template: &MocoModel<B>,
        _device: &B::Device,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hyperparameters of the MoCo recipe.
#[derive(Config, Debug)]
pub struct MocoConfig {
    /// Queue capacity K. Must be a multiple of the training batch size.
    pub queue_size: usize,
    /// Momentum m of the key encoder EMA.
    #[config(default = 0.999)]
    pub momentum: f64,
    /// Softmax temperature of the contrastive logits.
    #[config(default = 0.07)]
    pub temperature: f64,
    /// Log both augmentation pipelines at construction.
    #[config(default = false)]
    pub print_augs: bool,
    /// Seed for the augmentation RNG. Drawn from entropy when unset.
    #[config(default = "None")]
    pub seed: Option<u64>,
}

impl MocoConfig {
    pub fn validate(&self) -> Result<(), MocoError> {
        if self.queue_size == 0 {
            return Err(MocoError::InvalidConfig("queue_size must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.momentum) {
            return Err(MocoError::InvalidConfig(format!(
                "momentum must lie in [0, 1], got {}",
                self.momentum
            )));
        }
        if self.temperature <= 0.0 || !self.temperature.is_finite() {
            return Err(MocoError::InvalidConfig(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }
        Ok(())
    }
}

/// File stem of the key encoder inside a checkpoint directory.
const KEY_MODEL_FILE: &str = "key_model";

/// Momentum Contrast as a learner callback.
///
/// - `before_fit`: copies the learner's model into a gradient-free key
///   encoder and fills the queue with random unit vectors.
/// - `before_batch`: the query view becomes the model input, the key view is
///   embedded by the key encoder and becomes the target.
/// - `loss`: InfoNCE of queries against their keys and the queue.
/// - `after_step`: EMA update of the key encoder, then the batch keys replace
///   the oldest queue entries.
pub struct MocoCallback<B: Backend> {
    config: MocoConfig,
    aug_query: AugmentPipeline,
    aug_key: AugmentPipeline,
    rng: StdRng,
    key_model: Option<MocoModel<B>>,
    queue: Option<EmbeddingQueue<B>>,
    restored_key_model: Option<MocoModel<B>>,
}

impl<B: Backend> MocoCallback<B> {
    /// Create the callback from its config and exactly two view pipelines.
    pub fn new(config: MocoConfig, aug_pipelines: [AugmentPipeline; 2]) -> Result<Self, MocoError> {
        config.validate()?;
        let [aug_query, aug_key] = aug_pipelines;
        if config.print_augs {
            tracing::info!(pipeline = ?aug_query, "Query augmentations");
            tracing::info!(pipeline = ?aug_key, "Key augmentations");
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            config,
            aug_query,
            aug_key,
            rng,
            key_model: None,
            queue: None,
            restored_key_model: None,
        })
    }

    pub fn config(&self) -> &MocoConfig {
        &self.config
    }

    /// The momentum encoder, once `before_fit` has run.
    pub fn key_model(&self) -> Option<&MocoModel<B>> {
        self.key_model.as_ref()
    }

    /// The negative queue, once `before_fit` has run.
    pub fn queue(&self) -> Option<&EmbeddingQueue<B>> {
        self.queue.as_ref()
    }

    /// Use `key_model` as the key encoder at the next `before_fit` instead of
    /// copying the learner's model.
    ///
    /// `key_model` must not be a `clone` of the learner's model, or the two
    /// share BatchNorm running statistics; see [`MocoModel::independent_copy`].
    pub fn restore_key_model(&mut self, key_model: MocoModel<B>) {
        self.restored_key_model = Some(key_model.no_grad());
    }

    fn init_state(&mut self, model: &MocoModel<B>, device: &B::Device) -> Result<(), MocoError> {
        if self.key_model.is_some() || self.queue.is_some() {
            return Err(MocoError::AlreadyInitialized);
        }

        let key_model = match self.restored_key_model.take() {
            Some(restored) => restored,
            None => model.independent_copy(device).no_grad(),
        };
        let queue = EmbeddingQueue::new(self.config.queue_size, model.projection_dim(), device)?;

        tracing::info!(
            queue_size = queue.capacity(),
            dim = queue.dim(),
            momentum = self.config.momentum,
            temperature = self.config.temperature,
            "MoCo key encoder and queue initialized"
        );
        self.key_model = Some(key_model);
        self.queue = Some(queue);
        Ok(())
    }

    fn make_views(&mut self, batch: &mut Batch<B>) -> Result<(), MocoError> {
        let key_model = self
            .key_model
            .as_ref()
            .ok_or(MocoError::NotInitialized("key encoder"))?;

        let q_img = self.aug_query.apply(batch.x.clone(), &mut self.rng);
        let k_img = self.aug_key.apply(batch.x.clone(), &mut self.rng);
        batch.xb = q_img;
        batch.yb = Some(key_model.forward(k_img).detach());
        Ok(())
    }

    fn contrastive_loss(&self, pred: Tensor<B, 2>, batch: &Batch<B>) -> Result<Tensor<B, 1>, MocoError> {
        let keys = batch.yb.clone().ok_or(MocoError::MissingKeys)?;
        let queue = self.queue.as_ref().ok_or(MocoError::NotInitialized("queue"))?;
        Ok(moco_loss(pred, keys, queue.embeddings(), self.config.temperature))
    }

    fn update_state(&mut self, model: &MocoModel<B>, batch: &Batch<B>) -> Result<(), MocoError> {
        let keys = batch.yb.clone().ok_or(MocoError::MissingKeys)?;
        let queue = self.queue.as_mut().ok_or(MocoError::NotInitialized("queue"))?;
        let [batch_size, dim] = keys.dims();
        queue.check_keys(batch_size, dim)?;

        let key_model = self
            .key_model
            .take()
            .ok_or(MocoError::NotInitialized("key encoder"))?;
        self.key_model = Some(momentum_update(model, key_model, self.config.momentum));
        queue.enqueue(keys)
    }
}

impl<B: AutodiffBackend> Callback<B> for MocoCallback<B> {
    fn name(&self) -> &'static str {
        "moco"
    }

    fn order(&self) -> i32 {
        9
    }

    fn run_valid(&self) -> bool {
        true
    }

    fn before_fit(&mut self, model: &MocoModel<B>, device: &B::Device) -> Result<(), MocoError> {
        self.init_state(model, device)
    }

    fn before_batch(&mut self, batch: &mut Batch<B>) -> Result<(), MocoError> {
        self.make_views(batch)
    }

    fn loss(&self, pred: Tensor<B, 2>, batch: &Batch<B>) -> Result<Option<Tensor<B, 1>>, MocoError> {
        self.contrastive_loss(pred, batch).map(Some)
    }

    fn metrics(&self, pred: &Tensor<B, 2>, batch: &Batch<B>, loss: f64) -> Option<MocoMetrics> {
        let keys = batch.yb.as_ref()?;
        let queue = self.queue.as_ref()?;
        Some(MocoMetrics::compute(pred, keys, &queue.embeddings(), loss))
    }

    fn after_step(&mut self, model: &MocoModel<B>, batch: &Batch<B>) -> Result<(), MocoError> {
        self.update_state(model, batch)
    }

    fn save_checkpoint(&self, dir: &Path) -> anyhow::Result<()> {
        let Some(key_model) = &self.key_model else {
            return Ok(());
        };
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        key_model
            .clone()
            .save_file(dir.join(KEY_MODEL_FILE), &recorder)
            .map_err(|e| anyhow::anyhow!("Failed to save key encoder to {}: {e}", dir.display()))?;
        Ok(())
    }

    fn load_checkpoint(
        &mut self,
        dir: &Path,
        template: &MocoModel<B>,
        device: &B::Device,
    ) -> anyhow::Result<()> {
        if self.key_model.is_some() {
            return Err(MocoError::AlreadyInitialized.into());
        }
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let key_model = template
            .independent_copy(device)
            .load_file(dir.join(KEY_MODEL_FILE), &recorder, device)
            .map_err(|e| anyhow::anyhow!("Failed to load key encoder from {}: {e}", dir.display()))?;
        self.restore_key_model(key_model);
        tracing::info!(dir = %dir.display(), "Restored key encoder; queue will be re-initialized");
        Ok(())
    }
}
