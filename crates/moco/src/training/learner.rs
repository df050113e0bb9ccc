//! Callback-dispatching training loop for MoCo models.
//!
//! The learner owns batching, the AdamW optimizer with warmup + cosine LR
//! schedule, validation, metric logging and checkpoints. Everything specific
//! to a training recipe (views, targets, loss, post-step state) lives in
//! [`Callback`]s.

use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::MocoError;
use crate::model::bridge::tensor_to_f64;
use crate::model::moco_model::{MocoModel, MocoModelConfig};
use crate::training::callback::{Batch, Callback};
use crate::training::data::ImageDataset;
use crate::training::metrics::{MetricsHistory, MocoMetrics, RunningAvg};

/// Metadata saved alongside each checkpoint for resuming training.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
    /// Number of completed epochs.
    pub epoch: usize,
    /// Number of completed optimizer steps.
    pub step: usize,
}

/// Configuration for the training loop.
#[derive(Config, Debug)]
pub struct LearnerConfig {
    /// Base learning rate for AdamW.
    #[config(default = 1e-3)]
    pub lr: f64,
    /// Weight decay for AdamW.
    #[config(default = 1e-4)]
    pub weight_decay: f64,
    /// Maximum gradient norm for clipping. 0 disables clipping.
    #[config(default = 1.0)]
    pub max_grad_norm: f64,
    /// Number of passes over the training set.
    #[config(default = 10)]
    pub epochs: usize,
    /// Images per batch. Must divide the MoCo queue size.
    #[config(default = 64)]
    pub batch_size: usize,
    /// Number of linear warmup steps.
    #[config(default = 0)]
    pub warmup_steps: usize,
    /// Steps between metric logging.
    #[config(default = 50)]
    pub log_interval: usize,
    /// Epochs between checkpoint saves. 0 keeps only the final checkpoint.
    #[config(default = 1)]
    pub checkpoint_interval: usize,
    /// Directory for saving checkpoints.
    #[config(default = "String::from(\"checkpoints/moco\")")]
    pub checkpoint_dir: String,
    /// Draw a progress bar per epoch.
    #[config(default = false)]
    pub show_progress: bool,
    /// Seed for shuffling and the backend RNG.
    #[config(default = "None")]
    pub seed: Option<u64>,
}

/// Compute the learning rate at a given step using warmup + cosine decay.
///
/// - Warmup phase (`step < warmup_steps`): linearly ramps from 0 to `base_lr`.
/// - Cosine phase: decays from `base_lr` to 0 following a cosine schedule.
pub fn lr_schedule(base_lr: f64, warmup_steps: usize, total_steps: usize, step: usize) -> f64 {
    if warmup_steps > 0 && step < warmup_steps {
        base_lr * (step + 1) as f64 / warmup_steps as f64
    } else {
        let decay_steps = total_steps.saturating_sub(warmup_steps).max(1);
        let progress = (step.saturating_sub(warmup_steps)) as f64 / decay_steps as f64;
        let progress = progress.min(1.0);
        base_lr * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
    }
}

fn format_eta(remaining_secs: f64) -> String {
    if remaining_secs < 60.0 {
        format!("{:.0}s", remaining_secs)
    } else if remaining_secs < 3600.0 {
        format!("{:.0}m", remaining_secs / 60.0)
    } else {
        format!("{:.1}h", remaining_secs / 3600.0)
    }
}

fn progress_bar(len: usize, visible: bool, epoch: usize) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    pb.set_message(format!("epoch {epoch}"));
    pb
}

/// Training loop over a [`MocoModel`] driven by callbacks.
pub struct Learner<B: AutodiffBackend> {
    config: LearnerConfig,
    model: MocoModel<B>,
    callbacks: Vec<Box<dyn Callback<B>>>,
    device: B::Device,
    history: MetricsHistory,
}

impl<B: AutodiffBackend> Learner<B> {
    pub fn new(config: LearnerConfig, model: MocoModel<B>, device: B::Device) -> Self {
        Self {
            config,
            model,
            callbacks: Vec::new(),
            device,
            history: MetricsHistory::new(),
        }
    }

    /// Register a callback. Callbacks are kept sorted by [`Callback::order`].
    pub fn add_callback(&mut self, callback: Box<dyn Callback<B>>) {
        self.callbacks.push(callback);
        self.callbacks.sort_by_key(|cb| cb.order());
    }

    pub fn with_callback(mut self, callback: Box<dyn Callback<B>>) -> Self {
        self.add_callback(callback);
        self
    }

    pub fn config(&self) -> &LearnerConfig {
        &self.config
    }

    pub fn model(&self) -> &MocoModel<B> {
        &self.model
    }

    pub fn into_model(self) -> MocoModel<B> {
        self.model
    }

    /// Metrics recorded at logging points and epoch ends.
    pub fn history(&self) -> &MetricsHistory {
        &self.history
    }

    /// Names of the registered callbacks in dispatch order.
    pub fn callback_names(&self) -> Vec<&'static str> {
        self.callbacks.iter().map(|cb| cb.name()).collect()
    }

    fn compute_loss(&self, pred: Tensor<B, 2>, batch: &Batch<B>) -> Result<Tensor<B, 1>, MocoError> {
        for cb in &self.callbacks {
            if let Some(loss) = cb.loss(pred.clone(), batch)? {
                return Ok(loss);
            }
        }
        Err(MocoError::NoLossFunction)
    }

    fn compute_metrics(&self, pred: &Tensor<B, 2>, batch: &Batch<B>, loss: f64) -> Option<MocoMetrics> {
        self.callbacks
            .iter()
            .find_map(|cb| cb.metrics(pred, batch, loss))
    }

    fn epoch_dir(&self, epoch: usize) -> PathBuf {
        Path::new(&self.config.checkpoint_dir).join(format!("epoch_{epoch}"))
    }

    /// Train for `config.epochs` epochs.
    ///
    /// Training batches are shuffled and the trailing partial batch is
    /// dropped. When `valid` is given, it is evaluated after every epoch.
    /// With `resume_epoch`, model, optimizer and callback state are loaded
    /// from `{checkpoint_dir}/epoch_{resume_epoch}` and training continues
    /// from the following epoch.
    pub fn fit(
        &mut self,
        train: &ImageDataset,
        valid: Option<&ImageDataset>,
        resume_epoch: Option<usize>,
    ) -> anyhow::Result<()> {
        let batch_size = self.config.batch_size;
        if batch_size == 0 || train.len() < batch_size {
            anyhow::bail!(
                "Training set of {} images cannot fill a batch of {batch_size}",
                train.len()
            );
        }
        std::fs::create_dir_all(&self.config.checkpoint_dir)?;

        let steps_per_epoch = train.len() / batch_size;
        let total_steps = steps_per_epoch * self.config.epochs;

        let optim_config = AdamWConfig::new()
            .with_weight_decay(self.config.weight_decay as f32)
            .with_grad_clipping(
                (self.config.max_grad_norm > 0.0)
                    .then(|| GradientClippingConfig::Norm(self.config.max_grad_norm as f32)),
            );
        let mut optimizer = optim_config.init::<B, MocoModel<B>>();

        let mut rng = match self.config.seed {
            Some(seed) => {
                B::seed(seed);
                StdRng::seed_from_u64(seed)
            }
            None => StdRng::from_entropy(),
        };

        let mut start_epoch = 0;
        let mut step = 0;

        if let Some(epoch) = resume_epoch {
            let dir = self.epoch_dir(epoch);
            let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();

            self.model = self
                .model
                .clone()
                .load_file(dir.join("model"), &recorder, &self.device)
                .map_err(|e| anyhow::anyhow!("Failed to load model from {}: {e}", dir.display()))?;

            let optim_record = recorder
                .load(dir.join("optimizer"), &self.device)
                .map_err(|e| anyhow::anyhow!("Failed to load optimizer from {}: {e}", dir.display()))?;
            optimizer = optimizer.load_record(optim_record);

            let meta_path = dir.join("meta.json");
            let meta: CheckpointMeta = serde_json::from_reader(
                std::fs::File::open(&meta_path)
                    .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", meta_path.display()))?,
            )
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", meta_path.display()))?;

            for cb in self.callbacks.iter_mut() {
                cb.load_checkpoint(&dir, &self.model, &self.device)?;
            }

            start_epoch = meta.epoch;
            step = meta.step;
            tracing::info!(start_epoch, step, "Resumed training from checkpoint");
        }

        for cb in self.callbacks.iter_mut() {
            cb.before_fit(&self.model, &self.device)?;
        }

        tracing::info!(
            epochs = self.config.epochs,
            steps_per_epoch,
            batch_size,
            callbacks = ?self.callback_names(),
            "Starting training"
        );

        let train_start = Instant::now();
        let mut running_avg = RunningAvg::new();

        for epoch in start_epoch..self.config.epochs {
            let batches = train.batch_indices(batch_size, true, true, &mut rng);
            let pb = progress_bar(batches.len(), self.config.show_progress, epoch);
            let mut epoch_avg = RunningAvg::new();

            for indices in &batches {
                let lr = lr_schedule(self.config.lr, self.config.warmup_steps, total_steps, step);

                let mut batch = Batch::new(train.batch_tensor::<B>(indices, &self.device));
                for cb in self.callbacks.iter_mut() {
                    cb.before_batch(&mut batch)?;
                }

                let pred = self.model.forward(batch.xb.clone());
                let loss = self.compute_loss(pred.clone(), &batch)?;
                let loss_val = tensor_to_f64(loss.clone());
                if let Some(m) = self.compute_metrics(&pred, &batch, loss_val) {
                    running_avg.update(&m);
                    epoch_avg.update(&m);
                }

                let grads = GradientsParams::from_grads(loss.backward(), &self.model);
                self.model = optimizer.step(lr, self.model.clone(), grads);

                for cb in self.callbacks.iter_mut() {
                    cb.after_step(&self.model, &batch)?;
                }

                if self.config.log_interval > 0 && step % self.config.log_interval == 0 {
                    if let Some(m) = running_avg.average() {
                        let warnings = m.health_check();
                        if !warnings.is_empty() {
                            tracing::warn!(step, "Health check warnings: {:?}", warnings);
                        }
                        self.history.push(step, m);
                    }
                    let elapsed = train_start.elapsed().as_secs_f64();
                    let done = step + 1;
                    let remaining = elapsed * total_steps.saturating_sub(done) as f64 / done as f64;
                    let lr_str = format!("{:.2e}", lr);
                    tracing::info!(
                        epoch,
                        step,
                        lr = %lr_str,
                        eta = %format_eta(remaining),
                        "avg({}) {}",
                        running_avg.count(),
                        running_avg.display()
                    );
                    running_avg.reset();
                }

                step += 1;
                pb.inc(1);
            }
            pb.finish_and_clear();

            let val_str = match valid {
                Some(valid) => match self.validate(valid, &mut rng)? {
                    Some(vm) => format!(
                        " | val: loss={:.4} top1={:.3}",
                        vm.loss, vm.top1_accuracy
                    ),
                    None => String::new(),
                },
                None => String::new(),
            };
            tracing::info!(epoch, step, "Epoch finished: {}{}", epoch_avg.display(), val_str);

            let completed = epoch + 1;
            if self.config.checkpoint_interval > 0
                && completed % self.config.checkpoint_interval == 0
                && completed < self.config.epochs
            {
                let dir = self.epoch_dir(completed);
                self.save_checkpoint(&dir, &optimizer, &CheckpointMeta { epoch: completed, step })?;
            }
        }

        tracing::info!(
            steps = step,
            elapsed_secs = %format!("{:.1}", train_start.elapsed().as_secs_f64()),
            "Training loop finished"
        );

        let final_dir = Path::new(&self.config.checkpoint_dir).join("final");
        self.save_checkpoint(
            &final_dir,
            &optimizer,
            &CheckpointMeta {
                epoch: self.config.epochs,
                step,
            },
        )?;
        Ok(())
    }

    /// Evaluate `valid` without stepping the optimizer.
    ///
    /// The model runs on the inner (non-autodiff) backend so BatchNorm uses
    /// its running statistics. Only callbacks with `run_valid` see the
    /// batches. Returns the averaged metrics, or `None` when no callback
    /// reports metrics.
    pub fn validate(&mut self, valid: &ImageDataset, rng: &mut StdRng) -> anyhow::Result<Option<MocoMetrics>> {
        let eval_model = self.model.valid();
        let mut avg = RunningAvg::new();

        for indices in valid.batch_indices(self.config.batch_size, false, false, rng) {
            let mut batch = Batch::new(valid.batch_tensor::<B>(&indices, &self.device));
            for cb in self.callbacks.iter_mut().filter(|cb| cb.run_valid()) {
                cb.before_batch(&mut batch)?;
            }

            let pred = Tensor::<B, 2>::from_inner(eval_model.forward(batch.xb.clone().inner()));
            let loss = self.compute_loss(pred.clone(), &batch)?;
            let loss_val = tensor_to_f64(loss);
            if let Some(m) = self.compute_metrics(&pred, &batch, loss_val) {
                avg.update(&m);
            }
        }
        Ok(avg.average())
    }

    fn save_checkpoint<O>(&self, dir: &Path, optimizer: &O, meta: &CheckpointMeta) -> anyhow::Result<()>
    where
        O: Optimizer<MocoModel<B>, B>,
    {
        std::fs::create_dir_all(dir)?;
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();

        self.model
            .clone()
            .save_file(dir.join("model"), &recorder)
            .map_err(|e| anyhow::anyhow!("Failed to save model to {}: {e}", dir.display()))?;

        recorder
            .record(optimizer.to_record(), dir.join("optimizer"))
            .map_err(|e| anyhow::anyhow!("Failed to save optimizer to {}: {e}", dir.display()))?;

        serde_json::to_writer(std::fs::File::create(dir.join("meta.json"))?, meta)?;

        for cb in &self.callbacks {
            cb.save_checkpoint(dir)?;
        }

        tracing::info!(dir = %dir.display(), epoch = meta.epoch, step = meta.step, "Checkpoint saved");
        Ok(())
    }
}

/// Load a MocoModel from a checkpoint file.
///
/// Creates a fresh model from config, then loads saved weights on top.
pub fn resume_from_checkpoint<B: Backend>(
    path: &Path,
    config: &MocoModelConfig,
    device: &B::Device,
) -> anyhow::Result<MocoModel<B>> {
    let model = config
        .init::<B>(device)
        .load_file(path, &NamedMpkFileRecorder::<FullPrecisionSettings>::new(), device)
        .map_err(|e| anyhow::anyhow!("Failed to load checkpoint from {}: {e}", path.display()))?;
    Ok(model)
}
