//! TOML config loading for the moco CLI.
//!
//! Deserializes `configs/moco.toml` which has `[model]`, `[moco]`, `[training]`
//! and `[augment]` sections, then merges with CLI overrides.

use std::path::Path;

use moco::augment::AugmentConfig;
use moco::model::encoder::ConvEncoderConfig;
use moco::{LearnerConfig, MocoConfig, MocoModelConfig};
use serde::Deserialize;

/// Queue capacity when neither TOML nor CLI sets one.
pub const DEFAULT_QUEUE_SIZE: usize = 1024;

/// Top-level structure matching `configs/moco.toml`. Every section is optional.
#[derive(Debug, Default, Deserialize)]
pub struct MocoToml {
    #[serde(default)]
    pub model: ModelOverrides,
    #[serde(default)]
    pub moco: MocoOverrides,
    #[serde(default)]
    pub training: TrainingOverrides,
    /// View pipeline knobs; missing fields fall back to their defaults.
    #[serde(default)]
    pub augment: AugmentConfig,
}

/// Optional overrides for `MocoModelConfig` fields.
#[derive(Debug, Default, Deserialize)]
pub struct ModelOverrides {
    pub in_channels: Option<usize>,
    /// Conv block widths of the encoder.
    pub channels: Option<Vec<usize>>,
    pub hidden_size: Option<usize>,
    pub projection_size: Option<usize>,
    pub bn: Option<bool>,
    pub nlayers: Option<usize>,
    pub probe_size: Option<usize>,
}

/// Optional overrides for `MocoConfig` fields.
#[derive(Debug, Default, Deserialize)]
pub struct MocoOverrides {
    pub queue_size: Option<usize>,
    pub momentum: Option<f64>,
    pub temperature: Option<f64>,
    pub print_augs: Option<bool>,
}

/// Optional overrides for `LearnerConfig` fields plus data sizing.
#[derive(Debug, Default, Deserialize)]
pub struct TrainingOverrides {
    pub lr: Option<f64>,
    pub weight_decay: Option<f64>,
    pub max_grad_norm: Option<f64>,
    pub epochs: Option<usize>,
    pub batch_size: Option<usize>,
    pub warmup_steps: Option<usize>,
    pub log_interval: Option<usize>,
    pub checkpoint_interval: Option<usize>,
    pub show_progress: Option<bool>,
    pub seed: Option<u64>,
    /// Side length of the square input images.
    pub image_size: Option<usize>,
    /// Side length of the augmented crops fed to the encoders.
    pub crop_size: Option<usize>,
}

/// Load and deserialize a `MocoToml` from a TOML file.
pub fn load_moco_toml(path: &Path) -> anyhow::Result<MocoToml> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config {}: {e}", path.display()))?;
    let config: MocoToml = toml::from_str(&contents)?;
    tracing::info!(path = %path.display(), "Loaded moco config");
    Ok(config)
}

/// Build a `MocoModelConfig` from defaults and TOML overrides.
pub fn build_model_config(overrides: &ModelOverrides) -> MocoModelConfig {
    let mut encoder = ConvEncoderConfig::new();
    if let Some(c) = overrides.in_channels {
        encoder.in_channels = c;
    }
    if let Some(channels) = &overrides.channels {
        encoder.channels = channels.clone();
    }

    let mut config = MocoModelConfig::new().with_encoder(encoder);
    if let Some(n) = overrides.hidden_size {
        config.hidden_size = n;
    }
    if let Some(n) = overrides.projection_size {
        config.projection_size = n;
    }
    if let Some(bn) = overrides.bn {
        config.bn = bn;
    }
    if let Some(n) = overrides.nlayers {
        config.nlayers = n;
    }
    if let Some(n) = overrides.probe_size {
        config.probe_size = n;
    }
    config
}

/// Build a `MocoConfig` from defaults, TOML overrides, and CLI `--queue-size`.
///
/// Priority chain: defaults < TOML values < CLI flags.
pub fn build_moco_config(overrides: &MocoOverrides, queue_size_cli: Option<usize>, seed: Option<u64>) -> MocoConfig {
    let queue_size = queue_size_cli
        .or(overrides.queue_size)
        .unwrap_or(DEFAULT_QUEUE_SIZE);

    let mut config = MocoConfig::new(queue_size).with_seed(seed);
    if let Some(m) = overrides.momentum {
        config.momentum = m;
    }
    if let Some(t) = overrides.temperature {
        config.temperature = t;
    }
    if let Some(p) = overrides.print_augs {
        config.print_augs = p;
    }
    config
}

/// CLI flags that override `[training]` values.
#[derive(Debug, Default)]
pub struct TrainingCli {
    pub epochs: Option<usize>,
    pub batch_size: Option<usize>,
    pub lr: Option<f64>,
}

/// Build a `LearnerConfig` from defaults, TOML overrides, and CLI flags.
///
/// Priority chain: defaults < TOML values < CLI flags.
pub fn build_learner_config(overrides: &TrainingOverrides, cli: &TrainingCli, checkpoint_dir: &Path) -> LearnerConfig {
    let mut config = LearnerConfig::new().with_checkpoint_dir(checkpoint_dir.to_string_lossy().into_owned());

    // Apply TOML overrides
    if let Some(v) = overrides.lr {
        config.lr = v;
    }
    if let Some(v) = overrides.weight_decay {
        config.weight_decay = v;
    }
    if let Some(v) = overrides.max_grad_norm {
        config.max_grad_norm = v;
    }
    if let Some(v) = overrides.epochs {
        config.epochs = v;
    }
    if let Some(v) = overrides.batch_size {
        config.batch_size = v;
    }
    if let Some(v) = overrides.warmup_steps {
        config.warmup_steps = v;
    }
    if let Some(v) = overrides.log_interval {
        config.log_interval = v;
    }
    if let Some(v) = overrides.checkpoint_interval {
        config.checkpoint_interval = v;
    }
    if let Some(v) = overrides.show_progress {
        config.show_progress = v;
    }
    config.seed = overrides.seed;

    // CLI overrides take highest priority
    if let Some(v) = cli.epochs {
        config.epochs = v;
    }
    if let Some(v) = cli.batch_size {
        config.batch_size = v;
    }
    if let Some(v) = cli.lr {
        config.lr = v;
    }
    config
}
