mod config;
mod pipeline;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pipeline::{EmbedArgs, TrainArgs};

/// moco: self-supervised image representation learning with Momentum Contrast.
#[derive(Parser)]
#[command(name = "moco", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands for MoCo training and embedding extraction.
#[derive(Subcommand)]
enum Command {
    /// Train a MoCo model on an image file or synthetic images.
    Train {
        /// Path to moco config TOML file. Built-in defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Directory for saving checkpoints.
        #[arg(long, default_value = "checkpoints/moco")]
        output_dir: PathBuf,
        /// JSON file with `shape` and `images`. Synthetic images are used when omitted.
        #[arg(long)]
        images: Option<PathBuf>,
        /// Override the number of epochs.
        #[arg(long)]
        epochs: Option<usize>,
        /// Override the batch size. Must divide the queue size.
        #[arg(long)]
        batch_size: Option<usize>,
        /// Override the learning rate.
        #[arg(long)]
        lr: Option<f64>,
        /// Override the negative queue capacity.
        #[arg(long)]
        queue_size: Option<usize>,
        /// Number of synthetic images to generate.
        #[arg(long, default_value_t = 1024)]
        samples: usize,
        /// Side length of synthetic images.
        #[arg(long)]
        image_size: Option<usize>,
        /// Number of images held out for validation.
        #[arg(long, default_value_t = 0)]
        valid_samples: usize,
        /// Resume from the checkpoint saved after this epoch.
        #[arg(long)]
        resume_epoch: Option<usize>,
    },
    /// Embed images with a trained model and write JSON.
    Embed {
        /// Model checkpoint path without extension (e.g. checkpoints/moco/final/model).
        #[arg(long)]
        checkpoint: PathBuf,
        /// Path to the moco config TOML used for training.
        #[arg(long)]
        config: Option<PathBuf>,
        /// JSON file with `shape` and `images`. Synthetic images are used when omitted.
        #[arg(long)]
        images: Option<PathBuf>,
        /// Number of synthetic images to generate.
        #[arg(long, default_value_t = 64)]
        samples: usize,
        /// Side length of synthetic images.
        #[arg(long)]
        image_size: Option<usize>,
        /// Output encoder representations instead of normalized projections.
        #[arg(long)]
        representations: bool,
        /// Images per forward pass.
        #[arg(long, default_value_t = 64)]
        batch_size: usize,
        /// Output JSON path.
        #[arg(long, default_value = "embeddings.json")]
        output: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Train {
            config,
            output_dir,
            images,
            epochs,
            batch_size,
            lr,
            queue_size,
            samples,
            image_size,
            valid_samples,
            resume_epoch,
        } => pipeline::run_train(TrainArgs {
            config,
            output_dir,
            images,
            epochs,
            batch_size,
            lr,
            queue_size,
            samples,
            image_size,
            valid_samples,
            resume_epoch,
        }),
        Command::Embed {
            checkpoint,
            config,
            images,
            samples,
            image_size,
            representations,
            batch_size,
            output,
        } => pipeline::run_embed(EmbedArgs {
            checkpoint,
            config,
            images,
            samples,
            image_size,
            representations,
            batch_size,
            output,
        }),
    }
}
