//! Training and embedding pipelines behind the `moco` subcommands.

use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::prelude::*;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use moco::augment::moco_aug_pipelines;
use moco::inference::Embedder;
use moco::training::data::ImageDataset;
use moco::{Learner, MocoCallback};

use crate::config::{
    build_learner_config, build_model_config, build_moco_config, load_moco_toml, MocoToml, TrainingCli,
};

type TrainBackend = Autodiff<NdArray<f32>>;
type InferBackend = NdArray<f32>;

const DEFAULT_IMAGE_SIZE: usize = 32;

/// Arguments for the `train` subcommand.
#[derive(Debug)]
pub struct TrainArgs {
    /// Path to the moco config TOML file. Defaults apply when absent.
    pub config: Option<PathBuf>,
    /// Directory for checkpoints.
    pub output_dir: PathBuf,
    /// JSON image file. Synthetic images are generated when absent.
    pub images: Option<PathBuf>,
    pub epochs: Option<usize>,
    pub batch_size: Option<usize>,
    pub lr: Option<f64>,
    pub queue_size: Option<usize>,
    /// Number of synthetic images.
    pub samples: usize,
    /// Side length of synthetic images.
    pub image_size: Option<usize>,
    /// Images held out for validation after each epoch.
    pub valid_samples: usize,
    /// Resume from `{output_dir}/epoch_{n}`.
    pub resume_epoch: Option<usize>,
}

/// Arguments for the `embed` subcommand.
#[derive(Debug)]
pub struct EmbedArgs {
    /// Model checkpoint path (without extension).
    pub checkpoint: PathBuf,
    pub config: Option<PathBuf>,
    pub images: Option<PathBuf>,
    pub samples: usize,
    pub image_size: Option<usize>,
    /// Emit encoder representations instead of projections.
    pub representations: bool,
    pub batch_size: usize,
    /// Output JSON path.
    pub output: PathBuf,
}

/// Images on disk: one flat channel-major buffer per image.
#[derive(Debug, Serialize, Deserialize)]
pub struct ImageFile {
    pub shape: [usize; 3],
    pub images: Vec<Vec<f32>>,
}

/// Output of `moco embed`.
#[derive(Debug, Serialize, Deserialize)]
pub struct EmbeddingFile {
    /// `"projection"` or `"representation"`.
    pub kind: String,
    pub dim: usize,
    pub embeddings: Vec<Vec<f32>>,
}

fn load_toml_or_default(path: Option<&Path>) -> anyhow::Result<MocoToml> {
    match path {
        Some(path) => load_moco_toml(path),
        None => Ok(MocoToml::default()),
    }
}

/// Read images from a JSON file, or generate `samples` synthetic images.
fn load_images(
    path: Option<&Path>,
    samples: usize,
    channels: usize,
    image_size: usize,
    seed: Option<u64>,
) -> anyhow::Result<ImageDataset> {
    match path {
        Some(path) => {
            let file = std::fs::File::open(path)
                .map_err(|e| anyhow::anyhow!("Failed to open images {}: {e}", path.display()))?;
            let data: ImageFile = serde_json::from_reader(std::io::BufReader::new(file))?;
            tracing::info!(path = %path.display(), count = data.images.len(), shape = ?data.shape, "Loaded images");
            Ok(ImageDataset::new(data.images, data.shape)?)
        }
        None => {
            let mut rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            tracing::info!(samples, channels, image_size, "Generating synthetic images");
            Ok(ImageDataset::synthetic(samples, channels, image_size, &mut rng))
        }
    }
}

/// Hold out the last `valid` images for validation.
fn split_dataset(data: ImageDataset, valid: usize) -> anyhow::Result<(ImageDataset, Option<ImageDataset>)> {
    if valid == 0 {
        return Ok((data, None));
    }
    if valid >= data.len() {
        anyhow::bail!("Cannot hold out {valid} of {} images for validation", data.len());
    }
    let shape = data.shape();
    let mut images = data.images().to_vec();
    let valid_images = images.split_off(images.len() - valid);
    Ok((
        ImageDataset::new(images, shape)?,
        Some(ImageDataset::new(valid_images, shape)?),
    ))
}

/// Train a MoCo model and write checkpoints to `args.output_dir`.
pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let start = Instant::now();
    let toml = load_toml_or_default(args.config.as_deref())?;

    let model_config = build_model_config(&toml.model);
    let learner_config = build_learner_config(
        &toml.training,
        &TrainingCli {
            epochs: args.epochs,
            batch_size: args.batch_size,
            lr: args.lr,
        },
        &args.output_dir,
    );
    let moco_config = build_moco_config(&toml.moco, args.queue_size, learner_config.seed);
    moco_config.validate()?;

    let image_size = args
        .image_size
        .or(toml.training.image_size)
        .unwrap_or(DEFAULT_IMAGE_SIZE);
    let crop_size = toml.training.crop_size.unwrap_or(image_size * 3 / 4).max(1);

    if moco_config.queue_size % learner_config.batch_size.max(1) != 0 {
        anyhow::bail!(
            "queue_size {} must be a multiple of batch_size {}",
            moco_config.queue_size,
            learner_config.batch_size
        );
    }

    let data = load_images(
        args.images.as_deref(),
        args.samples,
        model_config.encoder.in_channels,
        image_size,
        learner_config.seed,
    )?;
    if data.shape()[0] != model_config.encoder.in_channels {
        anyhow::bail!(
            "Images have {} channels, model expects {}",
            data.shape()[0],
            model_config.encoder.in_channels
        );
    }
    let (train, valid) = split_dataset(data, args.valid_samples)?;

    tracing::info!(
        train = train.len(),
        valid = valid.as_ref().map_or(0, |v| v.len()),
        crop_size,
        queue_size = moco_config.queue_size,
        output = %args.output_dir.display(),
        "Starting MoCo training"
    );

    let device = Default::default();
    let model = model_config.init::<TrainBackend>(&device);
    let callback = MocoCallback::<TrainBackend>::new(moco_config, moco_aug_pipelines(crop_size, &toml.augment))?;

    std::fs::create_dir_all(&args.output_dir)?;
    model_config.save(args.output_dir.join("model_config.json"))?;

    let mut learner = Learner::new(learner_config, model, device).with_callback(Box::new(callback));
    learner.fit(&train, valid.as_ref(), args.resume_epoch)?;

    if let Some(last) = learner.history().last() {
        println!(
            "Final: loss={:.4} top1={:.3} pos_sim={:.3} neg_sim={:.3}",
            last.loss, last.top1_accuracy, last.pos_similarity, last.neg_similarity
        );
    }
    println!("Checkpoints: {}", args.output_dir.display());
    println!("Elapsed: {:.1}s", start.elapsed().as_secs_f64());
    Ok(())
}

/// Embed images with a trained model and write them as JSON.
pub fn run_embed(args: EmbedArgs) -> anyhow::Result<()> {
    let toml = load_toml_or_default(args.config.as_deref())?;
    let model_config = build_model_config(&toml.model);
    let image_size = args
        .image_size
        .or(toml.training.image_size)
        .unwrap_or(DEFAULT_IMAGE_SIZE);

    let device = Default::default();
    let embedder = Embedder::<InferBackend>::load(&args.checkpoint, &model_config, device)?
        .with_batch_size(args.batch_size);

    let data = load_images(
        args.images.as_deref(),
        args.samples,
        model_config.encoder.in_channels,
        image_size,
        toml.training.seed,
    )?;
    let shape = data.shape();

    let pb = ProgressBar::new(data.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) Embedding images")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );

    let chunk_size = args.batch_size.max(1);
    let mut embeddings = Vec::with_capacity(data.len());
    for chunk in data.images().chunks(chunk_size) {
        let rows = if args.representations {
            embedder.representations(chunk, shape)?
        } else {
            embedder.projections(chunk, shape)?
        };
        embeddings.extend(rows);
        pb.inc(chunk.len() as u64);
    }
    pb.finish_and_clear();

    let out = EmbeddingFile {
        kind: if args.representations { "representation" } else { "projection" }.to_string(),
        dim: embeddings.first().map_or(0, |e| e.len()),
        embeddings,
    };
    if let Some(parent) = args.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    serde_json::to_writer(std::fs::File::create(&args.output)?, &out)?;

    tracing::info!(count = out.embeddings.len(), dim = out.dim, output = %args.output.display(), "Wrote embeddings");
    println!("Wrote {} {} embeddings (dim {}) to {}", out.embeddings.len(), out.kind, out.dim, args.output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_toml(dir: &Path) -> PathBuf {
        let path = dir.join("moco.toml");
        std::fs::write(
            &path,
            r#"
[model]
channels = [4, 8]
hidden_size = 16
projection_size = 8
probe_size = 8

[moco]
queue_size = 8

[training]
epochs = 1
batch_size = 4
log_interval = 1
seed = 1
image_size = 12
crop_size = 8
"#,
        )
        .unwrap();
        path
    }

    #[test]
    fn test_split_dataset() {
        let mut rng = StdRng::seed_from_u64(0);
        let data = ImageDataset::synthetic(10, 3, 4, &mut rng);
        let (train, valid) = split_dataset(data, 3).unwrap();
        assert_eq!(train.len(), 7);
        assert_eq!(valid.unwrap().len(), 3);

        let data = ImageDataset::synthetic(2, 3, 4, &mut rng);
        assert!(split_dataset(data, 2).is_err());
    }

    #[test]
    fn test_train_then_embed() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_toml(dir.path());
        let output_dir = dir.path().join("ckpt");

        run_train(TrainArgs {
            config: Some(config.clone()),
            output_dir: output_dir.clone(),
            images: None,
            epochs: None,
            batch_size: None,
            lr: None,
            queue_size: None,
            samples: 10,
            image_size: None,
            valid_samples: 2,
            resume_epoch: None,
        })
        .unwrap();
        assert!(output_dir.join("final").join("model.mpk").exists());
        assert!(output_dir.join("model_config.json").exists());

        let output = dir.path().join("emb.json");
        run_embed(EmbedArgs {
            checkpoint: output_dir.join("final").join("model"),
            config: Some(config),
            images: None,
            samples: 5,
            image_size: None,
            representations: false,
            batch_size: 2,
            output: output.clone(),
        })
        .unwrap();

        let file: EmbeddingFile = serde_json::from_reader(std::fs::File::open(&output).unwrap()).unwrap();
        assert_eq!(file.kind, "projection");
        assert_eq!(file.dim, 8);
        assert_eq!(file.embeddings.len(), 5);
    }

    #[test]
    fn test_train_rejects_indivisible_queue() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_toml(dir.path());
        let result = run_train(TrainArgs {
            config: Some(config),
            output_dir: dir.path().join("ckpt"),
            images: None,
            epochs: None,
            batch_size: Some(3),
            lr: None,
            queue_size: None,
            samples: 8,
            image_size: None,
            valid_samples: 0,
            resume_epoch: None,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_embed_reads_image_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_toml(dir.path());
        let toml = load_moco_toml(&config).unwrap();
        let model_config = build_model_config(&toml.model);

        let checkpoint = dir.path().join("model");
        let device = Default::default();
        model_config
            .init::<InferBackend>(&device)
            .save_file(
                checkpoint.clone(),
                &burn::record::NamedMpkFileRecorder::<burn::record::FullPrecisionSettings>::new(),
            )
            .unwrap();

        let images = dir.path().join("images.json");
        let file = ImageFile {
            shape: [3, 6, 6],
            images: vec![vec![0.1; 108], vec![-0.2; 108], vec![0.5; 108]],
        };
        serde_json::to_writer(std::fs::File::create(&images).unwrap(), &file).unwrap();

        let output = dir.path().join("out").join("reps.json");
        run_embed(EmbedArgs {
            checkpoint,
            config: Some(config),
            images: Some(images),
            samples: 0,
            image_size: None,
            representations: true,
            batch_size: 2,
            output: output.clone(),
        })
        .unwrap();

        let out: EmbeddingFile = serde_json::from_reader(std::fs::File::open(&output).unwrap()).unwrap();
        assert_eq!(out.kind, "representation");
        assert_eq!(out.dim, 8);
        assert_eq!(out.embeddings.len(), 3);
    }
}
