//! Integration tests for the moco crate.
//!
//! These tests drive the full recipe through the learner: MocoModel + MocoCallback
//! + AdamW, checkpoint save and resume, and embedding extraction from the final
//! checkpoint. All use the NdArray backend and synthetic images.

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::prelude::*;
use burn::tensor::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::TempDir;

use moco::augment::{moco_aug_pipelines, AugmentConfig};
use moco::inference::{cosine_similarity, Embedder};
use moco::model::encoder::ConvEncoderConfig;
use moco::training::data::ImageDataset;
use moco::training::learner::CheckpointMeta;
use moco::training::loss::moco_loss;
use moco::training::momentum::momentum_update;
use moco::training::queue::EmbeddingQueue;
use moco::{Batch, Callback, Learner, LearnerConfig, MocoCallback, MocoConfig, MocoError, MocoModelConfig};

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<NdArray<f32>>;

const IMAGE_SIZE: usize = 12;
const CROP_SIZE: usize = 8;

fn tiny_model_config() -> MocoModelConfig {
    MocoModelConfig::new()
        .with_encoder(ConvEncoderConfig::new().with_channels(vec![4, 8]))
        .with_hidden_size(16)
        .with_projection_size(8)
        .with_probe_size(CROP_SIZE)
}

fn tiny_callback(queue_size: usize) -> Box<MocoCallback<TestAutodiffBackend>> {
    Box::new(
        MocoCallback::new(
            MocoConfig::new(queue_size).with_seed(Some(11)),
            moco_aug_pipelines(CROP_SIZE, &AugmentConfig::default()),
        )
        .unwrap(),
    )
}

fn learner_config(dir: &TempDir, epochs: usize) -> LearnerConfig {
    LearnerConfig::new()
        .with_epochs(epochs)
        .with_batch_size(4)
        .with_log_interval(1)
        .with_checkpoint_interval(1)
        .with_checkpoint_dir(dir.path().to_string_lossy().into_owned())
        .with_seed(Some(5))
}

fn dataset(n: usize, seed: u64) -> ImageDataset {
    let mut rng = StdRng::seed_from_u64(seed);
    ImageDataset::synthetic(n, 3, IMAGE_SIZE, &mut rng)
}

// ---- Test 1: full fit writes checkpoints and finite metrics ----

#[test]
fn test_fit_writes_checkpoints() {
    let dir = TempDir::new().unwrap();
    let device = Default::default();
    let model = tiny_model_config().init::<TestAutodiffBackend>(&device);

    let mut learner = Learner::new(learner_config(&dir, 2), model, device).with_callback(tiny_callback(8));
    let train = dataset(10, 1);
    let valid = dataset(6, 2);
    learner.fit(&train, Some(&valid), None).unwrap();

    // 10 images at batch 4 with drop_last -> 2 steps per epoch
    let history = learner.history();
    assert_eq!(history.entries().len(), 4);
    for (_, m) in history.entries() {
        assert!(m.loss.is_finite(), "loss should be finite, got {}", m.loss);
        assert_eq!(m.num_candidates, 4 + 8);
    }

    let epoch1 = dir.path().join("epoch_1");
    assert!(epoch1.join("model.mpk").exists());
    assert!(epoch1.join("optimizer.mpk").exists());
    assert!(epoch1.join("key_model.mpk").exists());

    let final_dir = dir.path().join("final");
    assert!(final_dir.join("model.mpk").exists());
    let meta: CheckpointMeta =
        serde_json::from_reader(std::fs::File::open(final_dir.join("meta.json")).unwrap()).unwrap();
    assert_eq!(meta, CheckpointMeta { epoch: 2, step: 4 });
}

// ---- Test 2: resume continues from the saved epoch ----

#[test]
fn test_resume_from_epoch() {
    let dir = TempDir::new().unwrap();
    let device = Default::default();
    let train = dataset(8, 3);

    let model = tiny_model_config().init::<TestAutodiffBackend>(&device);
    let mut first = Learner::new(learner_config(&dir, 2), model, device).with_callback(tiny_callback(8));
    first.fit(&train, None, None).unwrap();

    let fresh = tiny_model_config().init::<TestAutodiffBackend>(&device);
    let mut resumed =
        Learner::new(learner_config(&dir, 3), fresh, device).with_callback(tiny_callback(8));
    resumed.fit(&train, None, Some(1)).unwrap();

    // Resumed at epoch 1 after 2 steps, then 2 more epochs of 2 steps
    let meta: CheckpointMeta = serde_json::from_reader(
        std::fs::File::open(dir.path().join("final").join("meta.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(meta, CheckpointMeta { epoch: 3, step: 6 });
}

// ---- Test 3: resuming from a missing checkpoint fails cleanly ----

#[test]
fn test_resume_missing_checkpoint_fails() {
    let dir = TempDir::new().unwrap();
    let device = Default::default();
    let model = tiny_model_config().init::<TestAutodiffBackend>(&device);
    let mut learner = Learner::new(learner_config(&dir, 1), model, device).with_callback(tiny_callback(8));
    assert!(learner.fit(&dataset(8, 4), None, Some(7)).is_err());
}

// ---- Test 4: learner without a loss callback ----

struct Noop;

impl Callback<TestAutodiffBackend> for Noop {
    fn name(&self) -> &'static str {
        "noop"
    }
}

#[test]
fn test_fit_without_loss_callback_fails() {
    let dir = TempDir::new().unwrap();
    let device = Default::default();
    let model = tiny_model_config().init::<TestAutodiffBackend>(&device);
    let mut learner = Learner::new(learner_config(&dir, 1), model, device).with_callback(Box::new(Noop));

    let err = learner.fit(&dataset(8, 5), None, None).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MocoError>(),
        Some(MocoError::NoLossFunction)
    ));
}

// ---- Test 5: batch size must divide the queue ----

#[test]
fn test_queue_batch_mismatch_surfaces() {
    let dir = TempDir::new().unwrap();
    let device = Default::default();
    let model = tiny_model_config().init::<TestAutodiffBackend>(&device);
    let mut learner = Learner::new(learner_config(&dir, 1), model, device).with_callback(tiny_callback(6));

    let err = learner.fit(&dataset(8, 6), None, None).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MocoError>(),
        Some(MocoError::QueueBatchMismatch { capacity: 6, batch_size: 4 })
    ));
}

// ---- Test 6: callbacks run in order ----

#[test]
fn test_callbacks_sorted_by_order() {
    struct Late;
    impl Callback<TestAutodiffBackend> for Late {
        fn name(&self) -> &'static str {
            "late"
        }
        fn order(&self) -> i32 {
            20
        }
    }

    let dir = TempDir::new().unwrap();
    let device = Default::default();
    let model = tiny_model_config().init::<TestAutodiffBackend>(&device);
    let learner = Learner::new(learner_config(&dir, 1), model, device)
        .with_callback(Box::new(Late))
        .with_callback(tiny_callback(8))
        .with_callback(Box::new(Noop));
    assert_eq!(learner.callback_names(), vec!["noop", "moco", "late"]);
}

// ---- Test 7: embeddings from the final checkpoint ----

#[test]
fn test_embed_from_final_checkpoint() {
    let dir = TempDir::new().unwrap();
    let device = Default::default();
    let config = tiny_model_config();
    let model = config.init::<TestAutodiffBackend>(&device);
    let mut learner = Learner::new(learner_config(&dir, 1), model, device).with_callback(tiny_callback(8));
    let train = dataset(8, 7);
    learner.fit(&train, None, None).unwrap();

    let embedder =
        Embedder::<TestBackend>::load(&dir.path().join("final").join("model"), &config, device).unwrap();
    let shape = [3, IMAGE_SIZE, IMAGE_SIZE];
    let proj = embedder.projections(train.images(), shape).unwrap();
    assert_eq!(proj.len(), 8);
    assert!((cosine_similarity(&proj[0], &proj[0]) - 1.0).abs() < 1e-4);

    let reps = embedder.representations(train.images(), shape).unwrap();
    assert!(reps.iter().all(|r| r.len() == 8));
}

// ---- Test 8: manual MoCo step mirrors the callback wiring ----

#[test]
fn test_manual_step_matches_recipe() {
    let device = Default::default();
    let query = tiny_model_config().init::<TestAutodiffBackend>(&device);
    let key = query.independent_copy(&device).no_grad();
    let mut queue = EmbeddingQueue::<TestAutodiffBackend>::new(8, 8, &device).unwrap();

    let x = Tensor::<TestAutodiffBackend, 4>::random([4, 3, CROP_SIZE, CROP_SIZE], Distribution::Normal(0.0, 1.0), &device);
    let mut batch = Batch::new(x.clone());
    batch.yb = Some(key.forward(x).detach());

    let pred = query.forward(batch.xb.clone());
    let loss = moco_loss(pred, batch.yb.clone().unwrap(), queue.embeddings(), 0.07);
    let loss_val: f32 = loss.into_scalar().elem();
    assert!(loss_val.is_finite() && loss_val > 0.0);

    let key = momentum_update(&query, key, 0.5);
    queue.enqueue(batch.yb.unwrap()).unwrap();
    assert_eq!(queue.ptr(), 4);
    assert_eq!(key.projection_dim(), 8);
}
