//! Batch-level image augmentations producing the two MoCo views.
//!
//! Every augmentation works on a `(N, C, H, W)` tensor. Per-sample decisions
//! (flip, jitter, grayscale) are drawn with the backend RNG; the crop window
//! of [`Augment::RandomResizedCrop`] is drawn once per batch from the host RNG.
//!
//! Pipelines deserialize from TOML:
//!
//! ```toml
//! [[steps]]
//! type = "RandomResizedCrop"
//! size = 32
//! min_scale = 0.2
//!
//! [[steps]]
//! type = "HorizontalFlip"
//! p = 0.5
//! ```

use burn::prelude::*;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use burn::tensor::Distribution;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// A single augmentation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Augment {
    /// Crop a random region covering `min_scale..=1` of the area with aspect
    /// ratio in `[3/4, 4/3]`, then resize it to `size x size`.
    RandomResizedCrop {
        size: usize,
        #[serde(default = "default_min_scale")]
        min_scale: f64,
    },
    /// Mirror each image left-right with probability `p`.
    HorizontalFlip {
        #[serde(default = "default_flip_p")]
        p: f64,
    },
    /// With probability `p`, scale brightness by `U(1 - brightness, 1 + brightness)`
    /// and contrast around the image mean by `U(1 - contrast, 1 + contrast)`.
    ColorJitter { brightness: f64, contrast: f64, p: f64 },
    /// Replace every channel by the channel mean with probability `p`.
    Grayscale { p: f64 },
    /// Add zero-mean Gaussian pixel noise.
    GaussianNoise { std: f64 },
}

fn default_min_scale() -> f64 {
    0.2
}
fn default_flip_p() -> f64 {
    0.5
}

/// Per-sample Bernoulli(p) mask broadcastable over `(N, C, H, W)`.
fn sample_mask<B: Backend>(n: usize, p: f64, device: &B::Device) -> Tensor<B, 4> {
    Tensor::random([n, 1, 1, 1], Distribution::Bernoulli(p.clamp(0.0, 1.0)), device)
}

/// Per-sample factor drawn from `U(1 - spread, 1 + spread)`.
fn jitter_factor<B: Backend>(n: usize, spread: f64, device: &B::Device) -> Tensor<B, 4> {
    if spread <= 0.0 {
        return Tensor::ones([n, 1, 1, 1], device);
    }
    Tensor::random(
        [n, 1, 1, 1],
        Distribution::Uniform(1.0 - spread, 1.0 + spread),
        device,
    )
}

/// `x` where `mask == 0`, `y` where `mask == 1`.
fn blend<B: Backend>(x: Tensor<B, 4>, y: Tensor<B, 4>, mask: Tensor<B, 4>) -> Tensor<B, 4> {
    x.clone() + (y - x) * mask
}

/// Draw a crop window `(top, left, height, width)` for an `h x w` image.
fn crop_window(h: usize, w: usize, min_scale: f64, rng: &mut impl Rng) -> (usize, usize, usize, usize) {
    let min_scale = min_scale.clamp(f64::EPSILON, 1.0);
    let scale = rng.gen_range(min_scale..=1.0);
    let log_ratio = rng.gen_range((3.0_f64 / 4.0).ln()..=(4.0_f64 / 3.0).ln());
    let ratio = log_ratio.exp();

    let ch = ((scale / ratio).sqrt() * h as f64).round().clamp(1.0, h as f64) as usize;
    let cw = ((scale * ratio).sqrt() * w as f64).round().clamp(1.0, w as f64) as usize;
    let top = rng.gen_range(0..=h - ch);
    let left = rng.gen_range(0..=w - cw);
    (top, left, ch, cw)
}

impl Augment {
    /// Apply this step to a batch of images.
    pub fn apply<B: Backend>(&self, images: Tensor<B, 4>, rng: &mut impl Rng) -> Tensor<B, 4> {
        let [n, c, h, w] = images.dims();
        let device = images.device();
        if n == 0 {
            return images;
        }

        match *self {
            Augment::RandomResizedCrop { size, min_scale } => {
                let (top, left, ch, cw) = crop_window(h, w, min_scale, rng);
                let crop = images.slice([0..n, 0..c, top..top + ch, left..left + cw]);
                if ch == size && cw == size {
                    return crop;
                }
                interpolate(
                    crop,
                    [size, size],
                    InterpolateOptions::new(InterpolateMode::Bilinear),
                )
            }
            Augment::HorizontalFlip { p } => {
                let flipped = images.clone().flip([3]);
                blend(images, flipped, sample_mask(n, p, &device))
            }
            Augment::ColorJitter {
                brightness,
                contrast,
                p,
            } => {
                let b = jitter_factor::<B>(n, brightness, &device);
                let k = jitter_factor::<B>(n, contrast, &device);
                let bright = images.clone() * b;
                let mean = bright.clone().mean_dim(1).mean_dim(2).mean_dim(3);
                let jittered = (bright - mean.clone()) * k + mean;
                blend(images, jittered, sample_mask(n, p, &device))
            }
            Augment::Grayscale { p } => {
                let gray = images.clone().mean_dim(1); // (N, 1, H, W), broadcasts over C
                blend(images, gray, sample_mask(n, p, &device))
            }
            Augment::GaussianNoise { std } => {
                if std <= 0.0 {
                    return images;
                }
                let noise = Tensor::<B, 4>::random([n, c, h, w], Distribution::Normal(0.0, std), &device);
                images + noise
            }
        }
    }
}

/// An ordered list of augmentation steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AugmentPipeline {
    #[serde(default)]
    pub steps: Vec<Augment>,
}

impl AugmentPipeline {
    pub fn new(steps: Vec<Augment>) -> Self {
        Self { steps }
    }

    /// Apply every step in order.
    pub fn apply<B: Backend>(&self, images: Tensor<B, 4>, rng: &mut impl Rng) -> Tensor<B, 4> {
        self.steps
            .iter()
            .fold(images, |x, step| step.apply(x, rng))
    }
}

/// Knobs for the default MoCo view pipelines.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AugmentConfig {
    /// Smallest crop area fraction.
    #[serde(default = "default_min_scale")]
    pub min_scale: f64,
    #[serde(default = "default_flip_p")]
    pub flip_p: f64,
    #[serde(default = "default_jitter_strength")]
    pub brightness: f64,
    #[serde(default = "default_jitter_strength")]
    pub contrast: f64,
    #[serde(default = "default_jitter_p")]
    pub jitter_p: f64,
    #[serde(default = "default_grayscale_p")]
    pub grayscale_p: f64,
    /// Pixel noise std; 0 disables the noise step.
    #[serde(default)]
    pub noise_std: f64,
}

fn default_jitter_strength() -> f64 {
    0.4
}
fn default_jitter_p() -> f64 {
    0.8
}
fn default_grayscale_p() -> f64 {
    0.2
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            min_scale: default_min_scale(),
            flip_p: default_flip_p(),
            brightness: default_jitter_strength(),
            contrast: default_jitter_strength(),
            jitter_p: default_jitter_p(),
            grayscale_p: default_grayscale_p(),
            noise_std: 0.0,
        }
    }
}

/// Build the two view pipelines for MoCo, each producing `size x size` crops.
///
/// Both views share the same recipe; their randomness is independent.
pub fn moco_aug_pipelines(size: usize, config: &AugmentConfig) -> [AugmentPipeline; 2] {
    let mut steps = vec![
        Augment::RandomResizedCrop {
            size,
            min_scale: config.min_scale,
        },
        Augment::HorizontalFlip { p: config.flip_p },
        Augment::ColorJitter {
            brightness: config.brightness,
            contrast: config.contrast,
            p: config.jitter_p,
        },
        Augment::Grayscale {
            p: config.grayscale_p,
        },
    ];
    if config.noise_std > 0.0 {
        steps.push(Augment::GaussianNoise {
            std: config.noise_std,
        });
    }
    let pipeline = AugmentPipeline::new(steps);
    [pipeline.clone(), pipeline]
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::TensorData;
    use rand::SeedableRng;

    type TestBackend = NdArray<f32>;

    fn rng() -> rand::rngs::StdRng {
        rand::rngs::StdRng::seed_from_u64(42)
    }

    fn ramp(n: usize, c: usize, h: usize, w: usize) -> Tensor<TestBackend, 4> {
        let data: Vec<f32> = (0..n * c * h * w).map(|v| v as f32).collect();
        Tensor::from_data(TensorData::new(data, [n, c, h, w]), &Default::default())
    }

    fn values(t: Tensor<TestBackend, 4>) -> Vec<f32> {
        t.into_data().to_vec().unwrap()
    }

    #[test]
    fn test_flip_always_and_never() {
        let x = ramp(2, 1, 1, 3);
        let always = Augment::HorizontalFlip { p: 1.0 }.apply(x.clone(), &mut rng());
        assert_eq!(values(always), vec![2.0, 1.0, 0.0, 5.0, 4.0, 3.0]);

        let never = Augment::HorizontalFlip { p: 0.0 }.apply(x.clone(), &mut rng());
        assert_eq!(values(never), values(x));
    }

    #[test]
    fn test_grayscale_averages_channels() {
        let x = ramp(1, 2, 1, 2); // ch0 = [0, 1], ch1 = [2, 3]
        let gray = Augment::Grayscale { p: 1.0 }.apply(x, &mut rng());
        assert_eq!(values(gray), vec![1.0, 2.0, 1.0, 2.0]);
    }

    #[test]
    fn test_color_jitter_identity_when_zero_strength() {
        let x = ramp(2, 3, 2, 2);
        let out = Augment::ColorJitter {
            brightness: 0.0,
            contrast: 0.0,
            p: 1.0,
        }
        .apply(x.clone(), &mut rng());
        for (a, b) in values(out).iter().zip(values(x)) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }
    }

    #[test]
    fn test_random_resized_crop_output_size() {
        let x = ramp(3, 3, 20, 16);
        let out = Augment::RandomResizedCrop {
            size: 12,
            min_scale: 0.2,
        }
        .apply(x, &mut rng());
        assert_eq!(out.dims(), [3, 3, 12, 12]);
    }

    #[test]
    fn test_crop_window_in_bounds() {
        let mut r = rng();
        for _ in 0..200 {
            let (top, left, ch, cw) = crop_window(17, 9, 0.08, &mut r);
            assert!(ch >= 1 && cw >= 1);
            assert!(top + ch <= 17 && left + cw <= 9);
        }
    }

    #[test]
    fn test_noise_changes_values() {
        let x = ramp(1, 1, 4, 4);
        let zero = Augment::GaussianNoise { std: 0.0 }.apply(x.clone(), &mut rng());
        assert_eq!(values(zero), values(x.clone()));

        let noisy = Augment::GaussianNoise { std: 1.0 }.apply(x.clone(), &mut rng());
        let diff: f32 = values(noisy)
            .iter()
            .zip(values(x))
            .map(|(a, b)| (a - b).abs())
            .sum();
        assert!(diff > 0.0);
    }

    #[test]
    fn test_moco_pipelines() {
        let [aug1, aug2] = moco_aug_pipelines(8, &AugmentConfig::default());
        assert_eq!(aug1, aug2);
        assert_eq!(aug1.steps.len(), 4);

        let x = ramp(2, 3, 16, 16);
        let mut r = rng();
        assert_eq!(aug1.apply(x.clone(), &mut r).dims(), [2, 3, 8, 8]);
        assert_eq!(aug2.apply(x, &mut r).dims(), [2, 3, 8, 8]);
    }

    #[test]
    fn test_noise_step_only_when_enabled() {
        let config = AugmentConfig {
            noise_std: 0.05,
            ..AugmentConfig::default()
        };
        let [aug, _] = moco_aug_pipelines(8, &config);
        assert!(matches!(aug.steps.last(), Some(Augment::GaussianNoise { .. })));
    }

    #[test]
    fn test_pipeline_from_toml() {
        let toml_str = r#"
[[steps]]
type = "RandomResizedCrop"
size = 32

[[steps]]
type = "HorizontalFlip"

[[steps]]
type = "Grayscale"
p = 0.1
"#;
        let pipeline: AugmentPipeline = toml::from_str(toml_str).unwrap();
        assert_eq!(
            pipeline.steps,
            vec![
                Augment::RandomResizedCrop {
                    size: 32,
                    min_scale: 0.2
                },
                Augment::HorizontalFlip { p: 0.5 },
                Augment::Grayscale { p: 0.1 },
            ]
        );
    }
}
