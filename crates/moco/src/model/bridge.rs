//! Tensor bridge: utilities to convert between host buffers (`Vec<f32>`)
//! and burn tensors.
//!
//! Images live on the host as flat `C * H * W` buffers in channel-major order;
//! the model needs `Tensor<B, 4>` batches. Embeddings go the other way.

use burn::prelude::*;
use burn::tensor::TensorData;

/// Convert a batch of flat images to a burn 4D tensor of shape `(N, C, H, W)`.
///
/// # Panics
/// Panics if `images` is empty or if any image does not hold `C * H * W` values.
pub fn images_to_tensor<B: Backend>(
    images: &[&[f32]],
    shape: [usize; 3],
    device: &B::Device,
) -> Tensor<B, 4> {
    assert!(!images.is_empty(), "images must not be empty");
    let [c, h, w] = shape;
    let numel = c * h * w;
    assert!(numel > 0, "image shape must be non-empty, got {shape:?}");
    for (i, img) in images.iter().enumerate() {
        assert_eq!(
            img.len(),
            numel,
            "image {i} has length {}, expected {numel}",
            img.len()
        );
    }

    let batch = images.len();
    let flat: Vec<f32> = images.iter().flat_map(|v| v.iter().copied()).collect();
    Tensor::from_data(TensorData::new(flat, [batch, c, h, w]), device)
}

/// Split a burn 2D tensor `(rows, dim)` into one `Vec<f32>` per row.
pub fn tensor_to_rows<B: Backend>(tensor: Tensor<B, 2>) -> Vec<Vec<f32>> {
    let [rows, dim] = tensor.dims();
    if dim == 0 {
        return vec![Vec::new(); rows];
    }
    let flat: Vec<f32> = tensor.into_data().iter::<f32>().collect();
    flat.chunks(dim).map(|row| row.to_vec()).collect()
}

/// Extract a single f64 scalar from a burn 1D tensor.
///
/// # Panics
/// Panics if the tensor does not contain exactly one element.
pub fn tensor_to_f64<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    let val: f32 = tensor.into_scalar().elem();
    val as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_images_to_tensor_layout() {
        let device = Default::default();
        let a: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let b: Vec<f32> = (12..24).map(|v| v as f32).collect();

        let tensor = images_to_tensor::<TestBackend>(&[&a, &b], [3, 2, 2], &device);
        assert_eq!(tensor.dims(), [2, 3, 2, 2]);

        // Second image, channel 1, row 0, col 1 = 12 + 4 + 1
        let val: f32 = tensor
            .slice([1..2, 1..2, 0..1, 1..2])
            .reshape([1])
            .into_scalar()
            .elem();
        assert_eq!(val, 17.0);
    }

    #[test]
    #[should_panic(expected = "expected 12")]
    fn test_images_to_tensor_rejects_ragged() {
        let device = Default::default();
        let a = vec![0.0_f32; 12];
        let b = vec![0.0_f32; 11];
        let _ = images_to_tensor::<TestBackend>(&[&a, &b], [3, 2, 2], &device);
    }

    #[test]
    fn test_tensor_to_rows() {
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[1.0_f32, 2.0, 3.0], [4.0, 5.0, 6.0]]),
            &device,
        );
        let rows = tensor_to_rows(tensor);
        assert_eq!(rows, vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);
    }

    #[test]
    fn test_tensor_to_f64() {
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 1>::from_data(TensorData::from([42.0_f32]), &device);
        assert!((tensor_to_f64(tensor) - 42.0).abs() < 1e-6);
    }
}
