//! Masked loss primitives shared by both detector stages.
//!
//! Targets and masks are assembled host-side and lifted into tensors; the
//! losses themselves are plain tensor expressions so gradients flow through
//! the network outputs only.

use burn::tensor::activation::{log_softmax, sigmoid};
use burn::tensor::{backend::Backend, Tensor};

/// Elementwise smooth-L1 (Huber) error: quadratic under 1.0, linear above.
pub fn smooth_l1<B: Backend, const D: usize>(
    pred: Tensor<B, D>,
    target: Tensor<B, D>,
) -> Tensor<B, D> {
    let diff = (pred - target).abs();
    let small_mask = diff.clone().lower_elem(1.0).float();
    let small = diff.clone() * diff.clone() * 0.5;
    let large = diff - 0.5;
    small * small_mask.clone() + large * (small_mask.neg() + 1.0)
}

/// Binary cross-entropy on logits, weighted per element. Elements with zero
/// weight are excluded; the result is the mean over the included ones.
pub fn weighted_bce_with_logits<B: Backend, const D: usize>(
    logits: Tensor<B, D>,
    targets: Tensor<B, D>,
    weights: Tensor<B, D>,
) -> Tensor<B, 1> {
    let eps = 1e-6;
    let prob = sigmoid(logits);
    let log_p = (prob.clone() + eps).log();
    let log_not_p = (prob.neg() + 1.0 + eps).log();
    let per_elem = (targets.clone() * log_p + (targets.neg() + 1.0) * log_not_p).neg();
    let denom = weights.clone().sum().clamp_min(1.0);
    (per_elem * weights).sum() / denom
}

/// Cross-entropy over class logits with one-hot targets and per-row weights
/// (weight 0 excludes a row). Mean over the included rows.
pub fn weighted_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    one_hot: Tensor<B, 2>,
    row_weights: Tensor<B, 1>,
) -> Tensor<B, 1> {
    let rows = logits.dims()[0];
    let log_probs = log_softmax(logits, 1);
    let per_row = (log_probs * one_hot).sum_dim(1).neg().reshape([rows]);
    let denom = row_weights.clone().sum().clamp_min(1.0);
    (per_row * row_weights).sum() / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn scalar(t: Tensor<TestBackend, 1>) -> f32 {
        t.into_data().to_vec::<f32>().unwrap()[0]
    }

    fn tensor1(values: Vec<f32>) -> Tensor<TestBackend, 1> {
        let n = values.len();
        Tensor::from_data(TensorData::new(values, [n]), &Default::default())
    }

    #[test]
    fn smooth_l1_is_quadratic_below_one_linear_above() {
        let pred = tensor1(vec![0.5, 3.0]);
        let target = tensor1(vec![0.0, 0.0]);
        let out = smooth_l1(pred, target).into_data().to_vec::<f32>().unwrap();
        assert!((out[0] - 0.125).abs() < 1e-6); // 0.5 * 0.5^2
        assert!((out[1] - 2.5).abs() < 1e-6); // 3.0 - 0.5
    }

    #[test]
    fn bce_ignores_zero_weight_elements() {
        let logits = tensor1(vec![10.0, -50.0]);
        let targets = tensor1(vec![1.0, 1.0]);
        // The badly wrong second element is masked out.
        let weights = tensor1(vec![1.0, 0.0]);
        let loss = scalar(weighted_bce_with_logits(logits, targets, weights));
        assert!(loss < 0.01);
    }

    #[test]
    fn cross_entropy_of_uniform_logits_is_log_classes() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::zeros([2, 4], &device);
        let one_hot = Tensor::from_data(
            TensorData::new(vec![1.0f32, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0], [2, 4]),
            &device,
        );
        let weights = tensor1(vec![1.0, 1.0]);
        let loss = scalar(weighted_cross_entropy(logits, one_hot, weights));
        assert!((loss - 4.0f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn cross_entropy_with_all_rows_masked_is_zero() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::zeros([2, 4], &device);
        let one_hot = Tensor::<TestBackend, 2>::zeros([2, 4], &device);
        let weights = tensor1(vec![0.0, 0.0]);
        let loss = scalar(weighted_cross_entropy(logits, one_hot, weights));
        assert_eq!(loss, 0.0);
    }
}
