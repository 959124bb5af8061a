//! L1 regression of BEV points.
//!
//! The center, head and feet predictions are all regressed onto the same BEV target.

use burn::tensor::{backend::Backend, Tensor};

/// Summed L1 distance between matched BEV points, divided by the denominator.
///
/// # Shapes
///
/// - predictions: `[num_matched, 2]`
/// - targets: `[num_matched, 2]`
/// - output: `[1]`
pub fn bev_point_loss<B: Backend>(
    predictions: Tensor<B, 2>,
    targets: Tensor<B, 2>,
    num_boxes: f64,
) -> Tensor<B, 1> {
    (predictions - targets).abs().sum().div_scalar(num_boxes)
}
