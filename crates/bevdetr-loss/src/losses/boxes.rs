//! L1 and GIoU regression of matched 2D boxes.

use burn::tensor::{backend::Backend, Tensor};

use crate::box_ops::{box_cxcywh_to_xyxy, paired_generalized_box_iou};

/// Box regression terms of the matched pairs.
#[derive(Debug, Clone)]
pub struct BoxLosses<B: Backend> {
    /// Summed L1 distance over the four coordinates, divided by the denominator.
    pub l1: Tensor<B, 1>,
    /// Summed `1 - GIoU`, divided by the denominator.
    pub giou: Tensor<B, 1>,
}

/// Compute the box losses of matched `(cx, cy, w, h)` boxes.
///
/// # Shapes
///
/// - predictions: `[num_matched, 4]`
/// - targets: `[num_matched, 4]`
pub fn box_losses<B: Backend>(
    predictions: Tensor<B, 2>,
    targets: Tensor<B, 2>,
    num_boxes: f64,
) -> BoxLosses<B> {
    let l1 = (predictions.clone() - targets.clone())
        .abs()
        .sum()
        .div_scalar(num_boxes);

    let giou = paired_generalized_box_iou(box_cxcywh_to_xyxy(predictions), box_cxcywh_to_xyxy(targets));
    let giou = giou.neg().add_scalar(1.0).sum().div_scalar(num_boxes);

    BoxLosses { l1, giou }
}
