//! Box encoding conversions and IoU-family metrics.
//!
//! Boxes are stored along the last tensor dimension, either as
//! `(center_x, center_y, w, h)` or as corners `(x0, y0, x1, y1)`.
//! All functions are pure tensor maps and carry gradients through.

use burn::tensor::{backend::Backend, Tensor};

/// Floor applied to union and enclosing areas so degenerate boxes never divide by zero.
const AREA_EPS: f64 = 1e-7;

fn coords<B: Backend, const D: usize>(boxes: Tensor<B, D>) -> [Tensor<B, D>; 4] {
    let dim = D - 1;
    [
        boxes.clone().narrow(dim, 0, 1),
        boxes.clone().narrow(dim, 1, 1),
        boxes.clone().narrow(dim, 2, 1),
        boxes.narrow(dim, 3, 1),
    ]
}

/// Convert `(cx, cy, w, h)` boxes to `(x0, y0, x1, y1)`.
///
/// # Shapes
///
/// - boxes: `[..., 4]`
/// - output: `[..., 4]`
pub fn box_cxcywh_to_xyxy<B: Backend, const D: usize>(boxes: Tensor<B, D>) -> Tensor<B, D> {
    let [cx, cy, w, h] = coords(boxes);
    let half_w = w.mul_scalar(0.5);
    let half_h = h.mul_scalar(0.5);
    Tensor::cat(
        vec![
            cx.clone() - half_w.clone(),
            cy.clone() - half_h.clone(),
            cx + half_w,
            cy + half_h,
        ],
        D - 1,
    )
}

/// Convert `(x0, y0, x1, y1)` boxes to `(cx, cy, w, h)`.
///
/// # Shapes
///
/// - boxes: `[..., 4]`
/// - output: `[..., 4]`
pub fn box_xyxy_to_cxcywh<B: Backend, const D: usize>(boxes: Tensor<B, D>) -> Tensor<B, D> {
    let [x0, y0, x1, y1] = coords(boxes);
    Tensor::cat(
        vec![
            (x0.clone() + x1.clone()).mul_scalar(0.5),
            (y0.clone() + y1.clone()).mul_scalar(0.5),
            x1 - x0,
            y1 - y0,
        ],
        D - 1,
    )
}

/// Area of corner-form boxes, with negative extents clamped to zero.
///
/// # Shapes
///
/// - boxes: `[..., 4]`
/// - output: `[..., 1]`
pub fn box_area<B: Backend, const D: usize>(boxes: Tensor<B, D>) -> Tensor<B, D> {
    let [x0, y0, x1, y1] = coords(boxes);
    (x1 - x0).clamp_min(0.0) * (y1 - y0).clamp_min(0.0)
}

/// IoU and GIoU of two equally shaped sets of corner-form boxes, paired element by element.
/// Returns `(iou, giou)`, both of shape `[..., 1]`.
fn aligned_ious<B: Backend, const D: usize>(
    boxes1: Tensor<B, D>,
    boxes2: Tensor<B, D>,
) -> (Tensor<B, D>, Tensor<B, D>) {
    let area1 = box_area(boxes1.clone());
    let area2 = box_area(boxes2.clone());

    let [ax0, ay0, ax1, ay1] = coords(boxes1);
    let [bx0, by0, bx1, by1] = coords(boxes2);

    let inter_w = (ax1.clone().min_pair(bx1.clone()) - ax0.clone().max_pair(bx0.clone()))
        .clamp_min(0.0);
    let inter_h = (ay1.clone().min_pair(by1.clone()) - ay0.clone().max_pair(by0.clone()))
        .clamp_min(0.0);
    let inter = inter_w * inter_h;
    let union = area1 + area2 - inter.clone();
    let iou = inter / union.clone().clamp_min(AREA_EPS);

    let hull_w = (ax1.max_pair(bx1) - ax0.min_pair(bx0)).clamp_min(0.0);
    let hull_h = (ay1.max_pair(by1) - ay0.min_pair(by0)).clamp_min(0.0);
    let hull = hull_w * hull_h;

    let giou = iou.clone() - (hull.clone() - union) / hull.clamp_min(AREA_EPS);
    (iou, giou)
}

/// Pairwise IoU between two sets of corner-form boxes.
///
/// # Shapes
///
/// - boxes1: `[N, 4]`
/// - boxes2: `[M, 4]`
/// - output: `[N, M]`
pub fn box_iou<B: Backend>(boxes1: Tensor<B, 2>, boxes2: Tensor<B, 2>) -> Tensor<B, 2> {
    let [n, _] = boxes1.dims();
    let [m, _] = boxes2.dims();
    let (iou, _) = aligned_ious(
        boxes1.unsqueeze_dim::<3>(1).expand([n, m, 4]),
        boxes2.unsqueeze_dim::<3>(0).expand([n, m, 4]),
    );
    iou.reshape([n, m])
}

/// Pairwise generalized IoU between two sets of corner-form boxes.
///
/// GIoU is the IoU minus the share of the smallest enclosing box not covered by the union;
/// it lies in `(-1, 1]` and equals 1 only for identical non-degenerate boxes.
///
/// # Shapes
///
/// - boxes1: `[N, 4]`
/// - boxes2: `[M, 4]`
/// - output: `[N, M]`
pub fn generalized_box_iou<B: Backend>(boxes1: Tensor<B, 2>, boxes2: Tensor<B, 2>) -> Tensor<B, 2> {
    let [n, _] = boxes1.dims();
    let [m, _] = boxes2.dims();
    let (_, giou) = aligned_ious(
        boxes1.unsqueeze_dim::<3>(1).expand([n, m, 4]),
        boxes2.unsqueeze_dim::<3>(0).expand([n, m, 4]),
    );
    giou.reshape([n, m])
}

/// Generalized IoU of matched box pairs, i.e. the diagonal of [`generalized_box_iou`]
/// without building the full matrix.
///
/// # Shapes
///
/// - boxes1: `[N, 4]`
/// - boxes2: `[N, 4]`
/// - output: `[N]`
pub fn paired_generalized_box_iou<B: Backend>(
    boxes1: Tensor<B, 2>,
    boxes2: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let [n, _] = boxes1.dims();
    let (_, giou) = aligned_ious(boxes1, boxes2);
    giou.reshape([n])
}
