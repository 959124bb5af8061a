//! Instance mask losses: sigmoid focal loss and soft dice loss.

use burn::{
    config::Config,
    module::{Content, DisplaySettings, Module, ModuleDisplay},
    tensor::{activation, backend::Backend, Int, Tensor, TensorData},
};

use crate::bundle::TargetMasks;

/// Configuration for creating a [mask loss](MaskLoss).
#[derive(Config, Debug)]
pub struct MaskLossConfig {
    /// Balance between positive and negative pixels; negative disables it. Default: 0.25
    #[config(default = 0.25)]
    pub alpha: f64,
    /// Focusing exponent that down-weights easy pixels. Default: 2.0
    #[config(default = 2.0)]
    pub gamma: f64,
}

impl MaskLossConfig {
    /// Initialize a [mask loss](MaskLoss).
    pub fn init(&self) -> MaskLoss {
        assert!(
            self.alpha <= 1.0,
            "Focal alpha for MaskLoss must not exceed 1, got {}",
            self.alpha
        );
        assert!(
            self.gamma >= 0.0,
            "Focal gamma for MaskLoss must be non-negative, got {}",
            self.gamma
        );
        MaskLoss {
            alpha: self.alpha,
            gamma: self.gamma,
        }
    }
}

/// The two mask terms of the matched pairs.
#[derive(Debug, Clone)]
pub struct MaskLosses<B: Backend> {
    pub focal: Tensor<B, 1>,
    pub dice: Tensor<B, 1>,
}

/// Focal and dice loss between predicted mask logits and binary target masks.
#[derive(Module, Clone, Debug)]
#[module(custom_display)]
pub struct MaskLoss {
    pub alpha: f64,
    pub gamma: f64,
}

impl Default for MaskLoss {
    fn default() -> Self {
        MaskLossConfig::new().init()
    }
}

impl ModuleDisplay for MaskLoss {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        content
            .add("alpha", &self.alpha)
            .add("gamma", &self.gamma)
            .optional()
    }
}

impl MaskLoss {
    /// Resize predicted logits to the target resolution and compute both terms.
    ///
    /// # Shapes
    ///
    /// - pred_masks: `[num_matched, h, w]`
    /// - target_masks: `[num_matched, height, width]`
    pub fn forward<B: Backend>(
        &self,
        pred_masks: Tensor<B, 3>,
        target_masks: Tensor<B, 3>,
        num_boxes: f64,
    ) -> MaskLosses<B> {
        let [num_matched, height, width] = target_masks.dims();
        let [_, pred_height, pred_width] = pred_masks.dims();

        let logits = if [pred_height, pred_width] == [height, width] {
            pred_masks
        } else {
            resize_bilinear(pred_masks, [height, width])
        };

        let logits = logits.reshape([num_matched, height * width]);
        let targets = target_masks.reshape([num_matched, height * width]);

        MaskLosses {
            focal: self.sigmoid_focal_loss(logits.clone(), targets.clone(), num_boxes),
            dice: dice_loss(logits, targets, num_boxes),
        }
    }

    /// Focal loss, averaged over pixels and summed over masks, divided by the denominator.
    ///
    /// # Shapes
    ///
    /// - logits: `[num_masks, pixels]`
    /// - targets: `[num_masks, pixels]`
    /// - output: `[1]`
    pub fn sigmoid_focal_loss<B: Backend>(
        &self,
        logits: Tensor<B, 2>,
        targets: Tensor<B, 2>,
        num_boxes: f64,
    ) -> Tensor<B, 1> {
        let prob = activation::sigmoid(logits.clone());

        // Binary cross-entropy on logits, stable for large magnitudes.
        let ce = logits.clone().clamp_min(0.0) - logits.clone() * targets.clone()
            + logits.abs().neg().exp().log1p();

        let p_t = prob.clone() * targets.clone()
            + prob.neg().add_scalar(1.0) * targets.clone().neg().add_scalar(1.0);
        let mut loss = ce * p_t.neg().add_scalar(1.0).powf_scalar(self.gamma);

        if self.alpha >= 0.0 {
            let alpha_t = targets.clone().mul_scalar(self.alpha)
                + targets.neg().add_scalar(1.0).mul_scalar(1.0 - self.alpha);
            loss = loss * alpha_t;
        }

        loss.mean_dim(1).sum().div_scalar(num_boxes)
    }
}

/// Soft dice loss `1 - (2 * |p t| + 1) / (|p| + |t| + 1)` per mask, summed and divided by
/// the denominator.
///
/// # Shapes
///
/// - logits: `[num_masks, pixels]`
/// - targets: `[num_masks, pixels]`
/// - output: `[1]`
pub fn dice_loss<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 2>, num_boxes: f64) -> Tensor<B, 1> {
    let prob = activation::sigmoid(logits);
    let numerator = (prob.clone() * targets.clone()).sum_dim(1).mul_scalar(2.0);
    let denominator = prob.sum_dim(1) + targets.sum_dim(1);

    let ratio = numerator.add_scalar(1.0) / denominator.add_scalar(1.0);
    ratio.neg().add_scalar(1.0).sum().div_scalar(num_boxes)
}

/// Stack the target masks of the matched pairs, zero-padded to the largest mask size of
/// the batch.
///
/// Returns the row-major data and the `[num_matched, height, width]` shape.
pub fn stack_target_masks(
    masks: &[&TargetMasks],
    pairs: impl Iterator<Item = (usize, usize)>,
) -> (Vec<f32>, [usize; 3]) {
    let height = masks.iter().map(|m| m.height).max().unwrap_or(0);
    let width = masks.iter().map(|m| m.width).max().unwrap_or(0);

    let mut data = Vec::new();
    let mut count = 0;
    for (image, target) in pairs {
        let source = masks[image];
        let mut plane = vec![0.0_f32; height * width];
        for (row, values) in source.mask(target).chunks(source.width.max(1)).enumerate() {
            plane[row * width..row * width + values.len()].copy_from_slice(values);
        }
        data.extend(plane);
        count += 1;
    }

    (data, [count, height, width])
}

/// Bilinear resize with pixel centers aligned (half-pixel sampling grid).
///
/// Source coordinates below zero clamp to the first pixel, so borders replicate.
///
/// # Shapes
///
/// - masks: `[num_masks, height, width]`
/// - output: `[num_masks, size[0], size[1]]`
pub fn resize_bilinear<B: Backend>(masks: Tensor<B, 3>, size: [usize; 2]) -> Tensor<B, 3> {
    let masks = resize_axis(masks, 1, size[0]);
    resize_axis(masks, 2, size[1])
}

fn resize_axis<B: Backend>(tensor: Tensor<B, 3>, dim: usize, output: usize) -> Tensor<B, 3> {
    let input = tensor.dims()[dim];
    if input == output {
        return tensor;
    }
    let device = tensor.device();
    let scale = input as f32 / output as f32;

    let mut lower = Vec::with_capacity(output);
    let mut upper = Vec::with_capacity(output);
    let mut weights = Vec::with_capacity(output);
    for index in 0..output {
        let source = ((index as f32 + 0.5) * scale - 0.5).max(0.0);
        let low = (source.floor() as usize).min(input - 1);
        lower.push(low as i64);
        upper.push((low + 1).min(input - 1) as i64);
        weights.push(source - low as f32);
    }

    let lower = Tensor::<B, 1, Int>::from_data(TensorData::new(lower, [output]), &device);
    let upper = Tensor::<B, 1, Int>::from_data(TensorData::new(upper, [output]), &device);
    let mut shape = [1; 3];
    shape[dim] = output;
    let weights =
        Tensor::<B, 1>::from_data(TensorData::new(weights, [output]), &device).reshape(shape);

    let low = tensor.clone().select(dim, lower);
    let high = tensor.select(dim, upper);
    let weights = weights.expand(low.dims());
    low.clone() + (high - low) * weights
}

#[cfg(test)]
mod tests {
    use burn::tensor::{ops::FloatElem, TensorData, Tolerance, Transaction};

    use super::*;
    use crate::tests::TestBackend;

    type FT = FloatElem<TestBackend>;

    #[test]
    fn mask_losses_on_uncertain_logits() {
        let device = Default::default();
        let loss = MaskLoss::default();

        // Zero logits upsampled from 2x2 stay zero: p = 0.5 everywhere.
        let pred = Tensor::<TestBackend, 3>::zeros([1, 2, 2], &device);
        let target = Tensor::<TestBackend, 3>::ones([1, 4, 4], &device);

        let losses = loss.forward(pred, target, 1.0);
        let [focal, dice] = Transaction::default()
            .register(losses.focal)
            .register(losses.dice)
            .execute()
            .try_into()
            .expect("Correct amount of tensor data");

        let ln2 = 2.0_f32.ln();
        focal.assert_approx_eq::<FT>(
            &TensorData::from([0.25 * 0.25 * ln2]),
            Tolerance::default(),
        );
        dice.assert_approx_eq::<FT>(&TensorData::from([8.0 / 25.0]), Tolerance::default());
    }

    #[test]
    fn mask_losses_vanish_for_confident_correct_logits() {
        let device = Default::default();
        let loss = MaskLoss::default();

        let target = Tensor::<TestBackend, 3>::from_data(
            TensorData::from([[[1.0, 0.0], [0.0, 1.0]]]),
            &device,
        );
        let pred = target.clone().mul_scalar(60.0).sub_scalar(30.0);

        let losses = loss.forward(pred, target, 1.0);

        losses
            .focal
            .into_data()
            .assert_approx_eq::<FT>(&TensorData::from([0.0]), Tolerance::absolute(1e-5));
        // Dice keeps the smoothing term: 1 - 5 / 5.
        losses
            .dice
            .into_data()
            .assert_approx_eq::<FT>(&TensorData::from([0.0]), Tolerance::absolute(1e-5));
    }

    #[test]
    fn resize_samples_pixel_centers() {
        let device = Default::default();
        let masks = Tensor::<TestBackend, 3>::from_data(
            TensorData::from([[[0.0, 1.0], [2.0, 3.0]]]),
            &device,
        );

        let resized = resize_bilinear(masks, [2, 4]);

        resized.into_data().assert_approx_eq::<FT>(
            &TensorData::from([[[0.0, 0.25, 0.75, 1.0], [2.0, 2.25, 2.75, 3.0]]]),
            Tolerance::default(),
        );
    }

    #[test]
    fn resize_downsamples_between_centers() {
        let device = Default::default();
        let masks = Tensor::<TestBackend, 3>::from_data(
            TensorData::from([[[0.0, 1.0, 2.0, 3.0]]]),
            &device,
        );

        resize_bilinear(masks, [1, 2])
            .into_data()
            .assert_approx_eq::<FT>(&TensorData::from([[[0.5, 2.5]]]), Tolerance::default());
    }

    #[test]
    fn stack_target_masks_pads_to_largest_mask() {
        let small = TargetMasks::new(1, 2, vec![1.0, 1.0]);
        let large = TargetMasks::new(2, 3, vec![0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);

        let (data, shape) = stack_target_masks(&[&small, &large], [(1, 0), (0, 0)].into_iter());

        assert_eq!(shape, [2, 2, 3]);
        assert_eq!(
            data,
            vec![
                0.0, 1.0, 0.0, 1.0, 0.0, 1.0, //
                1.0, 1.0, 0.0, 0.0, 0.0, 0.0,
            ]
        );
    }
}
