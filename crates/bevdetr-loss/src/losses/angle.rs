//! Heading loss: bin classification plus residual regression inside the true bin.

use burn::{
    config::Config,
    module::{Content, DisplaySettings, Module, ModuleDisplay},
    tensor::{activation, backend::Backend, Int, Tensor},
};

use crate::bundle::DEFAULT_HEADING_BINS;

/// Configuration for creating an [angle loss](AngleLoss).
#[derive(Config, Debug)]
pub struct AngleLossConfig {
    /// Number of heading bins. The orientation output holds this many logits followed by
    /// as many residuals. Default: 12
    #[config(default = "DEFAULT_HEADING_BINS")]
    pub num_heading_bins: usize,
}

impl AngleLossConfig {
    /// Initialize an [angle loss](AngleLoss).
    pub fn init(&self) -> AngleLoss {
        assert!(
            self.num_heading_bins > 0,
            "AngleLoss needs at least one heading bin"
        );
        AngleLoss {
            num_heading_bins: self.num_heading_bins,
        }
    }
}

/// Orientation loss over matched queries.
///
/// Per sample: cross-entropy of the bin logits against the true bin, plus the L1 error of
/// the residual predicted for the true bin. Samples are summed and divided by the
/// denominator.
#[derive(Module, Clone, Debug)]
#[module(custom_display)]
pub struct AngleLoss {
    pub num_heading_bins: usize,
}

impl Default for AngleLoss {
    fn default() -> Self {
        AngleLossConfig::new().init()
    }
}

impl ModuleDisplay for AngleLoss {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        content
            .add("num_heading_bins", &self.num_heading_bins)
            .optional()
    }
}

impl AngleLoss {
    /// # Shapes
    ///
    /// - orientation: `[num_matched, 2 * num_heading_bins]`
    /// - target_bins: `[num_matched]`
    /// - target_residuals: `[num_matched]`
    /// - output: `[1]`
    pub fn forward<B: Backend>(
        &self,
        orientation: Tensor<B, 2>,
        target_bins: Tensor<B, 1, Int>,
        target_residuals: Tensor<B, 1>,
        num_boxes: f64,
    ) -> Tensor<B, 1> {
        self.forward_no_reduction(orientation, target_bins, target_residuals)
            .sum()
            .div_scalar(num_boxes)
    }

    /// Per-sample classification plus residual loss.
    ///
    /// # Shapes
    ///
    /// - output: `[num_matched]`
    pub fn forward_no_reduction<B: Backend>(
        &self,
        orientation: Tensor<B, 2>,
        target_bins: Tensor<B, 1, Int>,
        target_residuals: Tensor<B, 1>,
    ) -> Tensor<B, 1> {
        let [num_matched, channels] = orientation.dims();
        let bins = self.num_heading_bins;
        assert_eq!(
            channels,
            2 * bins,
            "Orientation must hold {} channels, got {channels}",
            2 * bins
        );

        let bin_logits = orientation.clone().narrow(1, 0, bins);
        let residuals = orientation.narrow(1, bins, bins);
        let bin_index = target_bins.reshape([num_matched, 1]);

        let cls_loss = activation::log_softmax(bin_logits, 1)
            .gather(1, bin_index.clone())
            .neg()
            .reshape([num_matched]);

        let one_hot = Tensor::<B, 2>::zeros([num_matched, bins], &residuals.device()).scatter(
            1,
            bin_index,
            Tensor::ones([num_matched, 1], &residuals.device()),
        );
        let selected = (residuals * one_hot).sum_dim(1).reshape([num_matched]);
        let reg_loss = (selected - target_residuals).abs();

        cls_loss + reg_loss
    }
}

#[cfg(test)]
mod tests {
    use burn::tensor::{ops::FloatElem, TensorData, Tolerance, Transaction};

    use super::*;
    use crate::tests::TestBackend;

    type FT = FloatElem<TestBackend>;

    fn orientation(true_bin: usize, confidence: f32, residual: f32) -> [f32; 24] {
        let mut row = [0.0; 24];
        row[true_bin] = confidence;
        row[12 + true_bin] = residual;
        // Residuals of other bins must not leak into the loss.
        row[12 + (true_bin + 1) % 12] = 7.0;
        row
    }

    #[test]
    fn angle_loss_vanishes_for_confident_exact_prediction() {
        let device = Default::default();
        let loss = AngleLoss::default();

        let orientation = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([orientation(3, 50.0, 0.25), orientation(11, 50.0, -0.1)]),
            &device,
        );
        let bins = Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([3, 11]), &device);
        let residuals =
            Tensor::<TestBackend, 1>::from_data(TensorData::from([0.25, -0.1]), &device);

        loss.forward(orientation, bins, residuals, 2.0)
            .into_data()
            .assert_approx_eq::<FT>(&TensorData::from([0.0]), Tolerance::absolute(1e-5));
    }

    #[test]
    fn angle_loss_adds_classification_and_residual_terms() {
        let device = Default::default();
        let loss = AngleLoss::default();

        // Uniform logits cost ln(12); residual is off by 0.5.
        let orientation = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([orientation(0, 0.0, 0.5)]),
            &device,
        );
        let bins = Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([0]), &device);
        let residuals = Tensor::<TestBackend, 1>::from_data(TensorData::from([0.0]), &device);

        let per_sample =
            loss.forward_no_reduction(orientation.clone(), bins.clone(), residuals.clone());
        let reduced = loss.forward(orientation, bins, residuals, 2.0);

        let [per_sample, reduced] = Transaction::default()
            .register(per_sample)
            .register(reduced)
            .execute()
            .try_into()
            .expect("Correct amount of tensor data");

        let expected = 12.0_f32.ln() + 0.5;
        per_sample.assert_approx_eq::<FT>(&TensorData::from([expected]), Tolerance::default());
        reduced.assert_approx_eq::<FT>(&TensorData::from([expected / 2.0]), Tolerance::default());
    }

    #[test]
    #[should_panic = "Orientation must hold 24 channels"]
    fn angle_loss_rejects_wrong_channel_count() {
        let device = Default::default();
        let loss = AngleLoss::default();

        let _ = loss.forward_no_reduction(
            Tensor::<TestBackend, 2>::zeros([1, 12], &device),
            Tensor::<TestBackend, 1, Int>::zeros([1], &device),
            Tensor::<TestBackend, 1>::zeros([1], &device),
        );
    }
}
