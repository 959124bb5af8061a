//! Classification loss over every query, including the "no-object" class.

use burn::{
    config::Config,
    module::{Content, DisplaySettings, Module, ModuleDisplay},
    nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig},
    tensor::{backend::Backend, Int, Tensor},
};

/// Configuration for creating a [labels loss](LabelsLoss).
#[derive(Config, Debug)]
pub struct LabelsLossConfig {
    /// Number of object classes, without the "no-object" class.
    pub num_classes: usize,
    /// Relative weight of the "no-object" class. Default: 0.1
    #[config(default = 0.1)]
    pub eos_coef: f64,
}

impl LabelsLossConfig {
    /// Initialize a [labels loss](LabelsLoss).
    ///
    /// The class weights are fixed here: one for every object class, `eos_coef` for the
    /// trailing "no-object" class.
    pub fn init<B: Backend>(&self, device: &B::Device) -> LabelsLoss<B> {
        self.assertions();

        let mut weights = vec![1.0_f32; self.num_classes + 1];
        weights[self.num_classes] = self.eos_coef as f32;

        LabelsLoss {
            cross_entropy: CrossEntropyLossConfig::new()
                .with_weights(Some(weights))
                .init(device),
            num_classes: self.num_classes,
            eos_coef: self.eos_coef,
        }
    }

    fn assertions(&self) {
        assert!(
            self.num_classes > 0,
            "LabelsLoss needs at least one object class"
        );
        assert!(
            (0.0..=1.0).contains(&self.eos_coef) && self.eos_coef > 0.0,
            "No-object weight for LabelsLoss must be in (0, 1], got {}",
            self.eos_coef
        );
    }
}

/// Weighted cross-entropy between class logits and per-query class targets.
///
/// Unmatched queries are supervised towards the "no-object" class `num_classes`, whose
/// weight is down-scaled by `eos_coef` to balance the many empty queries.
#[derive(Module, Debug)]
#[module(custom_display)]
pub struct LabelsLoss<B: Backend> {
    cross_entropy: CrossEntropyLoss<B>,
    /// Number of object classes.
    pub num_classes: usize,
    /// Weight of the "no-object" class.
    pub eos_coef: f64,
}

impl<B: Backend> ModuleDisplay for LabelsLoss<B> {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        content
            .add("num_classes", &self.num_classes)
            .add("eos_coef", &self.eos_coef)
            .optional()
    }
}

impl<B: Backend> LabelsLoss<B> {
    /// Weighted mean cross-entropy over all queries of the batch.
    ///
    /// # Shapes
    ///
    /// - logits: `[batch_size, num_queries, num_classes + 1]`
    /// - target_classes: `[batch_size, num_queries]`
    /// - output: `[1]`
    pub fn forward(&self, logits: Tensor<B, 3>, target_classes: Tensor<B, 2, Int>) -> Tensor<B, 1> {
        let [batch_size, num_queries, num_logits] = logits.dims();
        let target_dims = target_classes.dims();
        assert_eq!(
            [batch_size, num_queries],
            target_dims,
            "Shape of target classes ({target_dims:?}) must match the query grid ({:?})",
            [batch_size, num_queries]
        );
        assert_eq!(
            num_logits,
            self.num_classes + 1,
            "Expected {} logits per query, got {num_logits}",
            self.num_classes + 1
        );

        let flat = batch_size * num_queries;
        self.cross_entropy
            .forward(logits.reshape([flat, num_logits]), target_classes.reshape([flat]))
    }
}

/// Top-1 classification error in percent over the matched queries.
///
/// Returns 100 when nothing is matched. No gradient flows through the result.
///
/// # Shapes
///
/// - matched_logits: `[num_matched, num_classes + 1]`
/// - matched_labels: `[num_matched]`
/// - output: `[1]`
pub fn class_error<B: Backend>(
    matched_logits: Tensor<B, 2>,
    matched_labels: Tensor<B, 1, Int>,
) -> Tensor<B, 1> {
    let [num_matched, _] = matched_logits.dims();
    if num_matched == 0 {
        return Tensor::full([1], 100.0, &matched_logits.device());
    }

    let correct = matched_logits
        .detach()
        .argmax(1)
        .reshape([num_matched])
        .equal(matched_labels)
        .int()
        .sum()
        .float();

    correct.mul_scalar(-100.0 / num_matched as f64).add_scalar(100.0)
}

#[cfg(test)]
mod tests {
    use burn::tensor::{ops::FloatElem, TensorData, Tolerance, Transaction};

    use super::*;
    use crate::tests::TestBackend;

    type FT = FloatElem<TestBackend>;

    #[test]
    fn labels_loss_weights_no_object_class() {
        let device = Default::default();
        let loss = LabelsLossConfig::new(2).with_eos_coef(0.5).init::<TestBackend>(&device);

        let logits = Tensor::<TestBackend, 3>::from_data(
            TensorData::from([[[0.0, 0.0, 0.0], [0.0, 0.0, 0.0]]]),
            &device,
        );
        let targets =
            Tensor::<TestBackend, 2, Int>::from_data(TensorData::from([[1, 2]]), &device);

        // Uniform logits: every query costs ln(3); weighting cannot change a constant mean.
        let uniform = loss.forward(logits, targets.clone());

        // Query 0 (weight 1) is confident and right, query 1 (weight 0.5) is uniform.
        let logits = Tensor::<TestBackend, 3>::from_data(
            TensorData::from([[[0.0, 20.0, 0.0], [0.0, 0.0, 0.0]]]),
            &device,
        );
        let mixed = loss.forward(logits, targets);

        let [uniform, mixed] = Transaction::default()
            .register(uniform)
            .register(mixed)
            .execute()
            .try_into()
            .expect("Correct amount of tensor data");

        let ln3 = 3.0_f32.ln();
        uniform.assert_approx_eq::<FT>(&TensorData::from([ln3]), Tolerance::default());
        mixed.assert_approx_eq::<FT>(
            &TensorData::from([0.5 * ln3 / 1.5]),
            Tolerance::absolute(1e-5),
        );
    }

    #[test]
    fn class_error_counts_wrong_top1() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[3.0, 0.0, 0.0], [0.0, 3.0, 0.0], [0.0, 0.0, 3.0], [3.0, 0.0, 0.0]]),
            &device,
        );
        let labels = Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([0, 1, 0, 1]), &device);

        class_error(logits, labels)
            .into_data()
            .assert_approx_eq::<FT>(&TensorData::from([50.0]), Tolerance::default());
    }

    #[test]
    #[should_panic = "No-object weight for LabelsLoss must be in (0, 1]"]
    fn labels_loss_config_rejects_zero_eos_coef() {
        let device = Default::default();
        let _loss = LabelsLossConfig::new(3)
            .with_eos_coef(0.0)
            .init::<TestBackend>(&device);
    }
}
