//! Relative L1 regression of object footprint dimensions.

use burn::tensor::{backend::Backend, ElementConversion, Tensor};

/// Relative L1 loss rescaled to the magnitude of a plain L1 loss.
///
/// The per-element error is `|pred - target| / target`. It is multiplied by a
/// compensation factor `mean(|pred - target|) / mean(|pred - target| / target)` computed on
/// detached values, so the gradient keeps the relative direction while the value stays
/// comparable to the other L1 terms. The factor is 1 when the relative error is zero.
///
/// # Shapes
///
/// - predictions: `[num_matched, 2]`
/// - targets: `[num_matched, 2]`, strictly positive
/// - output: `[1]`
pub fn dimension_loss<B: Backend>(
    predictions: Tensor<B, 2>,
    targets: Tensor<B, 2>,
    num_boxes: f64,
) -> Tensor<B, 1> {
    let absolute = (predictions - targets.clone()).abs();
    let relative = absolute.clone() / targets;

    let plain_mean = absolute.detach().mean().into_scalar().elem::<f64>();
    let relative_mean = relative.clone().detach().mean().into_scalar().elem::<f64>();
    let compensation = if relative_mean > 0.0 {
        plain_mean / relative_mean
    } else {
        1.0
    };

    relative
        .mul_scalar(compensation)
        .sum()
        .div_scalar(num_boxes)
}

#[cfg(test)]
mod tests {
    use burn::tensor::{ops::FloatElem, TensorData, Tolerance};

    use super::*;
    use crate::tests::{TestAutodiffBackend, TestBackend};

    type FT = FloatElem<TestBackend>;

    #[test]
    fn dimension_loss_matches_plain_l1_magnitude() {
        let device = Default::default();
        let predictions =
            Tensor::<TestBackend, 2>::from_data(TensorData::from([[2.0, 1.0], [4.0, 4.0]]), &device);
        let targets =
            Tensor::<TestBackend, 2>::from_data(TensorData::from([[1.0, 1.0], [2.0, 4.0]]), &device);

        // Compensated relative error sums to the plain L1 sum: |1| + |2| = 3.
        dimension_loss(predictions, targets, 1.0)
            .into_data()
            .assert_approx_eq::<FT>(&TensorData::from([3.0]), Tolerance::default());
    }

    #[test]
    fn dimension_loss_is_zero_for_exact_prediction() {
        let device = Default::default();
        let dims = Tensor::<TestBackend, 2>::from_data(TensorData::from([[1.5, 0.5]]), &device);

        dimension_loss(dims.clone(), dims, 1.0)
            .into_data()
            .assert_approx_eq::<FT>(&TensorData::from([0.0]), Tolerance::default());
    }

    #[test]
    fn dimension_loss_gradient_follows_relative_error() {
        type B = TestAutodiffBackend;
        let device = Default::default();
        let predictions =
            Tensor::<B, 2>::from_data(TensorData::from([[2.0, 8.0]]), &device).require_grad();
        let targets = Tensor::<B, 2>::from_data(TensorData::from([[1.0, 4.0]]), &device);

        let grads = dimension_loss(predictions.clone(), targets, 1.0).backward();
        let grad = predictions.grad(&grads).expect("gradient");

        // Relative mean 1, plain mean 2.5: d/dpred = 2.5 / target.
        grad.into_data()
            .assert_approx_eq::<FT>(&TensorData::from([[2.5, 0.625]]), Tolerance::default());
    }
}
