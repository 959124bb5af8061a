//! Cardinality error: how far the number of non-empty predictions is from the number of
//! objects. Logging only, it never carries gradients.

use burn::tensor::{backend::Backend, Tensor, TensorData};

/// Mean absolute difference between predicted and true object counts.
///
/// A query counts as a detection when its arg-max class is not the trailing "no-object"
/// class.
///
/// # Shapes
///
/// - logits: `[batch_size, num_queries, num_classes + 1]`
/// - target_lengths: `batch_size` entries
/// - output: `[1]`
pub fn cardinality_error<B: Backend>(logits: Tensor<B, 3>, target_lengths: &[usize]) -> Tensor<B, 1> {
    let [batch_size, num_queries, num_logits] = logits.dims();
    assert_eq!(
        batch_size,
        target_lengths.len(),
        "Expected {batch_size} target lengths, got {}",
        target_lengths.len()
    );
    let device = logits.device();

    let predicted = logits
        .detach()
        .argmax(2)
        .reshape([batch_size, num_queries])
        .not_equal_elem((num_logits - 1) as i64)
        .int()
        .sum_dim(1)
        .float()
        .reshape([batch_size]);

    let lengths = target_lengths
        .iter()
        .map(|&len| len as f32)
        .collect::<Vec<_>>();
    let lengths = Tensor::<B, 1>::from_data(TensorData::new(lengths, [batch_size]), &device);

    (predicted - lengths).abs().mean()
}
