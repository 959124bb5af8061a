//! Per-task loss functions.
//!
//! Every function here works on tensors that were already gathered for the matched
//! `(query, target)` pairs; [`MatchedPairs`] does the gathering.

mod angle;
mod boxes;
mod cardinality;
mod depth;
mod dimension;
mod labels;
mod masks;
mod points;

pub use angle::*;
pub use boxes::*;
pub use cardinality::*;
pub use depth::*;
pub use dimension::*;
pub use labels::*;
pub use masks::*;
pub use points::*;

use burn::tensor::{backend::Backend, Int, Tensor, TensorData};

use crate::{
    bundle::{ObjectTargets, TargetField},
    error::{CriterionError, CriterionResult},
    matcher::Assignment,
    LossKind,
};

/// Flattened view of the assignments of a batch.
///
/// Pair `k` links query `queries[k]` of image `images[k]` to target `targets[k]` of the
/// same image. Pairs are ordered by image, then by query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchedPairs {
    num_queries: usize,
    images: Vec<usize>,
    queries: Vec<usize>,
    targets: Vec<usize>,
}

impl MatchedPairs {
    pub fn new(assignments: &[Assignment], num_queries: usize) -> Self {
        let mut pairs = Self {
            num_queries,
            ..Self::default()
        };
        for (image, assignment) in assignments.iter().enumerate() {
            for (query, target) in assignment.pairs() {
                pairs.images.push(image);
                pairs.queries.push(query);
                pairs.targets.push(target);
            }
        }
        pairs
    }

    /// Number of matched pairs over the whole batch.
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Row of every matched query in the `[batch_size * num_queries]` flattening.
    pub fn flat_query_indices(&self) -> Vec<usize> {
        self.images
            .iter()
            .zip(&self.queries)
            .map(|(image, query)| image * self.num_queries + query)
            .collect()
    }

    fn index_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 1, Int> {
        let indices = self
            .flat_query_indices()
            .into_iter()
            .map(|index| index as i64)
            .collect::<Vec<_>>();
        Tensor::from_data(TensorData::new(indices, [self.len()]), device)
    }

    /// Rows of `predictions` belonging to the matched queries.
    ///
    /// # Shapes
    ///
    /// - predictions: `[batch_size, num_queries, channels]`
    /// - output: `[num_matched, channels]`
    pub fn gather<B: Backend>(&self, predictions: Tensor<B, 3>) -> Tensor<B, 2> {
        let [batch_size, num_queries, channels] = predictions.dims();
        let indices = self.index_tensor(&predictions.device());
        predictions
            .reshape([batch_size * num_queries, channels])
            .select(0, indices)
    }

    /// Planes of `masks` belonging to the matched queries.
    ///
    /// # Shapes
    ///
    /// - masks: `[batch_size, num_queries, height, width]`
    /// - output: `[num_matched, height, width]`
    pub fn gather_masks<B: Backend>(&self, masks: Tensor<B, 4>) -> Tensor<B, 3> {
        let [batch_size, num_queries, height, width] = masks.dims();
        let indices = self.index_tensor(&masks.device());
        masks
            .reshape([batch_size * num_queries, height, width])
            .select(0, indices)
    }

    /// `(image, target)` of every pair.
    pub fn target_refs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.images.iter().copied().zip(self.targets.iter().copied())
    }

    /// Collect one target field for every pair, in pair order.
    ///
    /// Every image must carry the field, including images without objects.
    pub(crate) fn collect<T: Clone>(
        &self,
        targets: &[ObjectTargets],
        field: TargetField,
        consumer: LossKind,
        get: impl Fn(&ObjectTargets) -> Option<&Vec<T>>,
    ) -> CriterionResult<Vec<T>> {
        let per_image = require_target(targets, field, consumer, &get)?;
        self.target_refs()
            .map(|(image, target)| {
                per_image[image]
                    .get(target)
                    .cloned()
                    .ok_or_else(|| CriterionError::ShapeMismatch {
                        field: format!("targets[{image}].{field}"),
                        expected: format!("at least {} entries", target + 1),
                        actual: format!("{} entries", per_image[image].len()),
                    })
            })
            .collect()
    }
}

/// The field of every image, failing on the first image that lacks it.
fn require_target<'a, T>(
    targets: &'a [ObjectTargets],
    field: TargetField,
    consumer: LossKind,
    get: impl Fn(&'a ObjectTargets) -> Option<&'a Vec<T>>,
) -> CriterionResult<Vec<&'a Vec<T>>> {
    targets
        .iter()
        .enumerate()
        .map(|(image, target)| {
            get(target).ok_or_else(|| CriterionError::missing_target(field, image, consumer))
        })
        .collect()
}

/// A scalar zero, returned by regression losses when nothing is matched.
pub(crate) fn zero_loss<B: Backend>(device: &B::Device) -> Tensor<B, 1> {
    Tensor::zeros([1], device)
}

/// Host rows of `N` floats to a `[rows, N]` tensor.
pub(crate) fn rows_to_tensor<B: Backend, const N: usize>(
    rows: Vec<[f32; N]>,
    device: &B::Device,
) -> Tensor<B, 2> {
    let count = rows.len();
    let values = rows.into_iter().flatten().collect::<Vec<_>>();
    Tensor::from_data(TensorData::new(values, [count, N]), device)
}
