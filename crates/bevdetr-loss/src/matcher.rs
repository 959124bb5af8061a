//! Optimal bipartite matching between predicted queries and ground-truth objects.
//!
//! The cost of assigning query `q` to object `t` is
//!
//! ```text
//! cost = cost_bbox * L1(box_q, box_t) - cost_class * p_q(label_t) - cost_giou * GIoU(box_q, box_t)
//! ```
//!
//! Only class and 2D box geometry enter the cost. The 3D heads are supervised through
//! the resulting assignment but never influence it.

use burn::{
    config::Config,
    module::{Content, DisplaySettings, Module, ModuleDisplay},
    tensor::{activation, backend::Backend, Int, Tensor, TensorData},
};

use crate::{
    box_ops::{box_cxcywh_to_xyxy, generalized_box_iou},
    bundle::{ObjectTargets, OutputField, PredictionBundle, TargetField},
    error::{CriterionError, CriterionResult},
};

const CONSUMER: &str = "matcher";

/// One image's matching: `prediction_indices[k]` is assigned to `target_indices[k]`.
///
/// Pairs are sorted by prediction index. Every target index appears exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    pub prediction_indices: Vec<usize>,
    pub target_indices: Vec<usize>,
}

impl Assignment {
    pub fn len(&self) -> usize {
        self.prediction_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prediction_indices.is_empty()
    }

    /// `(prediction, target)` pairs.
    pub fn pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.prediction_indices
            .iter()
            .copied()
            .zip(self.target_indices.iter().copied())
    }
}

/// Configuration for creating a [Hungarian matcher](HungarianMatcher).
#[derive(Config, Debug)]
pub struct HungarianMatcherConfig {
    /// Weight of the negated class probability. Default: 1.0
    #[config(default = 1.0)]
    pub cost_class: f64,
    /// Weight of the L1 distance between `(cx, cy, w, h)` boxes. Default: 5.0
    #[config(default = 5.0)]
    pub cost_bbox: f64,
    /// Weight of the negated GIoU. Default: 2.0
    #[config(default = 2.0)]
    pub cost_giou: f64,
}

impl HungarianMatcherConfig {
    /// Initialize a [Hungarian matcher](HungarianMatcher).
    pub fn init(&self) -> CriterionResult<HungarianMatcher> {
        self.validate()?;
        Ok(HungarianMatcher {
            cost_class: self.cost_class,
            cost_bbox: self.cost_bbox,
            cost_giou: self.cost_giou,
        })
    }

    /// Reject negative, non-finite or all-zero cost weights.
    pub fn validate(&self) -> CriterionResult<()> {
        let costs = [self.cost_class, self.cost_bbox, self.cost_giou];
        if costs.iter().any(|cost| !cost.is_finite() || *cost < 0.0) {
            return Err(CriterionError::InvalidConfiguration {
                reason: format!("matcher costs must be finite and non-negative, got {costs:?}"),
            });
        }
        if costs.iter().all(|cost| *cost == 0.0) {
            return Err(CriterionError::InvalidConfiguration {
                reason: "all matcher costs are zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Assigns targets to queries by minimizing the total matching cost per image.
///
/// Queries left without a target are the "no-object" predictions. Matching reads detached
/// copies of the predictions, so assignments carry no gradient.
#[derive(Module, Clone, Debug)]
#[module(custom_display)]
pub struct HungarianMatcher {
    pub cost_class: f64,
    pub cost_bbox: f64,
    pub cost_giou: f64,
}

impl Default for HungarianMatcher {
    fn default() -> Self {
        Self {
            cost_class: 1.0,
            cost_bbox: 5.0,
            cost_giou: 2.0,
        }
    }
}

impl ModuleDisplay for HungarianMatcher {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        content
            .add("cost_class", &self.cost_class)
            .add("cost_bbox", &self.cost_bbox)
            .add("cost_giou", &self.cost_giou)
            .optional()
    }
}

impl HungarianMatcher {
    /// Match the queries of every image to its targets.
    ///
    /// # Shapes
    ///
    /// - outputs.class_logits: `[batch_size, num_queries, num_classes + 1]`
    /// - outputs.boxes: `[batch_size, num_queries, 4]`
    /// - targets: one entry per image, each with `labels` and `boxes`
    ///
    /// # Errors
    ///
    /// Fails when a required field is absent, when the batch sizes disagree, when an image
    /// has more targets than there are queries, or when a cost is not finite.
    pub fn forward<B: Backend>(
        &self,
        outputs: &PredictionBundle<B>,
        targets: &[ObjectTargets],
    ) -> CriterionResult<Vec<Assignment>> {
        let logits = outputs
            .class_logits
            .clone()
            .ok_or(CriterionError::MissingOutput {
                field: OutputField::ClassLogits,
                consumer: CONSUMER,
            })?;
        let boxes = outputs.boxes.clone().ok_or(CriterionError::MissingOutput {
            field: OutputField::Boxes,
            consumer: CONSUMER,
        })?;

        let [batch_size, num_queries, num_logits] = logits.dims();
        if targets.len() != batch_size {
            return Err(CriterionError::BatchSizeMismatch {
                predictions: batch_size,
                targets: targets.len(),
            });
        }

        let mut target_ids = Vec::new();
        let mut target_boxes = Vec::new();
        for (image, target) in targets.iter().enumerate() {
            if target.len() > num_queries {
                return Err(CriterionError::TooManyTargets {
                    image,
                    targets: target.len(),
                    queries: num_queries,
                });
            }
            let image_boxes = target.boxes.as_ref().ok_or(CriterionError::MissingTarget {
                field: TargetField::Boxes,
                image,
                consumer: CONSUMER,
            })?;
            if image_boxes.len() != target.len() {
                return Err(CriterionError::ShapeMismatch {
                    field: format!("targets[{image}].boxes"),
                    expected: format!("{} entries", target.len()),
                    actual: format!("{} entries", image_boxes.len()),
                });
            }
            if let Some(&label) = target.labels.iter().find(|&&label| label >= num_logits) {
                return Err(CriterionError::IndexOutOfRange {
                    field: TargetField::Labels,
                    image,
                    value: label,
                    limit: num_logits,
                });
            }
            target_ids.extend(target.labels.iter().map(|&label| label as i64));
            target_boxes.extend(image_boxes.iter().flatten().copied());
        }

        let num_targets = target_ids.len();
        if num_targets == 0 {
            return Ok(vec![Assignment::default(); batch_size]);
        }

        let device = logits.device();
        let flat_queries = batch_size * num_queries;

        // [batch_size * num_queries, num_targets]
        let prob = activation::softmax(logits.detach().reshape([flat_queries, num_logits]), 1);
        let target_ids =
            Tensor::<B, 1, Int>::from_data(TensorData::new(target_ids, [num_targets]), &device);
        let cost_class = prob.select(1, target_ids).neg();

        let out_boxes = boxes.detach().reshape([flat_queries, 4]);
        let tgt_boxes =
            Tensor::<B, 2>::from_data(TensorData::new(target_boxes, [num_targets, 4]), &device);

        let cost_bbox = (out_boxes
            .clone()
            .unsqueeze_dim::<3>(1)
            .expand([flat_queries, num_targets, 4])
            - tgt_boxes
                .clone()
                .unsqueeze_dim::<3>(0)
                .expand([flat_queries, num_targets, 4]))
        .abs()
        .sum_dim(2)
        .reshape([flat_queries, num_targets]);

        let cost_giou =
            generalized_box_iou(box_cxcywh_to_xyxy(out_boxes), box_cxcywh_to_xyxy(tgt_boxes)).neg();

        let cost = cost_bbox.mul_scalar(self.cost_bbox)
            + cost_class.mul_scalar(self.cost_class)
            + cost_giou.mul_scalar(self.cost_giou);

        let cost = cost
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|err| CriterionError::InvalidInput {
                reason: format!("cannot read matching cost: {err:?}"),
            })?;

        let mut assignments = Vec::with_capacity(batch_size);
        let mut offset = 0;
        for (image, target) in targets.iter().enumerate() {
            let count = target.len();
            let assignment = if count == 0 {
                Assignment::default()
            } else {
                let rows = (image * num_queries..(image + 1) * num_queries)
                    .map(|row| &cost[row * num_targets + offset..row * num_targets + offset + count]);
                solve_image(image, rows, num_queries, count)?
            };
            tracing::trace!(
                image,
                targets = count,
                matched = assignment.len(),
                "matched image"
            );
            assignments.push(assignment);
            offset += count;
        }

        Ok(assignments)
    }
}

/// Solve one `[num_queries, count]` cost matrix, padded to a square matrix with zero-cost
/// dummy targets that absorb the unmatched queries.
fn solve_image<'a>(
    image: usize,
    rows: impl Iterator<Item = &'a [f32]>,
    num_queries: usize,
    count: usize,
) -> CriterionResult<Assignment> {
    let mut square = vec![0.0_f64; num_queries * num_queries];
    for (query, row) in rows.enumerate() {
        for (target, &value) in row.iter().enumerate() {
            if !value.is_finite() {
                return Err(CriterionError::InvalidInput {
                    reason: format!(
                        "non-finite matching cost {value} for image {image}, query {query}, target {target}"
                    ),
                });
            }
            square[query * num_queries + target] = f64::from(value);
        }
    }

    let matrix = lapjv::Matrix::from_shape_vec((num_queries, num_queries), square).map_err(
        |err| CriterionError::AssignmentFailed {
            image,
            reason: format!("{err:?}"),
        },
    )?;
    let (row_to_col, _) = lapjv::lapjv(&matrix).map_err(|err| CriterionError::AssignmentFailed {
        image,
        reason: format!("{err:?}"),
    })?;

    let (prediction_indices, target_indices): (Vec<usize>, Vec<usize>) = row_to_col
        .into_iter()
        .enumerate()
        .filter(|(_, target)| *target < count)
        .unzip();

    if target_indices.len() != count {
        return Err(CriterionError::AssignmentFailed {
            image,
            reason: format!(
                "solver assigned {} of {count} targets",
                target_indices.len()
            ),
        });
    }

    Ok(Assignment {
        prediction_indices,
        target_indices,
    })
}

#[cfg(test)]
mod tests {
    use burn::tensor::TensorData;

    use super::*;
    use crate::tests::TestBackend;

    fn bundle(
        logits: TensorData,
        boxes: TensorData,
    ) -> PredictionBundle<TestBackend> {
        let device = Default::default();
        PredictionBundle::new(
            Tensor::from_data(logits, &device),
            Tensor::from_data(boxes, &device),
        )
    }

    /// Two images, three queries, two foreground classes.
    fn two_image_bundle() -> PredictionBundle<TestBackend> {
        bundle(
            TensorData::from([
                [[4.0, 0.0, 0.0], [0.0, 4.0, 0.0], [0.0, 0.0, 4.0]],
                [[0.0, 0.0, 4.0], [0.0, 4.0, 0.0], [4.0, 0.0, 0.0]],
            ]),
            TensorData::from([
                [
                    [0.2, 0.2, 0.1, 0.1],
                    [0.7, 0.7, 0.2, 0.2],
                    [0.5, 0.5, 0.3, 0.3],
                ],
                [
                    [0.5, 0.5, 0.3, 0.3],
                    [0.3, 0.6, 0.2, 0.1],
                    [0.8, 0.2, 0.1, 0.2],
                ],
            ]),
        )
    }

    fn two_image_targets() -> Vec<ObjectTargets> {
        vec![
            ObjectTargets::new(vec![1, 0])
                .with_boxes(vec![[0.7, 0.7, 0.2, 0.2], [0.2, 0.2, 0.1, 0.1]]),
            ObjectTargets::new(vec![0]).with_boxes(vec![[0.8, 0.2, 0.1, 0.2]]),
        ]
    }

    #[test]
    fn matcher_assigns_closest_queries() {
        let matcher = HungarianMatcherConfig::new().init().expect("valid config");

        let assignments = matcher
            .forward(&two_image_bundle(), &two_image_targets())
            .expect("matching succeeds");

        assert_eq!(
            assignments,
            vec![
                Assignment {
                    prediction_indices: vec![0, 1],
                    target_indices: vec![1, 0],
                },
                Assignment {
                    prediction_indices: vec![2],
                    target_indices: vec![0],
                },
            ]
        );
    }

    #[test]
    fn matcher_is_deterministic() {
        let matcher = HungarianMatcher::default();
        let outputs = two_image_bundle();
        let targets = two_image_targets();

        let first = matcher.forward(&outputs, &targets).expect("matching succeeds");
        let second = matcher.forward(&outputs, &targets).expect("matching succeeds");

        assert_eq!(first, second);
    }

    #[test]
    fn matcher_produces_valid_assignments() {
        let matcher = HungarianMatcher::default();
        // Identical predictions force the solver to break ties.
        let outputs = bundle(
            TensorData::from([[[1.0, 1.0]; 4]]),
            TensorData::from([[[0.5, 0.5, 0.2, 0.2]; 4]]),
        );
        let targets = vec![ObjectTargets::new(vec![0, 0, 0])
            .with_boxes(vec![[0.1, 0.1, 0.1, 0.1], [0.5, 0.5, 0.5, 0.5], [0.9, 0.9, 0.1, 0.1]])];

        let assignments = matcher.forward(&outputs, &targets).expect("matching succeeds");
        let assignment = &assignments[0];

        assert_eq!(assignment.len(), 3);
        let mut seen_targets = assignment.target_indices.clone();
        seen_targets.sort_unstable();
        assert_eq!(seen_targets, vec![0, 1, 2]);

        let mut seen_predictions = assignment.prediction_indices.clone();
        seen_predictions.dedup();
        assert_eq!(seen_predictions.len(), 3);
        assert!(seen_predictions.iter().all(|&query| query < 4));
        assert!(assignment.prediction_indices.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn matcher_handles_images_without_targets() {
        let matcher = HungarianMatcher::default();
        let targets = vec![
            ObjectTargets::new(vec![]).with_boxes(vec![]),
            ObjectTargets::new(vec![0]).with_boxes(vec![[0.8, 0.2, 0.1, 0.2]]),
        ];

        let assignments = matcher
            .forward(&two_image_bundle(), &targets)
            .expect("matching succeeds");

        assert!(assignments[0].is_empty());
        assert_eq!(assignments[1].pairs().collect::<Vec<_>>(), vec![(2, 0)]);
    }

    #[test]
    fn matcher_rejects_too_many_targets() {
        let matcher = HungarianMatcher::default();
        let targets = vec![
            ObjectTargets::new(vec![0; 4]).with_boxes(vec![[0.5, 0.5, 0.1, 0.1]; 4]),
            ObjectTargets::new(vec![]).with_boxes(vec![]),
        ];

        assert!(matches!(
            matcher.forward(&two_image_bundle(), &targets),
            Err(CriterionError::TooManyTargets {
                image: 0,
                targets: 4,
                queries: 3
            })
        ));
    }

    #[test]
    fn matcher_rejects_batch_size_mismatch() {
        let matcher = HungarianMatcher::default();
        let targets = vec![ObjectTargets::new(vec![]).with_boxes(vec![])];

        assert!(matches!(
            matcher.forward(&two_image_bundle(), &targets),
            Err(CriterionError::BatchSizeMismatch {
                predictions: 2,
                targets: 1
            })
        ));
    }

    #[test]
    fn matcher_requires_target_boxes() {
        let matcher = HungarianMatcher::default();
        let targets = vec![
            ObjectTargets::new(vec![0]).with_boxes(vec![[0.5, 0.5, 0.1, 0.1]]),
            ObjectTargets::new(vec![1]),
        ];

        assert!(matches!(
            matcher.forward(&two_image_bundle(), &targets),
            Err(CriterionError::MissingTarget {
                field: TargetField::Boxes,
                image: 1,
                ..
            })
        ));
    }

    #[test]
    fn matcher_config_rejects_zero_costs() {
        let config = HungarianMatcherConfig::new()
            .with_cost_class(0.0)
            .with_cost_bbox(0.0)
            .with_cost_giou(0.0);

        assert!(matches!(
            config.init(),
            Err(CriterionError::InvalidConfiguration { .. })
        ));
    }
}
