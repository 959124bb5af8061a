//! The set criterion: matching, normalization and dispatch to the per-task losses.
//!
//! One call proceeds as follows:
//!
//! 1. match the final decoder layer against the targets,
//! 2. compute the denominator, the batch object count averaged over workers and clamped to 1,
//! 3. evaluate every configured loss on the final layer,
//! 4. repeat matching and evaluation for each auxiliary layer with layer-suffixed keys,
//!    skipping the mask loss and the `class_error` diagnostic.

use std::{collections::BTreeSet, sync::Arc};

use burn::{
    config::Config,
    tensor::{backend::Backend, Int, Tensor, TensorData},
};

use crate::{
    bundle::{DetectionOutputs, ObjectTargets, OutputField, PredictionBundle, TargetField},
    collective::{Collective, SingleProcess},
    error::{CriterionError, CriterionResult},
    key::{LossKind, LossMap, LossTerm},
    losses::{
        bev_point_loss, box_losses, cardinality_error, class_error, dimension_loss,
        rows_to_tensor, stack_target_masks, zero_loss, AngleLoss,
        AngleLossConfig, DepthLoss, DepthLossConfig, LabelsLoss, LabelsLossConfig, MaskLoss,
        MaskLossConfig, MatchedPairs,
    },
    matcher::{Assignment, HungarianMatcher, HungarianMatcherConfig},
};

/// Configuration for creating a [set criterion](SetCriterion).
#[derive(Config, Debug)]
pub struct SetCriterionConfig {
    /// Number of object classes, without the "no-object" class.
    pub num_classes: usize,
    /// Relative classification weight of the "no-object" class. Default: 0.1
    #[config(default = 0.1)]
    pub eos_coef: f64,
    /// Losses to evaluate, in order. Default: every loss except masks.
    #[config(default = "LossKind::detection_defaults()")]
    pub losses: Vec<LossKind>,
    /// Matching cost weights.
    #[config(default = "HungarianMatcherConfig::new()")]
    pub matcher: HungarianMatcherConfig,
    /// Orientation bins.
    #[config(default = "AngleLossConfig::new()")]
    pub angle: AngleLossConfig,
    /// Depth bins.
    #[config(default = "DepthLossConfig::new()")]
    pub depth: DepthLossConfig,
    /// Focal loss parameters of the mask loss.
    #[config(default = "MaskLossConfig::new()")]
    pub mask: MaskLossConfig,
}

impl SetCriterionConfig {
    /// Initialize a [set criterion](SetCriterion) running in a single process.
    ///
    /// # Errors
    ///
    /// Returns [`CriterionError::InvalidConfiguration`] when [`validate`](Self::validate)
    /// fails.
    pub fn init<B: Backend>(&self, device: &B::Device) -> CriterionResult<SetCriterion<B>> {
        self.validate()?;

        Ok(SetCriterion {
            matcher: self.matcher.init()?,
            labels: LabelsLossConfig::new(self.num_classes)
                .with_eos_coef(self.eos_coef)
                .init(device),
            angle: self.angle.init(),
            depth: self.depth.init(),
            masks: self.mask.init(),
            losses: self.losses.clone(),
            num_classes: self.num_classes,
            collective: Arc::new(SingleProcess),
        })
    }

    /// Check the configuration for logical consistency.
    pub fn validate(&self) -> CriterionResult<()> {
        let invalid = |reason: String| Err(CriterionError::InvalidConfiguration { reason });

        if self.num_classes == 0 {
            return invalid("num_classes must be at least 1".to_string());
        }
        if !(self.eos_coef > 0.0 && self.eos_coef <= 1.0) {
            return invalid(format!("eos_coef must be in (0, 1], got {}", self.eos_coef));
        }
        if self.losses.is_empty() {
            return invalid("no losses requested".to_string());
        }
        let unique = self.losses.iter().collect::<BTreeSet<_>>();
        if unique.len() != self.losses.len() {
            return invalid(format!("duplicate entries in losses {:?}", self.losses));
        }
        if self.angle.num_heading_bins == 0 {
            return invalid("num_heading_bins must be at least 1".to_string());
        }
        if self.depth.num_depth_bins == 0 {
            return invalid("num_depth_bins must be at least 1".to_string());
        }
        if !(self.depth.depth_bin_resolution > 0.0 && self.depth.depth_bin_resolution.is_finite())
        {
            return invalid(format!(
                "depth_bin_resolution must be positive, got {}",
                self.depth.depth_bin_resolution
            ));
        }
        if self.mask.alpha > 1.0 || self.mask.gamma < 0.0 {
            return invalid(format!(
                "mask focal parameters out of range: alpha {}, gamma {}",
                self.mask.alpha, self.mask.gamma
            ));
        }
        self.matcher.validate()
    }
}

/// Computes the training losses of a detection transformer with 3D heads.
///
/// The returned [`LossMap`] is unweighted; apply a [`WeightTable`](crate::WeightTable) to
/// obtain the training objective.
#[derive(Debug, Clone)]
pub struct SetCriterion<B: Backend> {
    matcher: HungarianMatcher,
    labels: LabelsLoss<B>,
    angle: AngleLoss,
    depth: DepthLoss,
    masks: MaskLoss,
    losses: Vec<LossKind>,
    num_classes: usize,
    collective: Arc<dyn Collective>,
}

impl<B: Backend> SetCriterion<B> {
    /// Normalize through `collective` instead of the single-process default.
    pub fn with_collective(mut self, collective: Arc<dyn Collective>) -> Self {
        self.collective = collective;
        self
    }

    pub fn matcher(&self) -> &HungarianMatcher {
        &self.matcher
    }

    pub fn losses(&self) -> &[LossKind] {
        &self.losses
    }

    pub const fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn collective(&self) -> &dyn Collective {
        self.collective.as_ref()
    }

    /// Number of target objects in the batch, averaged over all workers and clamped to 1.
    ///
    /// Blocks until every worker of the collective contributed.
    pub fn num_boxes(&self, targets: &[ObjectTargets]) -> CriterionResult<f64> {
        let local = targets.iter().map(ObjectTargets::len).sum::<usize>() as f64;
        let world_size = self.collective.world_size().max(1) as f64;
        let total = self.collective.all_reduce_sum(local)?;
        let num_boxes = (total / world_size).max(1.0);

        tracing::debug!(local, total, world_size, num_boxes, "loss normalization");
        Ok(num_boxes)
    }

    /// Compute every configured loss on the final layer and on each auxiliary layer.
    ///
    /// # Errors
    ///
    /// Fails on the first configuration, shape or collective error; no partial result is
    /// returned.
    pub fn forward(
        &self,
        outputs: &DetectionOutputs<B>,
        targets: &[ObjectTargets],
    ) -> CriterionResult<LossMap<B>> {
        let final_layer = &outputs.final_layer;
        self.check_batch(final_layer, targets)?;
        for (image, target) in targets.iter().enumerate() {
            target.validate(image, self.num_classes, self.angle.num_heading_bins)?;
        }

        let assignments = self.matcher.forward(final_layer, targets)?;
        let num_boxes = self.num_boxes(targets)?;

        let mut losses = LossMap::new();
        for &kind in &self.losses {
            let layer_losses =
                self.get_loss(kind, final_layer, targets, &assignments, num_boxes, true)?;
            losses.extend_layer(layer_losses, None);
        }

        for (layer, aux) in outputs.aux_layers.iter().enumerate() {
            self.check_batch(aux, targets)?;
            let assignments = self.matcher.forward(aux, targets)?;
            for &kind in self.losses.iter().filter(|kind| **kind != LossKind::Masks) {
                let layer_losses =
                    self.get_loss(kind, aux, targets, &assignments, num_boxes, false)?;
                losses.extend_layer(layer_losses, Some(layer));
            }
        }

        tracing::debug!(
            num_boxes,
            aux_layers = outputs.aux_layers.len(),
            terms = losses.len(),
            "criterion computed"
        );
        Ok(losses)
    }

    /// Evaluate a single loss for one layer. `log` enables the `class_error` diagnostic.
    pub fn get_loss(
        &self,
        kind: LossKind,
        outputs: &PredictionBundle<B>,
        targets: &[ObjectTargets],
        assignments: &[Assignment],
        num_boxes: f64,
        log: bool,
    ) -> CriterionResult<LossMap<B>> {
        let [_, num_queries] = outputs.batch_shape().ok_or(CriterionError::InvalidInput {
            reason: "prediction bundle holds no tensors".to_string(),
        })?;
        let pairs = MatchedPairs::new(assignments, num_queries);

        match kind {
            LossKind::Labels => self.loss_labels(outputs, targets, &pairs, log),
            LossKind::Cardinality => self.loss_cardinality(outputs, targets),
            LossKind::Boxes => self.loss_boxes(outputs, targets, &pairs, num_boxes),
            LossKind::Bev => self.loss_point(kind, outputs, targets, &pairs, num_boxes),
            LossKind::Head => self.loss_point(kind, outputs, targets, &pairs, num_boxes),
            LossKind::Feet => self.loss_point(kind, outputs, targets, &pairs, num_boxes),
            LossKind::Dim => self.loss_dim(outputs, targets, &pairs, num_boxes),
            LossKind::Angle => self.loss_angle(outputs, targets, &pairs, num_boxes),
            LossKind::Depth => self.loss_depth(outputs, targets, &pairs),
            LossKind::Masks => self.loss_masks(outputs, targets, &pairs, num_boxes),
        }
    }

    fn check_batch(
        &self,
        outputs: &PredictionBundle<B>,
        targets: &[ObjectTargets],
    ) -> CriterionResult<()> {
        outputs.validate()?;
        let [batch_size, _] = outputs.batch_shape().ok_or(CriterionError::InvalidInput {
            reason: "prediction bundle holds no tensors".to_string(),
        })?;
        if batch_size != targets.len() {
            return Err(CriterionError::BatchSizeMismatch {
                predictions: batch_size,
                targets: targets.len(),
            });
        }
        Ok(())
    }

    fn loss_labels(
        &self,
        outputs: &PredictionBundle<B>,
        targets: &[ObjectTargets],
        pairs: &MatchedPairs,
        log: bool,
    ) -> CriterionResult<LossMap<B>> {
        let logits = output(outputs, OutputField::ClassLogits, LossKind::Labels)?;
        let [batch_size, num_queries, num_logits] = logits.dims();
        expect_channels(OutputField::ClassLogits, num_logits, self.num_classes + 1)?;
        let device = logits.device();

        let labels = pairs.collect(targets, TargetField::Labels, LossKind::Labels, |t| {
            Some(&t.labels)
        })?;

        let mut classes = vec![self.num_classes as i64; batch_size * num_queries];
        for (flat, &label) in pairs.flat_query_indices().into_iter().zip(&labels) {
            classes[flat] = label as i64;
        }
        let target_classes = Tensor::<B, 2, Int>::from_data(
            TensorData::new(classes, [batch_size, num_queries]),
            &device,
        );

        let mut losses = LossMap::new();
        losses.insert(
            LossTerm::Ce,
            self.labels.forward(logits.clone(), target_classes),
        );

        if log {
            let error = if pairs.is_empty() {
                Tensor::full([1], 100.0, &device)
            } else {
                let labels = labels.iter().map(|&label| label as i64).collect::<Vec<_>>();
                let labels =
                    Tensor::<B, 1, Int>::from_data(TensorData::new(labels, [pairs.len()]), &device);
                class_error(pairs.gather(logits), labels)
            };
            losses.insert(LossTerm::ClassError, error);
        }

        Ok(losses)
    }

    fn loss_cardinality(
        &self,
        outputs: &PredictionBundle<B>,
        targets: &[ObjectTargets],
    ) -> CriterionResult<LossMap<B>> {
        let logits = output(outputs, OutputField::ClassLogits, LossKind::Cardinality)?;
        let [_, _, num_logits] = logits.dims();
        expect_channels(OutputField::ClassLogits, num_logits, self.num_classes + 1)?;
        let lengths = targets.iter().map(ObjectTargets::len).collect::<Vec<_>>();

        let mut losses = LossMap::new();
        losses.insert(
            LossTerm::CardinalityError,
            cardinality_error(logits, &lengths),
        );
        Ok(losses)
    }

    fn loss_boxes(
        &self,
        outputs: &PredictionBundle<B>,
        targets: &[ObjectTargets],
        pairs: &MatchedPairs,
        num_boxes: f64,
    ) -> CriterionResult<LossMap<B>> {
        let boxes = output(outputs, OutputField::Boxes, LossKind::Boxes)?;
        let target_boxes = pairs.collect(targets, TargetField::Boxes, LossKind::Boxes, |t| {
            t.boxes.as_ref()
        })?;
        let device = boxes.device();

        let mut losses = LossMap::new();
        if pairs.is_empty() {
            losses.insert(LossTerm::Bbox, zero_loss(&device));
            losses.insert(LossTerm::Giou, zero_loss(&device));
            return Ok(losses);
        }

        let result = box_losses(
            pairs.gather(boxes),
            rows_to_tensor(target_boxes, &device),
            num_boxes,
        );
        losses.insert(LossTerm::Bbox, result.l1);
        losses.insert(LossTerm::Giou, result.giou);
        Ok(losses)
    }

    /// Center, head and feet points share the BEV target.
    fn loss_point(
        &self,
        kind: LossKind,
        outputs: &PredictionBundle<B>,
        targets: &[ObjectTargets],
        pairs: &MatchedPairs,
        num_boxes: f64,
    ) -> CriterionResult<LossMap<B>> {
        let (field, term) = match kind {
            LossKind::Head => (OutputField::HeadBev, LossTerm::HeadBev),
            LossKind::Feet => (OutputField::FeetBev, LossTerm::FeetBev),
            _ => (OutputField::Bev, LossTerm::Bev),
        };
        let points = output(outputs, field, kind)?;
        let target_points = pairs.collect(targets, TargetField::Bev, kind, |t| t.bev.as_ref())?;
        let device = points.device();

        let value = if pairs.is_empty() {
            zero_loss(&device)
        } else {
            bev_point_loss(
                pairs.gather(points),
                rows_to_tensor(target_points, &device),
                num_boxes,
            )
        };

        let mut losses = LossMap::new();
        losses.insert(term, value);
        Ok(losses)
    }

    fn loss_dim(
        &self,
        outputs: &PredictionBundle<B>,
        targets: &[ObjectTargets],
        pairs: &MatchedPairs,
        num_boxes: f64,
    ) -> CriterionResult<LossMap<B>> {
        let dims = output(outputs, OutputField::Dimension, LossKind::Dim)?;
        let target_dims =
            pairs.collect(targets, TargetField::Dimension, LossKind::Dim, |t| t.dim.as_ref())?;
        let device = dims.device();

        let value = if pairs.is_empty() {
            zero_loss(&device)
        } else {
            dimension_loss(
                pairs.gather(dims),
                rows_to_tensor(target_dims, &device),
                num_boxes,
            )
        };

        let mut losses = LossMap::new();
        losses.insert(LossTerm::Dim, value);
        Ok(losses)
    }

    fn loss_angle(
        &self,
        outputs: &PredictionBundle<B>,
        targets: &[ObjectTargets],
        pairs: &MatchedPairs,
        num_boxes: f64,
    ) -> CriterionResult<LossMap<B>> {
        let orientation = output(outputs, OutputField::Orientation, LossKind::Angle)?;
        let [_, _, channels] = orientation.dims();
        expect_channels(
            OutputField::Orientation,
            channels,
            2 * self.angle.num_heading_bins,
        )?;

        let bins = pairs.collect(targets, TargetField::HeadingBin, LossKind::Angle, |t| {
            t.heading_bin.as_ref()
        })?;
        let residuals = pairs.collect(targets, TargetField::HeadingResidual, LossKind::Angle, |t| {
            t.heading_res.as_ref()
        })?;
        let device = orientation.device();

        let value = if pairs.is_empty() {
            zero_loss(&device)
        } else {
            let count = pairs.len();
            let bins = bins.into_iter().map(|bin| bin as i64).collect::<Vec<_>>();
            self.angle.forward(
                pairs.gather(orientation),
                Tensor::from_data(TensorData::new(bins, [count]), &device),
                Tensor::from_data(TensorData::new(residuals, [count]), &device),
                num_boxes,
            )
        };

        let mut losses = LossMap::new();
        losses.insert(LossTerm::Angle, value);
        Ok(losses)
    }

    /// Averaged over the matched pairs rather than divided by the denominator.
    fn loss_depth(
        &self,
        outputs: &PredictionBundle<B>,
        targets: &[ObjectTargets],
        pairs: &MatchedPairs,
    ) -> CriterionResult<LossMap<B>> {
        let bin_logits = output(outputs, OutputField::DepthBinLogits, LossKind::Depth)?;
        let delta = output(outputs, OutputField::DepthDelta, LossKind::Depth)?;
        let [_, _, bins] = bin_logits.dims();
        expect_channels(OutputField::DepthBinLogits, bins, self.depth.num_depth_bins)?;
        let [_, _, delta_channels] = delta.dims();
        expect_channels(OutputField::DepthDelta, delta_channels, 1)?;

        let depths =
            pairs.collect(targets, TargetField::Depth, LossKind::Depth, |t| t.depth.as_ref())?;
        let encoded = self.depth.encode_targets(&depths)?;
        let device = bin_logits.device();

        let value = if pairs.is_empty() {
            zero_loss(&device)
        } else {
            let count = pairs.len();
            let bins = encoded
                .bins
                .into_iter()
                .map(|bin| bin as i64)
                .collect::<Vec<_>>();
            self.depth.forward(
                pairs.gather(bin_logits),
                pairs.gather(delta).reshape([count]),
                Tensor::from_data(TensorData::new(bins, [count]), &device),
                Tensor::from_data(TensorData::new(encoded.residuals, [count]), &device),
            )
        };

        let mut losses = LossMap::new();
        losses.insert(LossTerm::Depth, value);
        Ok(losses)
    }

    fn loss_masks(
        &self,
        outputs: &PredictionBundle<B>,
        targets: &[ObjectTargets],
        pairs: &MatchedPairs,
        num_boxes: f64,
    ) -> CriterionResult<LossMap<B>> {
        let pred_masks = outputs
            .masks
            .clone()
            .ok_or_else(|| CriterionError::missing_output(OutputField::Masks, LossKind::Masks))?;
        let target_masks = targets
            .iter()
            .enumerate()
            .map(|(image, target)| {
                target.masks.as_ref().ok_or_else(|| {
                    CriterionError::missing_target(TargetField::Masks, image, LossKind::Masks)
                })
            })
            .collect::<CriterionResult<Vec<_>>>()?;
        let device = pred_masks.device();

        let mut losses = LossMap::new();
        if pairs.is_empty() {
            losses.insert(LossTerm::Mask, zero_loss(&device));
            losses.insert(LossTerm::Dice, zero_loss(&device));
            return Ok(losses);
        }

        let (data, shape) = stack_target_masks(&target_masks, pairs.target_refs());
        let result = self.masks.forward(
            pairs.gather_masks(pred_masks),
            Tensor::from_data(TensorData::new(data, shape), &device),
            num_boxes,
        );
        losses.insert(LossTerm::Mask, result.focal);
        losses.insert(LossTerm::Dice, result.dice);
        Ok(losses)
    }
}

fn output<B: Backend>(
    outputs: &PredictionBundle<B>,
    field: OutputField,
    consumer: LossKind,
) -> CriterionResult<Tensor<B, 3>> {
    outputs
        .field(field)
        .ok_or_else(|| CriterionError::missing_output(field, consumer))
}

fn expect_channels(field: OutputField, actual: usize, expected: usize) -> CriterionResult<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(CriterionError::ShapeMismatch {
            field: field.to_string(),
            expected: format!("{expected} channels"),
            actual: format!("{actual} channels"),
        })
    }
}
