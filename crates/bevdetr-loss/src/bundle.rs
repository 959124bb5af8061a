//! Prediction bundles produced by the model and per-image ground-truth targets.

use std::fmt;

use burn::tensor::{backend::Backend, Tensor};

use crate::error::{CriterionError, CriterionResult};

/// Number of orientation bins used by default: 12 bin logits followed by 12 residuals.
pub const DEFAULT_HEADING_BINS: usize = 12;

/// Names of the per-query prediction tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputField {
    ClassLogits,
    Boxes,
    Bev,
    HeadBev,
    FeetBev,
    Dimension,
    Orientation,
    DepthBinLogits,
    DepthDelta,
    Masks,
}

impl OutputField {
    /// Snake-case name of the field.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClassLogits => "class_logits",
            Self::Boxes => "box_2d",
            Self::Bev => "bev_point",
            Self::HeadBev => "head_bev_point",
            Self::FeetBev => "feet_bev_point",
            Self::Dimension => "dimension",
            Self::Orientation => "orientation",
            Self::DepthBinLogits => "depth_bin_logits",
            Self::DepthDelta => "depth_delta",
            Self::Masks => "masks",
        }
    }
}

impl fmt::Display for OutputField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Names of the per-object target fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetField {
    Labels,
    Boxes,
    Bev,
    Dimension,
    HeadingBin,
    HeadingResidual,
    Depth,
    Masks,
}

impl TargetField {
    /// Snake-case name of the field.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Labels => "labels",
            Self::Boxes => "boxes",
            Self::Bev => "bev",
            Self::Dimension => "dim",
            Self::HeadingBin => "heading_bin",
            Self::HeadingResidual => "heading_res",
            Self::Depth => "depth",
            Self::Masks => "masks",
        }
    }
}

impl fmt::Display for TargetField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-query outputs of one decoder layer.
///
/// Every tensor has the leading shape `[batch_size, num_queries]`. Fields are optional so a
/// model can omit heads whose losses are disabled; requesting an absent field fails with
/// [`CriterionError::MissingOutput`].
#[derive(Debug, Clone)]
pub struct PredictionBundle<B: Backend> {
    /// Classification logits including the trailing no-object class, `[B, Q, C + 1]`.
    pub class_logits: Option<Tensor<B, 3>>,
    /// Normalized `(cx, cy, w, h)` boxes, `[B, Q, 4]`.
    pub boxes: Option<Tensor<B, 3>>,
    /// Normalized BEV center point, `[B, Q, 2]`.
    pub bev: Option<Tensor<B, 3>>,
    /// BEV projection of the predicted head point, `[B, Q, 2]`.
    pub head_bev: Option<Tensor<B, 3>>,
    /// BEV projection of the predicted feet point, `[B, Q, 2]`.
    pub feet_bev: Option<Tensor<B, 3>>,
    /// Object footprint dimensions, `[B, Q, 2]`.
    pub dimension: Option<Tensor<B, 3>>,
    /// Heading bin logits followed by per-bin residuals, `[B, Q, 2 * bins]`.
    pub orientation: Option<Tensor<B, 3>>,
    /// Depth bin logits, `[B, Q, n_bins]`.
    pub depth_bin_logits: Option<Tensor<B, 3>>,
    /// Depth correction inside the chosen bin, `[B, Q, 1]`.
    pub depth_delta: Option<Tensor<B, 3>>,
    /// Per-query mask logits, `[B, Q, h, w]`.
    pub masks: Option<Tensor<B, 4>>,
}

impl<B: Backend> Default for PredictionBundle<B> {
    fn default() -> Self {
        Self {
            class_logits: None,
            boxes: None,
            bev: None,
            head_bev: None,
            feet_bev: None,
            dimension: None,
            orientation: None,
            depth_bin_logits: None,
            depth_delta: None,
            masks: None,
        }
    }
}

impl<B: Backend> PredictionBundle<B> {
    /// Create a bundle holding only the classification logits and 2D boxes.
    pub fn new(class_logits: Tensor<B, 3>, boxes: Tensor<B, 3>) -> Self {
        Self {
            class_logits: Some(class_logits),
            boxes: Some(boxes),
            ..Self::default()
        }
    }

    /// The tensor stored under `field`, cloned, for the three-dimensional fields.
    pub fn field(&self, field: OutputField) -> Option<Tensor<B, 3>> {
        let tensor = match field {
            OutputField::ClassLogits => &self.class_logits,
            OutputField::Boxes => &self.boxes,
            OutputField::Bev => &self.bev,
            OutputField::HeadBev => &self.head_bev,
            OutputField::FeetBev => &self.feet_bev,
            OutputField::Dimension => &self.dimension,
            OutputField::Orientation => &self.orientation,
            OutputField::DepthBinLogits => &self.depth_bin_logits,
            OutputField::DepthDelta => &self.depth_delta,
            OutputField::Masks => return None,
        };
        tensor.clone()
    }

    /// `[batch_size, num_queries]` taken from the first present field.
    pub fn batch_shape(&self) -> Option<[usize; 2]> {
        let dims = [
            &self.class_logits,
            &self.boxes,
            &self.bev,
            &self.head_bev,
            &self.feet_bev,
            &self.dimension,
            &self.orientation,
            &self.depth_bin_logits,
            &self.depth_delta,
        ]
        .into_iter()
        .flatten()
        .map(|tensor| {
            let [batch, queries, _] = tensor.dims();
            [batch, queries]
        })
        .next();

        dims.or_else(|| {
            self.masks.as_ref().map(|masks| {
                let [batch, queries, _, _] = masks.dims();
                [batch, queries]
            })
        })
    }

    /// Check that every present field agrees on `[batch_size, num_queries]`.
    pub fn validate(&self) -> CriterionResult<()> {
        let Some(expected) = self.batch_shape() else {
            return Ok(());
        };

        let fields = [
            OutputField::ClassLogits,
            OutputField::Boxes,
            OutputField::Bev,
            OutputField::HeadBev,
            OutputField::FeetBev,
            OutputField::Dimension,
            OutputField::Orientation,
            OutputField::DepthBinLogits,
            OutputField::DepthDelta,
        ];
        for field in fields {
            if let Some(tensor) = self.field(field) {
                let [batch, queries, _] = tensor.dims();
                if [batch, queries] != expected {
                    return Err(CriterionError::ShapeMismatch {
                        field: field.to_string(),
                        expected: format!("{expected:?} leading dims"),
                        actual: format!("{:?}", tensor.dims()),
                    });
                }
            }
        }
        if let Some(masks) = &self.masks {
            let [batch, queries, _, _] = masks.dims();
            if [batch, queries] != expected {
                return Err(CriterionError::ShapeMismatch {
                    field: OutputField::Masks.to_string(),
                    expected: format!("{expected:?} leading dims"),
                    actual: format!("{:?}", masks.dims()),
                });
            }
        }
        Ok(())
    }
}

/// Outputs of a full forward pass: the final decoder layer plus one bundle per
/// intermediate layer when auxiliary supervision is enabled.
#[derive(Debug, Clone)]
pub struct DetectionOutputs<B: Backend> {
    /// Bundle of the last decoder layer.
    pub final_layer: PredictionBundle<B>,
    /// Bundles of the non-final decoder layers, in layer order.
    pub aux_layers: Vec<PredictionBundle<B>>,
}

impl<B: Backend> DetectionOutputs<B> {
    /// Outputs without auxiliary layers.
    pub const fn new(final_layer: PredictionBundle<B>) -> Self {
        Self {
            final_layer,
            aux_layers: Vec::new(),
        }
    }

    /// Attach auxiliary layer bundles.
    pub fn with_aux_layers(mut self, aux_layers: Vec<PredictionBundle<B>>) -> Self {
        self.aux_layers = aux_layers;
        self
    }
}

/// Instance masks of one image, stored row-major as `[num_objects, height, width]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetMasks {
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl TargetMasks {
    pub fn new(height: usize, width: usize, data: Vec<f32>) -> Self {
        Self {
            height,
            width,
            data,
        }
    }

    /// Number of masks implied by the data length.
    pub fn len(&self) -> usize {
        let plane = self.height * self.width;
        if plane == 0 {
            0
        } else {
            self.data.len() / plane
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `index`-th mask as a flat row-major slice.
    pub fn mask(&self, index: usize) -> &[f32] {
        let plane = self.height * self.width;
        &self.data[index * plane..(index + 1) * plane]
    }
}

/// Ground truth of one image.
///
/// `labels` defines the object count; every other present field must hold exactly one
/// entry per object. Targets are constants for the loss and live on the host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectTargets {
    /// Class ids in `[0, num_classes)`.
    pub labels: Vec<usize>,
    /// Normalized `(cx, cy, w, h)` boxes.
    pub boxes: Option<Vec<[f32; 4]>>,
    /// Normalized BEV points.
    pub bev: Option<Vec<[f32; 2]>>,
    /// Footprint dimensions, strictly positive.
    pub dim: Option<Vec<[f32; 2]>>,
    /// Heading bin ids.
    pub heading_bin: Option<Vec<usize>>,
    /// Heading residuals within the bin.
    pub heading_res: Option<Vec<f32>>,
    /// Raw metric depth.
    pub depth: Option<Vec<f32>>,
    /// Instance masks.
    pub masks: Option<TargetMasks>,
}

impl ObjectTargets {
    pub fn new(labels: Vec<usize>) -> Self {
        Self {
            labels,
            ..Self::default()
        }
    }

    pub fn with_boxes(mut self, boxes: Vec<[f32; 4]>) -> Self {
        self.boxes = Some(boxes);
        self
    }

    pub fn with_bev(mut self, bev: Vec<[f32; 2]>) -> Self {
        self.bev = Some(bev);
        self
    }

    pub fn with_dim(mut self, dim: Vec<[f32; 2]>) -> Self {
        self.dim = Some(dim);
        self
    }

    pub fn with_heading(mut self, bins: Vec<usize>, residuals: Vec<f32>) -> Self {
        self.heading_bin = Some(bins);
        self.heading_res = Some(residuals);
        self
    }

    pub fn with_depth(mut self, depth: Vec<f32>) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn with_masks(mut self, masks: TargetMasks) -> Self {
        self.masks = Some(masks);
        self
    }

    /// Number of objects in the image.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Check field lengths and index ranges.
    ///
    /// `image` only feeds error messages.
    pub fn validate(
        &self,
        image: usize,
        num_classes: usize,
        heading_bins: usize,
    ) -> CriterionResult<()> {
        let count = self.len();
        let lengths = [
            (TargetField::Boxes, self.boxes.as_ref().map(Vec::len)),
            (TargetField::Bev, self.bev.as_ref().map(Vec::len)),
            (TargetField::Dimension, self.dim.as_ref().map(Vec::len)),
            (TargetField::HeadingBin, self.heading_bin.as_ref().map(Vec::len)),
            (
                TargetField::HeadingResidual,
                self.heading_res.as_ref().map(Vec::len),
            ),
            (TargetField::Depth, self.depth.as_ref().map(Vec::len)),
        ];
        for (field, len) in lengths {
            if let Some(len) = len {
                if len != count {
                    return Err(CriterionError::ShapeMismatch {
                        field: format!("targets[{image}].{field}"),
                        expected: format!("{count} entries"),
                        actual: format!("{len} entries"),
                    });
                }
            }
        }

        if let Some(masks) = &self.masks {
            let expected = count * masks.height * masks.width;
            if masks.data.len() != expected {
                return Err(CriterionError::ShapeMismatch {
                    field: format!("targets[{image}].masks"),
                    expected: format!("[{count}, {}, {}]", masks.height, masks.width),
                    actual: format!("{} values", masks.data.len()),
                });
            }
        }

        if let Some(&label) = self.labels.iter().find(|&&label| label >= num_classes) {
            return Err(CriterionError::IndexOutOfRange {
                field: TargetField::Labels,
                image,
                value: label,
                limit: num_classes,
            });
        }

        if let Some(bins) = &self.heading_bin {
            if let Some(&bin) = bins.iter().find(|&&bin| bin >= heading_bins) {
                return Err(CriterionError::IndexOutOfRange {
                    field: TargetField::HeadingBin,
                    image,
                    value: bin,
                    limit: heading_bins,
                });
            }
        }

        if let Some(dims) = &self.dim {
            if dims.iter().flatten().any(|&extent| !(extent > 0.0)) {
                return Err(CriterionError::InvalidInput {
                    reason: format!("targets[{image}].dim must be strictly positive"),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use burn::tensor::Tensor;

    use super::*;
    use crate::tests::TestBackend;

    #[test]
    fn validate_rejects_length_mismatch() {
        let targets = ObjectTargets::new(vec![0, 1]).with_boxes(vec![[0.5, 0.5, 0.1, 0.1]]);

        match targets.validate(3, 5, 12) {
            Err(CriterionError::ShapeMismatch { field, .. }) => {
                assert_eq!(field, "targets[3].boxes");
            }
            other => panic!("Expected ShapeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_label_out_of_range() {
        let targets = ObjectTargets::new(vec![0, 7]);

        assert!(matches!(
            targets.validate(0, 5, 12),
            Err(CriterionError::IndexOutOfRange {
                field: TargetField::Labels,
                value: 7,
                limit: 5,
                ..
            })
        ));
    }

    #[test]
    fn validate_rejects_non_positive_dimensions() {
        let targets = ObjectTargets::new(vec![0]).with_dim(vec![[1.0, 0.0]]);

        assert!(matches!(
            targets.validate(0, 5, 12),
            Err(CriterionError::InvalidInput { .. })
        ));
    }

    #[test]
    fn validate_accepts_empty_image() {
        let targets = ObjectTargets::new(vec![])
            .with_boxes(vec![])
            .with_masks(TargetMasks::new(4, 4, vec![]));

        assert!(targets.validate(0, 5, 12).is_ok());
    }

    #[test]
    fn bundle_validate_detects_inconsistent_queries() {
        let device = Default::default();
        let bundle = PredictionBundle::<TestBackend> {
            bev: Some(Tensor::zeros([2, 3, 2], &device)),
            ..PredictionBundle::new(
                Tensor::zeros([2, 4, 3], &device),
                Tensor::zeros([2, 4, 4], &device),
            )
        };

        assert_eq!(bundle.batch_shape(), Some([2, 4]));
        assert!(matches!(
            bundle.validate(),
            Err(CriterionError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn target_masks_slices_planes() {
        let masks = TargetMasks::new(1, 2, vec![1.0, 0.0, 0.0, 1.0]);

        assert_eq!(masks.len(), 2);
        assert_eq!(masks.mask(1), &[0.0, 1.0]);
    }
}
