//! Conversion of final-layer predictions into per-image detections.
//!
//! One detection is produced per query; score thresholding and suppression are left
//! to the consumer.

use bevdetr_loss::{box_ops::box_cxcywh_to_xyxy, OutputField, PredictionBundle};
use burn::tensor::{activation, backend::Backend, Int, Tensor, TensorData};
use serde::{Deserialize, Serialize};

use crate::error::{PostProcessError, PostProcessResult};

/// Per-query results of one image, still on the device.
#[derive(Debug, Clone)]
pub struct DetectionSet<B: Backend> {
    /// Best object-class probability, `[num_queries]`.
    pub scores: Tensor<B, 1>,
    /// Class achieving `scores`, `[num_queries]`.
    pub labels: Tensor<B, 1, Int>,
    /// Absolute `(x0, y0, x1, y1)` boxes in pixels, `[num_queries, 4]`.
    pub boxes: Tensor<B, 2>,
}

/// A single detection read back to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub score: f32,
    pub label: usize,
    pub bbox: [f32; 4],
}

impl<B: Backend> DetectionSet<B> {
    /// Number of detections, one per query.
    pub fn len(&self) -> usize {
        self.scores.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the detections to the host, in query order.
    pub fn to_detections(&self) -> Vec<Detection> {
        let scores = self.scores.to_data();
        let labels = self.labels.to_data();
        let boxes = self.boxes.to_data();
        let coords = boxes.iter::<f32>().collect::<Vec<_>>();

        scores
            .iter::<f32>()
            .zip(labels.iter::<i64>())
            .zip(coords.chunks_exact(4))
            .map(|((score, label), bbox)| Detection {
                score,
                label: label as usize,
                bbox: [bbox[0], bbox[1], bbox[2], bbox[3]],
            })
            .collect()
    }
}

/// Maps normalized model outputs to scored, labelled, pixel-space boxes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostProcess;

impl PostProcess {
    pub const fn new() -> Self {
        Self
    }

    /// Score, label and rescale every query of the final layer.
    ///
    /// `image_sizes` holds the original `(height, width)` of every image. The no-object
    /// class never wins; the reported score is the best probability among object classes.
    ///
    /// # Errors
    ///
    /// Fails when the logits or boxes are missing, when the bundle is inconsistent, or
    /// when `image_sizes` does not have one entry per image.
    pub fn forward<B: Backend>(
        &self,
        outputs: &PredictionBundle<B>,
        image_sizes: &[[f32; 2]],
    ) -> PostProcessResult<Vec<DetectionSet<B>>> {
        outputs.validate()?;
        let logits = outputs
            .class_logits
            .clone()
            .ok_or(PostProcessError::MissingOutput {
                field: OutputField::ClassLogits,
            })?
            .detach();
        let boxes = outputs
            .boxes
            .clone()
            .ok_or(PostProcessError::MissingOutput {
                field: OutputField::Boxes,
            })?
            .detach();

        let [batch_size, num_queries, num_logits] = logits.dims();
        if batch_size != image_sizes.len() {
            return Err(PostProcessError::BatchSizeMismatch {
                predictions: batch_size,
                sizes: image_sizes.len(),
            });
        }
        if num_logits < 2 {
            return Err(PostProcessError::NoObjectClasses);
        }

        let device = logits.device();
        let probabilities = activation::softmax(logits, 2).narrow(2, 0, num_logits - 1);
        let (scores, labels) = probabilities.max_dim_with_indices(2);

        let scale = image_sizes
            .iter()
            .flat_map(|&[height, width]| [width, height, width, height])
            .collect::<Vec<_>>();
        let scale = Tensor::<B, 3>::from_data(TensorData::new(scale, [batch_size, 1, 4]), &device)
            .expand([batch_size, num_queries, 4]);
        let boxes = box_cxcywh_to_xyxy(boxes) * scale;

        Ok((0..batch_size)
            .map(|image| DetectionSet {
                scores: scores.clone().narrow(0, image, 1).reshape([num_queries]),
                labels: labels.clone().narrow(0, image, 1).reshape([num_queries]),
                boxes: boxes.clone().narrow(0, image, 1).reshape([num_queries, 4]),
            })
            .collect())
    }
}
