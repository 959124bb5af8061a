//! Error types for the matching and loss engine.
//!
//! Every failure here is a hard failure for the current training step. Configuration
//! problems (unknown loss names, missing fields) are meant to surface during integration,
//! while shape and range problems point at a caller or data bug.

use thiserror::Error;

use crate::{
    bundle::{OutputField, TargetField},
    collective::CollectiveError,
    LossKind,
};

/// The error type for criterion, matcher and per-task loss operations.
#[derive(Error, Debug)]
pub enum CriterionError {
    /// A loss or the matcher needs a prediction field the model did not produce.
    #[error("model output is missing `{field}` required by {consumer}")]
    MissingOutput {
        /// The absent prediction field.
        field: OutputField,
        /// The component that requested the field.
        consumer: &'static str,
    },

    /// A loss or the matcher needs a target field an image does not carry.
    #[error("targets of image {image} are missing `{field}` required by {consumer}")]
    MissingTarget {
        /// The absent target field.
        field: TargetField,
        /// Index of the image within the batch.
        image: usize,
        /// The component that requested the field.
        consumer: &'static str,
    },

    /// A loss name that is not part of the registry.
    #[error("unknown loss `{name}`")]
    UnknownLoss {
        /// The rejected name.
        name: String,
    },

    /// Predictions and targets disagree on the number of images.
    #[error("batch size mismatch: predictions have {predictions} images, targets have {targets}")]
    BatchSizeMismatch {
        /// Batch size of the prediction tensors.
        predictions: usize,
        /// Number of target entries.
        targets: usize,
    },

    /// An image carries more objects than there are queries to assign them to.
    #[error("image {image} has {targets} targets but only {queries} queries are available")]
    TooManyTargets {
        /// Index of the image within the batch.
        image: usize,
        /// Number of targets of that image.
        targets: usize,
        /// Number of queries per image.
        queries: usize,
    },

    /// A tensor or target field has an unexpected shape.
    #[error("shape mismatch for `{field}`: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Name of the offending field.
        field: String,
        /// Expected shape description.
        expected: String,
        /// Actual shape description.
        actual: String,
    },

    /// A class label or heading bin outside of the configured range.
    #[error("image {image}: `{field}` value {value} is out of range [0, {limit})")]
    IndexOutOfRange {
        /// The offending target field.
        field: TargetField,
        /// Index of the image within the batch.
        image: usize,
        /// The offending value.
        value: usize,
        /// Exclusive upper bound.
        limit: usize,
    },

    /// A target depth that does not fall into any depth bin.
    #[error("depth {depth} is outside of the {bins} bins of width {resolution}")]
    DepthOutOfRange {
        /// The offending depth, in metric units.
        depth: f32,
        /// Number of depth bins.
        bins: usize,
        /// Width of a depth bin.
        resolution: f64,
    },

    /// Invalid input data that does not fit a more specific variant.
    #[error("invalid input: {reason}")]
    InvalidInput {
        /// Description of the problem.
        reason: String,
    },

    /// The linear assignment solver failed on an image.
    #[error("assignment solver failed on image {image}: {reason}")]
    AssignmentFailed {
        /// Index of the image within the batch.
        image: usize,
        /// Message reported by the solver.
        reason: String,
    },

    /// A configuration that is logically inconsistent.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Description of the problem.
        reason: String,
    },

    /// The cross-worker reduction of the normalization denominator failed.
    #[error("collective reduction failed")]
    Collective(#[from] CollectiveError),
}

impl CriterionError {
    pub(crate) fn missing_output(field: OutputField, consumer: LossKind) -> Self {
        Self::MissingOutput {
            field,
            consumer: consumer.as_str(),
        }
    }

    pub(crate) fn missing_target(field: TargetField, image: usize, consumer: LossKind) -> Self {
        Self::MissingTarget {
            field,
            image,
            consumer: consumer.as_str(),
        }
    }
}

/// A specialized `Result` type for criterion operations.
pub type CriterionResult<T> = Result<T, CriterionError>;
