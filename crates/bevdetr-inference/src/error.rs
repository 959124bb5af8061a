use bevdetr_loss::{CriterionError, OutputField};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PostProcessError {
    #[error("Post-processing requires the `{field}` output")]
    MissingOutput { field: OutputField },

    #[error("Got predictions for {predictions} images but {sizes} image sizes")]
    BatchSizeMismatch { predictions: usize, sizes: usize },

    #[error("Classification logits need at least one object class besides no-object")]
    NoObjectClasses,

    #[error("Invalid prediction bundle: {0}")]
    InvalidBundle(#[from] CriterionError),
}

pub type PostProcessResult<T> = Result<T, PostProcessError>;
