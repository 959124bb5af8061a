//! Set-based matching and multi-task losses for detection transformers with 3D heads.
//!
//! Every training step matches the fixed set of predicted queries against the
//! variable-length set of ground-truth objects of each image, then evaluates the
//! configured loss terms on the matched pairs:
//!
//! - **Classification**: weighted cross-entropy with a down-weighted "no-object" class
//! - **2D boxes**: L1 and generalized IoU
//! - **BEV points**: L1 on the center, head and feet points
//! - **Dimensions**: relative L1 rescaled to plain L1 magnitude
//! - **Heading and depth**: bin classification plus in-bin residual regression
//! - **Masks** (optional): sigmoid focal and dice loss
//!
//! Sum-based terms are normalized by the number of objects in the batch, averaged across
//! workers through a [`Collective`]. Auxiliary decoder layers are matched and supervised
//! independently and reported under layer-suffixed [`LossKey`]s.
//!
//! ## Usage Example
//!
//! ```rust
//! use bevdetr_loss::{LossWeightsConfig, SetCriterionConfig, WeightTable};
//! use burn::prelude::*;
//!
//! fn build<B: Backend>(device: &B::Device) {
//!     let criterion = SetCriterionConfig::new(3)
//!         .with_eos_coef(0.1)
//!         .init::<B>(device)
//!         .expect("valid criterion configuration");
//!     let weights = WeightTable::new(&LossWeightsConfig::new(), 5, false);
//!     assert_eq!(criterion.num_classes(), 3);
//!     assert!(!weights.is_empty());
//! }
//! ```

pub mod box_ops;
mod bundle;
mod collective;
mod criterion;
mod error;
mod key;
pub mod losses;
mod matcher;
mod weights;

pub use bundle::*;
pub use collective::*;
pub use criterion::*;
pub use error::*;
pub use key::*;
pub use matcher::*;
pub use weights::*;

#[cfg(test)]
mod tests {
    use burn::backend::{Autodiff, NdArray};

    pub type TestBackend = NdArray;
    pub type TestAutodiffBackend = Autodiff<TestBackend>;
}
