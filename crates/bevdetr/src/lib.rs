//! # BEV-DETR
//!
//! Detector assembly for BEV-DETR: a detection transformer whose queries predict 2D boxes
//! together with bird's-eye-view position, footprint, heading and depth.
//!
//! - `config`: the [`DetectorConfig`] file format and its validation.
//! - `components`: [`build`] turns a configuration into heads, criterion, weight table and
//!   post-processor.
//! - `report`: [`compute_losses`] runs one training step's criterion and summarizes it.
//!
//! The building blocks are re-exported as [`loss`], [`model`] and [`inference`].

mod components;
mod config;
mod report;

#[doc(inline)]
pub use bevdetr_inference as inference;
#[doc(inline)]
pub use bevdetr_loss as loss;
#[doc(inline)]
pub use bevdetr_model as model;
#[doc(inline)]
pub use components::{build, DetectorComponents};
#[doc(inline)]
pub use config::DetectorConfig;
#[doc(inline)]
pub use report::{compute_losses, LossReport};

#[cfg(test)]
mod tests {
    use burn::backend::{Autodiff, NdArray};

    pub type TestBackend = NdArray;

    pub type TestAutodiffBackend = Autodiff<TestBackend>;
}
