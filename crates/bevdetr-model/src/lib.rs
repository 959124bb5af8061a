//! Prediction heads of a BEV-DETR detector.
//!
//! The transformer decoders are external; this crate turns their per-layer hidden states
//! into the [`DetectionOutputs`](bevdetr_loss::DetectionOutputs) consumed by the set
//! criterion and the post-processor.

mod heads;
mod mlp;

#[doc(inline)]
pub use heads::{DetrHeads, DetrHeadsConfig, DetrHeadsRecord};
#[doc(inline)]
pub use mlp::{Mlp, MlpConfig, MlpRecord};

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    pub type TestBackend = NdArray;
}
