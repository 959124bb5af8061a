//! Depth loss: bin classification plus the residual inside the bin.
//!
//! A raw depth `d` is encoded as `bin = floor(d / res)` and
//! `residual = d - bin * res - res / 2`, i.e. the offset from the bin center.

use burn::{
    config::Config,
    module::{Content, DisplaySettings, Module, ModuleDisplay},
    nn::loss::{MseLoss, Reduction},
    tensor::{activation, backend::Backend, Int, Tensor},
};

use crate::error::{CriterionError, CriterionResult};

/// Configuration for creating a [depth loss](DepthLoss).
#[derive(Config, Debug)]
pub struct DepthLossConfig {
    /// Number of depth bins. Default: 9
    #[config(default = 9)]
    pub num_depth_bins: usize,
    /// Width of one depth bin, in metric units. Default: 10.0
    #[config(default = 10.0)]
    pub depth_bin_resolution: f64,
}

impl DepthLossConfig {
    /// Initialize a [depth loss](DepthLoss).
    pub fn init(&self) -> DepthLoss {
        self.assertions();
        DepthLoss {
            num_depth_bins: self.num_depth_bins,
            depth_bin_resolution: self.depth_bin_resolution,
        }
    }

    fn assertions(&self) {
        assert!(
            self.num_depth_bins > 0,
            "DepthLoss needs at least one depth bin"
        );
        assert!(
            self.depth_bin_resolution > 0.0 && self.depth_bin_resolution.is_finite(),
            "Depth bin resolution must be positive, got {}",
            self.depth_bin_resolution
        );
    }
}

/// Depth targets encoded as bin ids and in-bin residuals.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthTargets {
    pub bins: Vec<usize>,
    pub residuals: Vec<f32>,
}

/// Multi-bin depth loss over matched queries.
///
/// `0.5 * mse(delta, residual) + 0.5 * soft_ce(bin_logits, one_hot(bin))`, both averaged
/// over the matched pairs.
#[derive(Module, Clone, Debug)]
#[module(custom_display)]
pub struct DepthLoss {
    pub num_depth_bins: usize,
    pub depth_bin_resolution: f64,
}

impl Default for DepthLoss {
    fn default() -> Self {
        DepthLossConfig::new().init()
    }
}

impl ModuleDisplay for DepthLoss {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        content
            .add("num_depth_bins", &self.num_depth_bins)
            .add("depth_bin_resolution", &self.depth_bin_resolution)
            .optional()
    }
}

impl DepthLoss {
    /// Encode raw depths into bins and residuals.
    ///
    /// # Errors
    ///
    /// Returns [`CriterionError::DepthOutOfRange`] for depths outside of
    /// `[0, num_depth_bins * depth_bin_resolution)`.
    pub fn encode_targets(&self, depths: &[f32]) -> CriterionResult<DepthTargets> {
        let resolution = self.depth_bin_resolution;
        let mut bins = Vec::with_capacity(depths.len());
        let mut residuals = Vec::with_capacity(depths.len());

        for &depth in depths {
            let scaled = f64::from(depth) / resolution;
            if !scaled.is_finite() || scaled < 0.0 || scaled >= self.num_depth_bins as f64 {
                return Err(CriterionError::DepthOutOfRange {
                    depth,
                    bins: self.num_depth_bins,
                    resolution,
                });
            }
            let bin = scaled.floor() as usize;
            bins.push(bin);
            residuals.push((f64::from(depth) - bin as f64 * resolution - resolution / 2.0) as f32);
        }

        Ok(DepthTargets { bins, residuals })
    }

    /// # Shapes
    ///
    /// - bin_logits: `[num_matched, num_depth_bins]`
    /// - delta: `[num_matched]`
    /// - target_bins: `[num_matched]`
    /// - target_residuals: `[num_matched]`
    /// - output: `[1]`
    pub fn forward<B: Backend>(
        &self,
        bin_logits: Tensor<B, 2>,
        delta: Tensor<B, 1>,
        target_bins: Tensor<B, 1, Int>,
        target_residuals: Tensor<B, 1>,
    ) -> Tensor<B, 1> {
        let [num_matched, bins] = bin_logits.dims();
        assert_eq!(
            bins, self.num_depth_bins,
            "Expected {} depth bin logits, got {bins}",
            self.num_depth_bins
        );
        let device = bin_logits.device();

        let one_hot = Tensor::<B, 2>::zeros([num_matched, bins], &device).scatter(
            1,
            target_bins.reshape([num_matched, 1]),
            Tensor::ones([num_matched, 1], &device),
        );
        // Soft cross-entropy against the one-hot target distribution.
        let bin_loss = (one_hot * activation::log_softmax(bin_logits, 1))
            .sum_dim(1)
            .neg()
            .mean();

        let delta_loss = MseLoss::new().forward(delta, target_residuals, Reduction::Mean);

        (delta_loss + bin_loss).mul_scalar(0.5)
    }
}
