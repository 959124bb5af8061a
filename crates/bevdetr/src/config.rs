//! Top-level detector configuration.

use std::{fs, path::Path};

use anyhow::{Context, Result};
use bevdetr_loss::{
    losses::{AngleLossConfig, DepthLossConfig, MaskLossConfig},
    CriterionError, CriterionResult, HungarianMatcherConfig, LossKind, LossTerm,
    LossWeightsConfig, SetCriterionConfig, WeightTable, DEFAULT_HEADING_BINS,
};
use bevdetr_model::DetrHeadsConfig;
use burn::config::Config;

/// Everything needed to build the heads, the criterion, the weight table and the
/// post-processor of one detector.
#[derive(Config, Debug)]
pub struct DetectorConfig {
    /// Number of object classes, without the "no-object" class.
    pub num_classes: usize,
    /// Detection slots per image. Default: 100
    #[config(default = "100")]
    pub num_queries: usize,
    /// Width of the decoder hidden states. Default: 256
    #[config(default = "256")]
    pub hidden_dim: usize,
    /// Number of decoder layers. Default: 6
    #[config(default = "6")]
    pub dec_layers: usize,
    /// Supervise every intermediate decoder layer. Default: true
    #[config(default = "true")]
    pub aux_loss: bool,
    /// Train instance masks. Default: false
    #[config(default = "false")]
    pub masks: bool,
    /// Default: 9
    #[config(default = "9")]
    pub num_depth_bins: usize,
    /// Default: 10.0
    #[config(default = "10.0")]
    pub depth_bin_resolution: f64,
    /// Default: 12
    #[config(default = "DEFAULT_HEADING_BINS")]
    pub num_heading_bins: usize,
    /// Relative classification weight of the "no-object" class. Default: 0.1
    #[config(default = "0.1")]
    pub eos_coef: f64,
    /// Detection losses; `masks` is appended when masks are enabled.
    #[config(default = "LossKind::detection_defaults()")]
    pub losses: Vec<LossKind>,
    #[config(default = "LossWeightsConfig::new()")]
    pub weights: LossWeightsConfig,
    #[config(default = "HungarianMatcherConfig::new()")]
    pub matcher: HungarianMatcherConfig,
    #[config(default = "MaskLossConfig::new()")]
    pub mask: MaskLossConfig,
}

impl DetectorConfig {
    /// Read and validate a JSON configuration file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse configuration {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid configuration {}", path.display()))?;
        Ok(config)
    }

    /// Write the configuration as pretty-printed JSON.
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let text =
            serde_json::to_string_pretty(self).context("failed to serialize configuration")?;
        fs::write(path, text)
            .with_context(|| format!("failed to write configuration {}", path.display()))
    }

    /// Number of auxiliary decoder layers that are supervised.
    pub const fn aux_layers(&self) -> usize {
        if self.aux_loss {
            self.dec_layers.saturating_sub(1)
        } else {
            0
        }
    }

    /// Criterion configuration; the mask loss is added when masks are enabled.
    pub fn criterion_config(&self) -> SetCriterionConfig {
        let mut losses = self.losses.clone();
        if self.masks && !losses.contains(&LossKind::Masks) {
            losses.push(LossKind::Masks);
        }

        SetCriterionConfig::new(self.num_classes)
            .with_eos_coef(self.eos_coef)
            .with_losses(losses)
            .with_matcher(self.matcher.clone())
            .with_angle(AngleLossConfig::new().with_num_heading_bins(self.num_heading_bins))
            .with_depth(
                DepthLossConfig::new()
                    .with_num_depth_bins(self.num_depth_bins)
                    .with_depth_bin_resolution(self.depth_bin_resolution),
            )
            .with_mask(self.mask.clone())
    }

    pub fn heads_config(&self) -> DetrHeadsConfig {
        DetrHeadsConfig::new(self.num_classes)
            .with_hidden_dim(self.hidden_dim)
            .with_num_depth_bins(self.num_depth_bins)
            .with_depth_bin_resolution(self.depth_bin_resolution)
            .with_num_heading_bins(self.num_heading_bins)
            .with_aux_loss(self.aux_loss)
    }

    /// Static weights, copied once per auxiliary layer.
    ///
    /// # Panics
    ///
    /// Panics on a negative or non-finite weight; [`validate`](Self::validate) reports
    /// those as errors instead.
    pub fn weight_table(&self) -> WeightTable {
        WeightTable::new(&self.weights, self.aux_layers(), self.masks)
    }

    /// Check the configuration for logical consistency.
    pub fn validate(&self) -> CriterionResult<()> {
        let invalid = |reason: String| Err(CriterionError::InvalidConfiguration { reason });

        if self.num_queries == 0 {
            return invalid("num_queries must be at least 1".to_string());
        }
        if self.hidden_dim == 0 {
            return invalid("hidden_dim must be at least 1".to_string());
        }
        if self.dec_layers == 0 {
            return invalid("dec_layers must be at least 1".to_string());
        }
        if !self.masks && self.losses.contains(&LossKind::Masks) {
            return invalid("the masks loss requires masks to be enabled".to_string());
        }
        for term in LossTerm::ALL {
            if let Some(weight) = self.weights.weight_of(term) {
                if !(weight.is_finite() && weight >= 0.0) {
                    return invalid(format!(
                        "weight of {term} must be finite and non-negative, got {weight}"
                    ));
                }
            }
        }
        self.criterion_config().validate()
    }
}
