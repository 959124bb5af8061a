use anyhow::{Context, Result};
use bevdetr_inference::PostProcess;
use bevdetr_loss::{SetCriterion, WeightTable};
use bevdetr_model::DetrHeads;
use burn::prelude::*;

use crate::config::DetectorConfig;

/// The runtime parts of a detector built from one [`DetectorConfig`].
#[derive(Debug)]
pub struct DetectorComponents<B: Backend> {
    pub heads: DetrHeads<B>,
    pub criterion: SetCriterion<B>,
    pub postprocess: PostProcess,
    pub weights: WeightTable,
}

/// Validate `config` and build the heads, criterion, post-processor and weight table.
pub fn build<B: Backend>(
    config: &DetectorConfig,
    device: &Device<B>,
) -> Result<DetectorComponents<B>> {
    config.validate().context("invalid detector configuration")?;

    let criterion = config
        .criterion_config()
        .init(device)
        .context("failed to build the set criterion")?;
    let components = DetectorComponents {
        heads: config.heads_config().init(device),
        criterion,
        postprocess: PostProcess::new(),
        weights: config.weight_table(),
    };

    tracing::debug!(
        num_classes = config.num_classes,
        losses = ?components.criterion.losses(),
        weighted_terms = components.weights.len(),
        "detector built"
    );
    Ok(components)
}

#[cfg(test)]
mod tests {
    use bevdetr_loss::LossKind;

    use super::*;
    use crate::tests::TestBackend;

    #[test]
    fn build_wires_masks_into_criterion() {
        let device = Default::default();
        let config = DetectorConfig::new(3).with_hidden_dim(8).with_masks(true);

        let components = build::<TestBackend>(&config, &device).expect("valid configuration");

        assert_eq!(components.criterion.num_classes(), 3);
        assert!(components.criterion.losses().contains(&LossKind::Masks));
        assert_eq!(components.weights.len(), 66);
    }

    #[test]
    fn build_rejects_invalid_configuration() {
        let device = Default::default();
        let config = DetectorConfig::new(3).with_eos_coef(0.0);

        assert!(build::<TestBackend>(&config, &device).is_err());
    }
}
