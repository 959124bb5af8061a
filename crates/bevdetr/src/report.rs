//! Loss reporting for one training step.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use bevdetr_loss::{
    Collective, CollectiveResult, DetectionOutputs, ObjectTargets, SetCriterion, WeightTable,
};
use burn::prelude::*;

/// Objective and scalar summaries of one training step.
#[derive(Debug, Clone)]
pub struct LossReport<B: Backend> {
    /// Weighted sum to backpropagate.
    pub total: Tensor<B, 1>,
    /// Every criterion output by name, unweighted.
    pub unscaled: BTreeMap<String, f64>,
    /// Weighted values of the terms that enter the objective.
    pub scaled: BTreeMap<String, f64>,
}

impl<B: Backend> LossReport<B> {
    /// Sum of the scaled terms.
    pub fn loss_value(&self) -> f64 {
        self.scaled.values().sum()
    }

    /// Average the scalar summaries over every worker, for logging.
    ///
    /// Every worker must call this with the same keys. `total` is left untouched.
    pub fn reduced(&self, collective: &dyn Collective) -> CollectiveResult<Self> {
        let reduce = |values: &BTreeMap<String, f64>| {
            values
                .iter()
                .map(|(name, value)| {
                    collective
                        .all_reduce_mean(*value)
                        .map(|mean| (name.clone(), mean))
                })
                .collect::<CollectiveResult<BTreeMap<_, _>>>()
        };

        Ok(Self {
            total: self.total.clone(),
            unscaled: reduce(&self.unscaled)?,
            scaled: reduce(&self.scaled)?,
        })
    }
}

/// Run the criterion on one batch and weight its outputs.
///
/// # Errors
///
/// Fails when the criterion fails or when the objective is not finite.
pub fn compute_losses<B: Backend>(
    criterion: &SetCriterion<B>,
    weights: &WeightTable,
    outputs: &DetectionOutputs<B>,
    targets: &[ObjectTargets],
) -> Result<LossReport<B>> {
    let losses = criterion
        .forward(outputs, targets)
        .context("failed to compute the criterion")?;
    let total = weights.weighted_total(&losses)?;

    let unscaled = losses.to_scalars();
    let weighted = weights.to_names();
    let scaled = weights
        .scaled(&losses)
        .to_scalars()
        .into_iter()
        .filter(|(name, _)| weighted.contains_key(name))
        .collect::<BTreeMap<_, _>>();
    let report = LossReport {
        total,
        unscaled,
        scaled,
    };

    let loss_value = report.loss_value();
    if !loss_value.is_finite() {
        bail!("Loss is {loss_value}, stopping training: {:?}", report.unscaled);
    }

    tracing::info!(
        loss = loss_value,
        loss_ce = report.scaled.get("loss_ce"),
        loss_bbox = report.scaled.get("loss_bbox"),
        loss_giou = report.scaled.get("loss_giou"),
        class_error = report.unscaled.get("class_error"),
        "training step losses"
    );
    for (name, value) in &report.scaled {
        tracing::debug!(name = name.as_str(), value, "scaled loss");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bevdetr_loss::{InProcessGroup, SingleProcess};
    use burn::tensor::{Distribution, ElementConversion};

    use super::*;
    use crate::{build, config::DetectorConfig, tests::TestAutodiffBackend};

    type B = TestAutodiffBackend;

    fn targets() -> Vec<ObjectTargets> {
        vec![
            ObjectTargets::new(vec![0, 1])
                .with_boxes(vec![[0.3, 0.4, 0.2, 0.3], [0.7, 0.6, 0.1, 0.2]])
                .with_bev(vec![[0.2, 0.5], [0.8, 0.3]])
                .with_dim(vec![[1.5, 4.0], [0.6, 0.8]])
                .with_heading(vec![3, 11], vec![0.1, -0.2])
                .with_depth(vec![12.0, 47.5]),
            ObjectTargets::new(vec![2])
                .with_boxes(vec![[0.5, 0.5, 0.4, 0.4]])
                .with_bev(vec![[0.5, 0.9]])
                .with_dim(vec![[1.8, 4.5]])
                .with_heading(vec![0], vec![0.0])
                .with_depth(vec![3.0]),
        ]
    }

    fn states(device: &Device<B>) -> Tensor<B, 4> {
        Tensor::random([3, 2, 6, 16], Distribution::Normal(0.0, 1.0), device)
    }

    #[test]
    fn training_step_backpropagates_into_decoder_states() {
        let device = Default::default();
        let config = DetectorConfig::new(3)
            .with_hidden_dim(16)
            .with_num_queries(6)
            .with_dec_layers(3);
        let components = build::<B>(&config, &device).expect("valid configuration");

        let image_states = states(&device).require_grad();
        let bev_states = states(&device).require_grad();
        let outputs = components
            .heads
            .forward(image_states.clone(), bev_states.clone());

        let report = compute_losses(
            &components.criterion,
            &components.weights,
            &outputs,
            &targets(),
        )
        .expect("losses computed");

        assert!(report.unscaled.contains_key("class_error"));
        assert!(report.unscaled.contains_key("loss_depth_1"));
        assert!(!report.scaled.contains_key("cardinality_error"));
        assert_eq!(report.scaled.len(), 9 * 3);
        let total = report.total.clone().into_scalar().elem::<f64>();
        assert!((total - report.loss_value()).abs() < 1e-3 * total.abs().max(1.0));

        let grads = report.total.backward();
        assert!(image_states.grad(&grads).is_some());
        assert!(bev_states.grad(&grads).is_some());
    }

    fn report(scale: f64) -> LossReport<TestAutodiffBackend> {
        let device = Default::default();
        LossReport {
            total: Tensor::from_floats([scale], &device),
            unscaled: BTreeMap::from([("loss_ce".to_string(), scale)]),
            scaled: BTreeMap::from([("loss_ce".to_string(), 2.0 * scale)]),
        }
    }

    #[test]
    fn single_process_reduction_keeps_values() {
        let reduced = report(1.5).reduced(&SingleProcess).expect("identity reduce");

        assert_eq!(reduced.unscaled["loss_ce"], 1.5);
        assert_eq!(reduced.loss_value(), 3.0);
    }

    #[test]
    fn reduction_averages_over_workers() {
        let handles = InProcessGroup::new(2, std::time::Duration::from_secs(5));
        let workers = handles
            .into_iter()
            .zip([1.0, 3.0])
            .map(|(handle, scale)| {
                let handle: Arc<dyn Collective> = Arc::new(handle);
                std::thread::spawn(move || {
                    report(scale)
                        .reduced(handle.as_ref())
                        .expect("all workers arrive")
                        .scaled
                })
            })
            .collect::<Vec<_>>();

        for worker in workers {
            let scaled = worker.join().expect("worker thread");
            assert_eq!(scaled["loss_ce"], 4.0);
        }
    }
}
