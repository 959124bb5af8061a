//! Static loss weights and the reduction of a [`LossMap`] to the training objective.

use std::collections::BTreeMap;

use burn::{
    config::Config,
    tensor::{backend::Backend, Tensor},
};

use crate::{
    error::{CriterionError, CriterionResult},
    key::{LossKey, LossMap, LossTerm},
};

/// Weight coefficient of every loss term.
#[derive(Config, Debug)]
pub struct LossWeightsConfig {
    /// Classification. Default: 1.0
    #[config(default = 1.0)]
    pub ce: f64,
    /// 2D box L1. Default: 5.0
    #[config(default = 5.0)]
    pub bbox: f64,
    /// 2D box GIoU. Default: 2.0
    #[config(default = 2.0)]
    pub giou: f64,
    /// BEV center point. Default: 1.0
    #[config(default = 1.0)]
    pub bev: f64,
    /// BEV head point. Default: 1.0
    #[config(default = 1.0)]
    pub head_bev: f64,
    /// BEV feet point. Default: 1.0
    #[config(default = 1.0)]
    pub feet_bev: f64,
    /// Footprint dimensions. Default: 1.0
    #[config(default = 1.0)]
    pub dim: f64,
    /// Heading. Default: 1.0
    #[config(default = 1.0)]
    pub angle: f64,
    /// Depth. Default: 1.0
    #[config(default = 1.0)]
    pub depth: f64,
    /// Mask focal loss. Default: 1.0
    #[config(default = 1.0)]
    pub mask: f64,
    /// Mask dice loss. Default: 1.0
    #[config(default = 1.0)]
    pub dice: f64,
}

impl LossWeightsConfig {
    /// Weight of `term`, `None` for diagnostics.
    pub fn weight_of(&self, term: LossTerm) -> Option<f64> {
        match term {
            LossTerm::Ce => Some(self.ce),
            LossTerm::Bbox => Some(self.bbox),
            LossTerm::Giou => Some(self.giou),
            LossTerm::Bev => Some(self.bev),
            LossTerm::HeadBev => Some(self.head_bev),
            LossTerm::FeetBev => Some(self.feet_bev),
            LossTerm::Dim => Some(self.dim),
            LossTerm::Angle => Some(self.angle),
            LossTerm::Depth => Some(self.depth),
            LossTerm::Mask => Some(self.mask),
            LossTerm::Dice => Some(self.dice),
            LossTerm::ClassError | LossTerm::CardinalityError => None,
        }
    }
}

const WEIGHTED_TERMS: [LossTerm; 9] = [
    LossTerm::Ce,
    LossTerm::Bbox,
    LossTerm::Giou,
    LossTerm::Bev,
    LossTerm::HeadBev,
    LossTerm::FeetBev,
    LossTerm::Dim,
    LossTerm::Angle,
    LossTerm::Depth,
];

/// Immutable mapping from loss keys to weights, including one suffixed copy per
/// auxiliary decoder layer.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTable {
    weights: BTreeMap<LossKey, f64>,
}

impl WeightTable {
    /// Build the table for `aux_layers` auxiliary layers. Mask terms are only weighted
    /// when `masks` is set.
    ///
    /// # Panics
    ///
    /// Panics if a weight is negative or not finite.
    pub fn new(config: &LossWeightsConfig, aux_layers: usize, masks: bool) -> Self {
        let mut terms = WEIGHTED_TERMS.to_vec();
        if masks {
            terms.extend([LossTerm::Mask, LossTerm::Dice]);
        }

        let mut weights = BTreeMap::new();
        for term in terms {
            let Some(weight) = config.weight_of(term) else {
                continue;
            };
            assert!(
                weight.is_finite() && weight >= 0.0,
                "Weight of {term} must be finite and non-negative, got {weight}"
            );
            weights.insert(LossKey::new(term), weight);
            for layer in 0..aux_layers {
                weights.insert(LossKey::aux(term, layer), weight);
            }
        }

        Self { weights }
    }

    /// Weight of `key`, `None` when the term does not enter the objective.
    pub fn weight(&self, key: &LossKey) -> Option<f64> {
        self.weights.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Weights keyed by rendered loss name.
    pub fn to_names(&self) -> BTreeMap<String, f64> {
        self.weights
            .iter()
            .map(|(key, weight)| (key.to_string(), *weight))
            .collect()
    }

    /// `Σ weight · loss` over the entries of `losses` that have a weight.
    ///
    /// # Errors
    ///
    /// Returns [`CriterionError::InvalidInput`] when no entry of `losses` is weighted.
    pub fn weighted_total<B: Backend>(&self, losses: &LossMap<B>) -> CriterionResult<Tensor<B, 1>> {
        losses
            .iter()
            .filter_map(|(key, value)| {
                self.weight(key)
                    .map(|weight| value.clone().mul_scalar(weight))
            })
            .reduce(|total, value| total + value)
            .ok_or_else(|| CriterionError::InvalidInput {
                reason: "no weighted loss term to sum".to_string(),
            })
    }

    /// Every entry multiplied by its weight; entries without a weight pass through.
    pub fn scaled<B: Backend>(&self, losses: &LossMap<B>) -> LossMap<B> {
        let mut scaled = LossMap::new();
        for (key, value) in losses.iter() {
            let value = match self.weight(key) {
                Some(weight) => value.clone().mul_scalar(weight),
                None => value.clone(),
            };
            scaled.insert(*key, value);
        }
        scaled
    }
}
