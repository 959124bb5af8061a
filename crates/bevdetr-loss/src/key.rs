//! Loss names, structured loss keys and the loss map returned by the criterion.

use std::{collections::BTreeMap, fmt, str::FromStr};

use burn::tensor::{backend::Backend, ElementConversion, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{CriterionError, CriterionResult};

/// A loss function that can be requested from the criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    /// Weighted cross-entropy over all queries, plus the `class_error` diagnostic.
    Labels,
    /// Predicted versus true object count. Logging only.
    Cardinality,
    /// L1 and GIoU on matched 2D boxes.
    Boxes,
    /// L1 on the BEV center point.
    Bev,
    /// L1 between the head point projected to BEV and the BEV target.
    Head,
    /// L1 between the feet point projected to BEV and the BEV target.
    Feet,
    /// Compensated relative L1 on footprint dimensions.
    Dim,
    /// Heading bin classification plus residual regression.
    Angle,
    /// Depth bin classification plus in-bin residual regression.
    Depth,
    /// Sigmoid focal and dice loss on instance masks.
    Masks,
}

impl LossKind {
    /// All registered losses, in dispatch order.
    pub const ALL: [Self; 10] = [
        Self::Labels,
        Self::Cardinality,
        Self::Boxes,
        Self::Bev,
        Self::Head,
        Self::Feet,
        Self::Dim,
        Self::Angle,
        Self::Depth,
        Self::Masks,
    ];

    /// Registry name of the loss.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Labels => "labels",
            Self::Cardinality => "cardinality",
            Self::Boxes => "boxes",
            Self::Bev => "bev",
            Self::Head => "head",
            Self::Feet => "feet",
            Self::Dim => "dim",
            Self::Angle => "angle",
            Self::Depth => "depth",
            Self::Masks => "masks",
        }
    }

    /// Every loss of the detection task, masks excluded.
    pub fn detection_defaults() -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|kind| *kind != Self::Masks)
            .collect()
    }

    /// Parse a list of registry names, rejecting the first unknown one.
    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> CriterionResult<Vec<Self>> {
        names.iter().map(|name| name.as_ref().parse()).collect()
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LossKind {
    type Err = CriterionError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| CriterionError::UnknownLoss {
                name: name.to_string(),
            })
    }
}

/// A named scalar produced by a loss function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LossTerm {
    Ce,
    ClassError,
    CardinalityError,
    Bbox,
    Giou,
    Bev,
    HeadBev,
    FeetBev,
    Dim,
    Angle,
    Depth,
    Mask,
    Dice,
}

impl LossTerm {
    pub const ALL: [Self; 13] = [
        Self::Ce,
        Self::ClassError,
        Self::CardinalityError,
        Self::Bbox,
        Self::Giou,
        Self::Bev,
        Self::HeadBev,
        Self::FeetBev,
        Self::Dim,
        Self::Angle,
        Self::Depth,
        Self::Mask,
        Self::Dice,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ce => "loss_ce",
            Self::ClassError => "class_error",
            Self::CardinalityError => "cardinality_error",
            Self::Bbox => "loss_bbox",
            Self::Giou => "loss_giou",
            Self::Bev => "loss_bev",
            Self::HeadBev => "loss_head_bev",
            Self::FeetBev => "loss_feet_bev",
            Self::Dim => "loss_dim",
            Self::Angle => "loss_angle",
            Self::Depth => "loss_depth",
            Self::Mask => "loss_mask",
            Self::Dice => "loss_dice",
        }
    }

    /// Diagnostics are reported but never weighted into the training objective.
    pub const fn is_diagnostic(self) -> bool {
        matches!(self, Self::ClassError | Self::CardinalityError)
    }
}

impl fmt::Display for LossTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A loss term together with the decoder layer it was computed on.
///
/// `layer` is `None` for the final layer and `Some(i)` for the `i`-th auxiliary layer.
/// Renders as `loss_ce` or `loss_ce_0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LossKey {
    pub term: LossTerm,
    pub layer: Option<usize>,
}

impl LossKey {
    /// Key of a final-layer term.
    pub const fn new(term: LossTerm) -> Self {
        Self { term, layer: None }
    }

    /// Key of a term computed on auxiliary layer `layer`.
    pub const fn aux(term: LossTerm, layer: usize) -> Self {
        Self {
            term,
            layer: Some(layer),
        }
    }

    /// Same term moved to `layer`.
    pub const fn with_layer(self, layer: Option<usize>) -> Self {
        Self {
            term: self.term,
            layer,
        }
    }
}

impl From<LossTerm> for LossKey {
    fn from(term: LossTerm) -> Self {
        Self::new(term)
    }
}

impl fmt::Display for LossKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.layer {
            Some(layer) => write!(f, "{}_{layer}", self.term),
            None => write!(f, "{}", self.term),
        }
    }
}

/// Ordered mapping from loss keys to scalar tensors of shape `[1]`.
#[derive(Debug, Clone)]
pub struct LossMap<B: Backend> {
    entries: BTreeMap<LossKey, Tensor<B, 1>>,
}

impl<B: Backend> Default for LossMap<B> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<B: Backend> LossMap<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous one stored under `key`.
    pub fn insert(&mut self, key: impl Into<LossKey>, value: Tensor<B, 1>) -> Option<Tensor<B, 1>> {
        self.entries.insert(key.into(), value)
    }

    pub fn get(&self, key: &LossKey) -> Option<&Tensor<B, 1>> {
        self.entries.get(key)
    }

    /// Look an entry up by its rendered name, e.g. `loss_giou_1`.
    pub fn get_named(&self, name: &str) -> Option<&Tensor<B, 1>> {
        self.entries
            .iter()
            .find(|(key, _)| key.to_string() == name)
            .map(|(_, value)| value)
    }

    pub fn contains(&self, key: &LossKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LossKey, &Tensor<B, 1>)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &LossKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Move every entry of `other` into this map, re-keyed to `layer`.
    pub fn extend_layer(&mut self, other: Self, layer: Option<usize>) {
        for (key, value) in other.entries {
            self.entries.insert(key.with_layer(layer), value);
        }
    }

    /// Render the names and read every value back to the host.
    pub fn to_scalars(&self) -> BTreeMap<String, f64> {
        self.entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone().into_scalar().elem::<f64>()))
            .collect()
    }
}

impl<B: Backend> IntoIterator for LossMap<B> {
    type Item = (LossKey, Tensor<B, 1>);
    type IntoIter = std::collections::btree_map::IntoIter<LossKey, Tensor<B, 1>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
