//! Gradient boosters.
//!
//! A booster owns the model weights (trees or linear coefficients), grows them one
//! layer per iteration from gradients, and predicts margins. [`create`] maps a
//! booster name to a [`Booster`], a tagged enum that implements
//! [`GradientBooster`] by delegating to [`GbTree`] or [`GbLinear`].
//!
//! Margins are `[n_groups, n_rows]` arrays; one layer holds one tree (or
//! `num_parallel_tree` trees) per output group.

mod linear;
pub mod tree;

pub use linear::{FeatureSelectorKind, GbLinear, LinearTrainParam, LinearUpdaterKind};
pub use tree::{GbTree, RegTree, TreeMethod, TreeTrainParam};

use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::ops::Range;
use std::str::FromStr;

use ndarray::Array2;

use crate::collective::Communicator;
use crate::context::{DeviceOrd, GlobalRandom};
use crate::data::DMatrix;
use crate::error::{LearnerError, Result};
use crate::gradients::Gradients;
use crate::logger::TrainingLogger;
use crate::params::ParamSet;
use crate::persist::GradientBoosterSchema;
use crate::utils::Parallelism;

/// Booster used when none is configured.
pub const DEFAULT_BOOSTER: &str = "gbtree";

// =============================================================================
// Environments
// =============================================================================

/// Shared state a booster reads while boosting one layer.
pub struct BoostEnv<'a> {
    pub comm: &'a dyn Communicator,
    pub rng: &'a GlobalRandom,
    pub parallelism: Parallelism,
    pub num_feature: usize,
    pub num_group: usize,
    pub logger: &'a TrainingLogger,
}

/// Shared state a booster reads while predicting.
pub struct PredictEnv<'a> {
    pub comm: &'a dyn Communicator,
    pub parallelism: Parallelism,
    pub num_feature: usize,
    pub num_group: usize,
}

// =============================================================================
// Feature importance
// =============================================================================

/// Kind of feature importance reported by [`GradientBooster::feature_score`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportanceType {
    /// Number of splits on the feature.
    Weight,
    /// Average loss change of splits on the feature.
    Gain,
    /// Average cover of splits on the feature.
    Cover,
    TotalGain,
    TotalCover,
}

impl FromStr for ImportanceType {
    type Err = LearnerError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "weight" => Self::Weight,
            "gain" => Self::Gain,
            "cover" => Self::Cover,
            "total_gain" => Self::TotalGain,
            "total_cover" => Self::TotalCover,
            other => return Err(LearnerError::validation(format!("unknown importance type: `{other}`"))),
        })
    }
}

impl fmt::Display for ImportanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Weight => "weight",
            Self::Gain => "gain",
            Self::Cover => "cover",
            Self::TotalGain => "total_gain",
            Self::TotalCover => "total_cover",
        })
    }
}

// =============================================================================
// Booster Trait
// =============================================================================

/// A gradient booster.
///
/// Hyper-parameters are applied through the [`ParamSet`] supertrait.
pub trait GradientBooster: ParamSet + Send + Sync + Debug {
    /// Registry name, e.g. `gbtree`.
    fn name(&self) -> &'static str;

    /// Number of layers (iterations) in the model.
    fn boosted_rounds(&self) -> usize;

    /// Whether predictions of layers `a..b` and `b..c` add up to those of `a..c`.
    fn layer_additive(&self) -> bool {
        true
    }

    /// Device the booster will report for a requested device.
    fn resolve_device(&self, requested: DeviceOrd, logger: &TrainingLogger) -> DeviceOrd;

    /// Reject data distributions the booster cannot train on.
    fn check_data_split(&self, data: &DMatrix, comm: &dyn Communicator) -> Result<()>;

    /// Grow one layer from `gradients` (`n_groups` outputs over the rows of `data`).
    fn do_boost(&mut self, data: &DMatrix, gradients: &Gradients, env: &BoostEnv<'_>) -> Result<()>;

    /// Add margins of `layers` to `out` (`[n_groups, n_rows]`).
    fn predict_margin(
        &self,
        data: &DMatrix,
        layers: Range<usize>,
        env: &PredictEnv<'_>,
        out: &mut Array2<f32>,
    ) -> Result<()>;

    /// Leaf index reached in every tree of `layers`, `(n_rows, n_trees)`.
    fn predict_leaf(&self, data: &DMatrix, layers: Range<usize>, env: &PredictEnv<'_>) -> Result<Array2<f32>>;

    /// Per-feature contributions, `(n_rows, n_groups * (num_feature + 1))` with the
    /// bias last within every group. Base margins are not included.
    fn predict_contribution(
        &self,
        data: &DMatrix,
        layers: Range<usize>,
        env: &PredictEnv<'_>,
    ) -> Result<Array2<f32>>;

    /// Importance per used feature index, ascending by feature.
    fn feature_score(&self, importance: ImportanceType) -> Result<Vec<(usize, f32)>>;

    fn save_model(&self) -> GradientBoosterSchema;

    fn load_model(&mut self, schema: GradientBoosterSchema, num_feature: usize, num_group: usize) -> Result<()>;
}

// =============================================================================
// Booster Enum
// =============================================================================

/// Booster selected by name.
#[derive(Debug, Clone)]
pub enum Booster {
    GbTree(GbTree),
    GbLinear(GbLinear),
}

/// Names accepted by [`create`].
pub const BOOSTER_NAMES: [&str; 2] = ["gbtree", "gblinear"];

/// Create a booster with default parameters from its registry name.
pub fn create(name: &str) -> Result<Booster> {
    match name {
        "gbtree" => Ok(Booster::GbTree(GbTree::default())),
        "gblinear" => Ok(Booster::GbLinear(GbLinear::default())),
        other => Err(LearnerError::validation(format!(
            "unknown gradient booster: `{other}`, expected one of {BOOSTER_NAMES:?}"
        ))),
    }
}

macro_rules! delegate {
    ($self:ident, $inner:ident => $body:expr) => {
        match $self {
            Booster::GbTree($inner) => $body,
            Booster::GbLinear($inner) => $body,
        }
    };
}

impl ParamSet for Booster {
    fn apply(&mut self, key: &str, value: &str) -> Result<bool> {
        delegate!(self, inner => inner.apply(key, value))
    }

    fn to_args(&self) -> BTreeMap<String, String> {
        delegate!(self, inner => inner.to_args())
    }
}

impl GradientBooster for Booster {
    fn name(&self) -> &'static str {
        delegate!(self, inner => inner.name())
    }

    fn boosted_rounds(&self) -> usize {
        delegate!(self, inner => inner.boosted_rounds())
    }

    fn layer_additive(&self) -> bool {
        delegate!(self, inner => inner.layer_additive())
    }

    fn resolve_device(&self, requested: DeviceOrd, logger: &TrainingLogger) -> DeviceOrd {
        delegate!(self, inner => inner.resolve_device(requested, logger))
    }

    fn check_data_split(&self, data: &DMatrix, comm: &dyn Communicator) -> Result<()> {
        delegate!(self, inner => inner.check_data_split(data, comm))
    }

    fn do_boost(&mut self, data: &DMatrix, gradients: &Gradients, env: &BoostEnv<'_>) -> Result<()> {
        delegate!(self, inner => inner.do_boost(data, gradients, env))
    }

    fn predict_margin(
        &self,
        data: &DMatrix,
        layers: Range<usize>,
        env: &PredictEnv<'_>,
        out: &mut Array2<f32>,
    ) -> Result<()> {
        delegate!(self, inner => inner.predict_margin(data, layers, env, out))
    }

    fn predict_leaf(&self, data: &DMatrix, layers: Range<usize>, env: &PredictEnv<'_>) -> Result<Array2<f32>> {
        delegate!(self, inner => inner.predict_leaf(data, layers, env))
    }

    fn predict_contribution(
        &self,
        data: &DMatrix,
        layers: Range<usize>,
        env: &PredictEnv<'_>,
    ) -> Result<Array2<f32>> {
        delegate!(self, inner => inner.predict_contribution(data, layers, env))
    }

    fn feature_score(&self, importance: ImportanceType) -> Result<Vec<(usize, f32)>> {
        delegate!(self, inner => inner.feature_score(importance))
    }

    fn save_model(&self) -> GradientBoosterSchema {
        delegate!(self, inner => inner.save_model())
    }

    fn load_model(&mut self, schema: GradientBoosterSchema, num_feature: usize, num_group: usize) -> Result<()> {
        delegate!(self, inner => inner.load_model(schema, num_feature, num_group))
    }
}

/// Resolve `iteration_begin..iteration_end` against `rounds`; an end of 0 means all.
pub fn layer_range(begin: usize, end: usize, rounds: usize) -> Result<Range<usize>> {
    let end = if end == 0 { rounds } else { end };
    if begin > end || end > rounds {
        return Err(LearnerError::validation(format!(
            "iteration range {begin}..{end} is outside the {rounds} boosted rounds"
        )));
    }
    Ok(begin..end)
}
