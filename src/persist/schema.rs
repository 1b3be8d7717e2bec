//! Document types for learner serialization.
//!
//! These types are the on-disk shape of a learner and are kept separate from the
//! runtime types so either side can change without breaking the other. Scalars in
//! parameter blocks are strings; every map is a `BTreeMap` so that JSON output is
//! deterministic.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Version tag written into every document.
pub type VersionSchema = [u32; 3];

// =============================================================================
// Model Document
// =============================================================================

/// Structural model: everything needed to predict.
///
/// Loading a model document and saving it again without changes yields the same
/// JSON bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDocument {
    pub version: VersionSchema,
    pub learner: LearnerModelSchema,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnerModelSchema {
    pub learner_model_param: LearnerModelParamSchema,
    pub objective: ObjectiveSchema,
    pub gradient_booster: GradientBoosterSchema,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub feature_names: Vec<String>,
    #[serde(default)]
    pub feature_types: Vec<String>,
}

/// Learner-level model parameters.
///
/// `base_score` is in output space, formatted as `[v0,v1,...]` with one entry
/// per output group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnerModelParamSchema {
    pub base_score: String,
    pub boost_from_average: String,
    pub num_class: String,
    pub num_feature: String,
    pub num_target: String,
}

/// Objective identity and its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveSchema {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// Booster weights, tagged by booster name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum GradientBoosterSchema {
    #[serde(rename = "gbtree")]
    GbTree { model: GbTreeModelSchema },
    #[serde(rename = "gblinear")]
    GbLinear { model: GbLinearModelSchema },
}

impl GradientBoosterSchema {
    pub fn name(&self) -> &'static str {
        match self {
            Self::GbTree { .. } => "gbtree",
            Self::GbLinear { .. } => "gblinear",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GbTreeModelSchema {
    pub gbtree_model_param: GbTreeModelParamSchema,
    pub trees: Vec<TreeSchema>,
    /// Output group of every tree.
    pub tree_info: Vec<u32>,
    /// Tree offsets of every layer, starting at 0.
    pub iteration_indptr: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GbTreeModelParamSchema {
    pub num_parallel_tree: String,
    pub num_trees: String,
}

/// One regression tree in struct-of-arrays form.
///
/// For leaves `split_conditions` holds the leaf value and the children are -1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeSchema {
    pub id: usize,
    pub tree_param: TreeParamSchema,
    pub left_children: Vec<i32>,
    pub right_children: Vec<i32>,
    pub parents: Vec<i32>,
    pub split_indices: Vec<u32>,
    pub split_conditions: Vec<f32>,
    pub default_left: Vec<u8>,
    pub base_weights: Vec<f32>,
    pub loss_changes: Vec<f32>,
    pub sum_hessian: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeParamSchema {
    pub num_feature: String,
    pub num_nodes: String,
}

/// Linear weights, `(num_feature + 1) * num_group` with the biases last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GbLinearModelSchema {
    pub boosted_rounds: String,
    pub weights: Vec<f32>,
}

// =============================================================================
// Config Document
// =============================================================================

/// Runtime configuration. Not guaranteed stable across crate versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    pub version: VersionSchema,
    pub learner: LearnerConfigSchema,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnerConfigSchema {
    pub generic_param: BTreeMap<String, String>,
    pub learner_train_param: BTreeMap<String, String>,
    pub learner_model_param: LearnerModelParamSchema,
    pub objective: ObjectiveSchema,
    pub gradient_booster: BoosterConfigSchema,
    #[serde(default)]
    pub metrics: Vec<String>,
}

/// Booster name and hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoosterConfigSchema {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

// =============================================================================
// Snapshot
// =============================================================================

/// Payload of the binary container: model plus configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnerSnapshot {
    pub model: ModelDocument,
    pub config: ConfigDocument,
}
