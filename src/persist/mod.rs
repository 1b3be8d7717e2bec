//! Learner persistence.
//!
//! Two JSON documents with different guarantees:
//!
//! - [`ModelDocument`]: the structural model (objective, booster weights, base
//!   score, feature info, attributes). Stable; a load/save cycle is byte-exact.
//! - [`ConfigDocument`]: runtime configuration (generic and training parameters,
//!   booster hyper-parameters, metrics). May change between crate versions.
//!
//! [`native`] wraps both in a checksummed binary container.

mod convert;
pub mod native;
mod schema;

pub use convert::{current_version, format_base_score, parse_base_score};
pub use native::{BoosterType, FormatError, FormatHeader, read_container, write_container};
pub use schema::{
    BoosterConfigSchema, ConfigDocument, GbLinearModelSchema, GbTreeModelParamSchema, GbTreeModelSchema,
    GradientBoosterSchema, LearnerConfigSchema, LearnerModelParamSchema, LearnerModelSchema, LearnerSnapshot,
    ModelDocument, ObjectiveSchema, TreeParamSchema, TreeSchema, VersionSchema,
};
