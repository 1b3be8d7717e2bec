//! boosters-learner: lifecycle orchestration for gradient-boosted models.
//!
//! A [`Learner`] turns a bag of string parameters into a configured objective and
//! booster, trains them one iteration at a time, predicts from any number of
//! threads, and saves or loads the result as JSON documents or a checksummed
//! binary container.
//!
//! ```
//! use std::sync::Arc;
//! use boosters_learner::{DMatrix, Learner, PredictionCacheEntry, PredictionType};
//!
//! let train = DMatrix::from_vec(vec![0.0, 1.0, 1.0, 0.0, 2.0, 1.0, 3.0, 0.0], 4, 2).unwrap();
//! train.set_label_vec(vec![0.0, 1.0, 0.0, 1.0]).unwrap();
//! let train = Arc::new(train);
//!
//! let mut learner = Learner::create(&[Arc::clone(&train)]);
//! learner.set_param("objective", "binary:logistic");
//! for i in 0..4 {
//!     learner.update_one_iter(i, &train).unwrap();
//! }
//!
//! let mut out = PredictionCacheEntry::default();
//! learner.predict(&train, false, &mut out, 0, 0, PredictionType::Value).unwrap();
//! assert_eq!(out.predictions.dim(), (4, 1));
//! ```
//!
//! Distributed training plugs in through [`collective::Communicator`]; see
//! [`collective::run_distributed`] for an in-process group.

pub mod collective;
pub mod context;
pub mod data;
pub mod error;
pub mod gbm;
pub mod gradients;
pub mod learner;
pub mod logger;
pub mod metric;
pub mod objective;
pub mod params;
pub mod persist;
pub mod predictor;
pub mod testing;
pub mod utils;

pub use approx;

pub use collective::{Communicator, SharedCommunicator};
pub use context::{Context, DeviceOrd};
pub use data::{DMatrix, MetaInfo};
pub use error::{LearnerError, Result};
pub use learner::{ConfigState, Learner};
pub use logger::Verbosity;
pub use persist::{ConfigDocument, ModelDocument};
pub use predictor::{PredictionCacheEntry, PredictionType, ThreadLocalEntry};
