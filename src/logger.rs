//! Verbosity-gated training logger.
//!
//! Messages are emitted as `tracing` events; the verbosity level decides which of
//! them are produced at all, independent of any subscriber filter.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{LearnerError, Result};

/// Verbosity level for learner output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    /// No output.
    Silent = 0,
    /// Warnings only (unknown parameters, device fallbacks).
    #[default]
    Warning = 1,
    /// Per-iteration progress.
    Info = 2,
    /// Timings and internal decisions.
    Debug = 3,
}

impl Verbosity {
    pub fn level(self) -> u8 {
        self as u8
    }
}

impl FromStr for Verbosity {
    type Err = LearnerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "0" => Ok(Self::Silent),
            "1" => Ok(Self::Warning),
            "2" => Ok(Self::Info),
            "3" => Ok(Self::Debug),
            other => Err(LearnerError::validation(format!(
                "invalid value `{other}` for parameter `verbosity`, expected 0..=3"
            ))),
        }
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level())
    }
}

/// Logger carried by the learner context.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrainingLogger {
    verbosity: Verbosity,
}

impl TrainingLogger {
    pub fn new(verbosity: Verbosity) -> Self {
        Self { verbosity }
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    pub fn warn(&self, msg: impl fmt::Display) {
        if self.verbosity >= Verbosity::Warning {
            tracing::warn!("{msg}");
        }
    }

    pub fn info(&self, msg: impl fmt::Display) {
        if self.verbosity >= Verbosity::Info {
            tracing::info!("{msg}");
        }
    }

    pub fn debug(&self, msg: impl fmt::Display) {
        if self.verbosity >= Verbosity::Debug {
            tracing::debug!("{msg}");
        }
    }

    /// Log a finished boosting iteration.
    pub fn log_iteration(&self, iteration: usize, elapsed: Duration) {
        self.debug(format_args!("[{iteration}] boosted in {:.3}ms", elapsed.as_secs_f64() * 1e3));
    }

    /// Log an evaluation line as produced by `Learner::eval_one_iter`.
    pub fn log_evaluation(&self, line: &str) {
        self.info(line);
    }
}
