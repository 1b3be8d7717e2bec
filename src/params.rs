//! Parameter store and typed parameter groups.
//!
//! Parameters arrive as ordered string pairs. The store keeps the last value for
//! each key, except `eval_metric`, which accumulates into a deduplicated list.
//! Typed groups ([`ParamSet`]) pick the keys they understand at configure time and
//! report which keys they consumed so the learner can flag the rest.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Display;
use std::str::FromStr;

use crate::error::{LearnerError, Result};

/// Ordered key/value arguments.
pub type Args = Vec<(String, String)>;

/// Key used for evaluation metrics.
pub const EVAL_METRIC: &str = "eval_metric";

/// Map an alias to its canonical parameter name.
pub fn canonical_key(key: &str) -> &str {
    match key {
        "learning_rate" => "eta",
        "reg_lambda" => "lambda",
        "reg_alpha" => "alpha",
        "min_split_loss" => "gamma",
        "n_jobs" => "nthread",
        "random_state" => "seed",
        other => other,
    }
}

// =============================================================================
// Parameter Store
// =============================================================================

/// Ordered parameter store owned by the learner.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamStore {
    args: Args,
    metrics: Vec<String>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a parameter. Never fails; validation happens at configure time.
    pub fn set(&mut self, key: &str, value: &str) {
        if key == EVAL_METRIC {
            if !self.metrics.iter().any(|m| m == value) {
                self.metrics.push(value.to_string());
            }
            return;
        }
        match self.args.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value.to_string(),
            None => self.args.push((key.to_string(), value.to_string())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.args.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Whether `key` (or one of its aliases) was set.
    pub fn contains(&self, key: &str) -> bool {
        self.args.iter().any(|(k, _)| canonical_key(k) == key)
    }

    pub fn args(&self) -> &[(String, String)] {
        &self.args
    }

    /// Evaluation metric names in insertion order.
    pub fn metrics(&self) -> &[String] {
        &self.metrics
    }

    /// Configuration arguments; `eval_metric` is never part of them.
    pub fn configuration_arguments(&self) -> BTreeMap<String, String> {
        self.args.iter().cloned().collect()
    }

    /// Reject keys containing whitespace.
    pub fn validate_keys(&self) -> Result<()> {
        for (key, _) in &self.args {
            if key.chars().any(char::is_whitespace) {
                return Err(LearnerError::validation(format!(
                    "\"{key}\" contains whitespace, which is not allowed in parameter names"
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Typed Parameter Groups
// =============================================================================

/// A group of typed parameters parsed from string arguments.
pub trait ParamSet {
    /// Apply a single canonical key. Returns `false` if the key does not belong to
    /// this group.
    fn apply(&mut self, key: &str, value: &str) -> Result<bool>;

    /// Current values as strings, used by the configuration document.
    fn to_args(&self) -> BTreeMap<String, String>;

    /// Apply every recognised key of `args`, recording consumed keys.
    fn update(&mut self, args: &[(String, String)], consumed: &mut HashSet<String>) -> Result<()> {
        for (key, value) in args {
            if self.apply(canonical_key(key), value)? {
                consumed.insert(key.clone());
            }
        }
        Ok(())
    }

    /// Apply a string map, typically a loaded configuration block.
    fn load_args(&mut self, args: &BTreeMap<String, String>) -> Result<()> {
        for (key, value) in args {
            self.apply(canonical_key(key), value)?;
        }
        Ok(())
    }
}

/// Parse a value, naming the parameter on failure.
pub fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value.trim().parse::<T>().map_err(|e| {
        LearnerError::validation(format!("invalid value `{value}` for parameter `{key}`: {e}"))
    })
}

/// Parse a boolean flag accepting `0/1` and `true/false`.
pub fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "1" | "true" | "True" => Ok(true),
        "0" | "false" | "False" => Ok(false),
        other => Err(LearnerError::validation(format!(
            "invalid value `{other}` for parameter `{key}`, expected a boolean"
        ))),
    }
}

/// Parse a float that must lie in `[lo, hi]`.
pub fn parse_in_range(key: &str, value: &str, lo: f32, hi: f32) -> Result<f32> {
    let v: f32 = parse_value(key, value)?;
    if !(lo..=hi).contains(&v) {
        return Err(LearnerError::validation(format!(
            "parameter `{key}` must be in [{lo}, {hi}], got {v}"
        )));
    }
    Ok(v)
}

/// Parse a strictly positive float.
pub fn parse_positive(key: &str, value: &str) -> Result<f32> {
    let v: f32 = parse_value(key, value)?;
    if !(v > 0.0) {
        return Err(LearnerError::validation(format!("parameter `{key}` must be positive, got {v}")));
    }
    Ok(v)
}

/// Format a bool the way parameter blocks store it.
pub fn bool_str(v: bool) -> String {
    String::from(if v { "1" } else { "0" })
}
