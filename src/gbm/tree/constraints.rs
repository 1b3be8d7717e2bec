//! Monotone and interaction constraints for tree construction.
//!
//! # Monotone constraints
//!
//! Every feature carries `-1`, `0` or `1`. A split on a constrained feature is
//! rejected when the child weights, clamped to the node's bounds, run against the
//! constraint. Accepted splits hand tighter bounds to their children: the
//! midpoint of the two child weights becomes the upper bound of the lower side
//! and the lower bound of the upper side.
//!
//! # Interaction constraints
//!
//! Groups of features that may appear together on one root-to-leaf path. The
//! root may split on any feature; below it a node may use the features already on
//! its path and the members of every group that contains all of them.

use crate::error::{LearnerError, Result};

// =============================================================================
// Monotone constraints
// =============================================================================

/// Allowed range of a node weight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct WeightBounds {
    pub lower: f64,
    pub upper: f64,
}

impl Default for WeightBounds {
    fn default() -> Self {
        Self { lower: f64::NEG_INFINITY, upper: f64::INFINITY }
    }
}

impl WeightBounds {
    #[inline]
    pub fn clamp(&self, weight: f64) -> f64 {
        weight.max(self.lower).min(self.upper)
    }

    /// Whether clamped child weights respect `constraint`.
    #[inline]
    pub fn admits(constraint: i8, left_weight: f64, right_weight: f64) -> bool {
        match constraint {
            c if c > 0 => left_weight <= right_weight,
            c if c < 0 => left_weight >= right_weight,
            _ => true,
        }
    }

    /// Bounds of the two children of a split under `constraint`.
    pub fn split(&self, constraint: i8, left_weight: f64, right_weight: f64) -> (WeightBounds, WeightBounds) {
        let mid = (left_weight + right_weight) * 0.5;
        let (mut left, mut right) = (*self, *self);
        match constraint {
            c if c > 0 => {
                left.upper = mid.min(self.upper);
                right.lower = mid.max(self.lower);
            }
            c if c < 0 => {
                left.lower = mid.max(self.lower);
                right.upper = mid.min(self.upper);
            }
            _ => {}
        }
        (left, right)
    }
}

/// Parse `(1,0,-1)` or `[1,0,-1]`; an empty list means no constraints.
pub(crate) fn parse_monotone(key: &str, value: &str) -> Result<Vec<i8>> {
    let inner = value.trim().trim_start_matches(['(', '[']).trim_end_matches([')', ']']).trim();
    if inner.is_empty() {
        return Ok(Vec::new());
    }
    inner
        .split(',')
        .map(|item| match item.trim().parse::<i8>() {
            Ok(c @ -1..=1) => Ok(c),
            _ => Err(LearnerError::validation(format!(
                "invalid value `{value}` for parameter `{key}`: entries must be -1, 0 or 1"
            ))),
        })
        .collect()
}

pub(crate) fn format_monotone(constraints: &[i8]) -> String {
    let items: Vec<String> = constraints.iter().map(i8::to_string).collect();
    format!("({})", items.join(","))
}

// =============================================================================
// Interaction constraints
// =============================================================================

/// Parse a JSON list of feature index lists such as `[[0, 1], [2, 3, 4]]`.
pub(crate) fn parse_interactions(key: &str, value: &str) -> Result<Vec<Vec<usize>>> {
    if value.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(value)
        .map_err(|e| LearnerError::validation(format!("invalid value `{value}` for parameter `{key}`: {e}")))
}

pub(crate) fn format_interactions(groups: &[Vec<usize>]) -> String {
    let groups: Vec<String> = groups
        .iter()
        .map(|g| format!("[{}]", g.iter().map(usize::to_string).collect::<Vec<_>>().join(",")))
        .collect();
    format!("[{}]", groups.join(","))
}

/// Features a node may split on given the features used above it.
///
/// `candidates` must be sorted; the result keeps their order.
pub(crate) fn allowed_features(groups: &[Vec<usize>], path: &[usize], candidates: &[usize]) -> Vec<usize> {
    if groups.is_empty() || path.is_empty() {
        return candidates.to_vec();
    }
    let admitting: Vec<&Vec<usize>> = groups.iter().filter(|g| path.iter().all(|f| g.contains(f))).collect();
    candidates
        .iter()
        .copied()
        .filter(|f| path.contains(f) || admitting.iter().any(|g| g.contains(f)))
        .collect()
}

/// Check constraint lengths and indices against the number of features.
pub(crate) fn check_constraints(monotone: &[i8], groups: &[Vec<usize>], num_feature: usize) -> Result<()> {
    if monotone.len() > num_feature {
        return Err(LearnerError::validation(format!(
            "monotone_constraints has {} entries, the data has {num_feature} features",
            monotone.len()
        )));
    }
    if let Some(&bad) = groups.iter().flatten().find(|&&f| f >= num_feature) {
        return Err(LearnerError::validation(format!(
            "interaction_constraints names feature {bad}, the data has {num_feature} features"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotone_syntax() {
        assert_eq!(parse_monotone("m", "(1,0,-1)").unwrap(), vec![1, 0, -1]);
        assert_eq!(parse_monotone("m", "[1, -1]").unwrap(), vec![1, -1]);
        assert!(parse_monotone("m", "()").unwrap().is_empty());
        assert!(parse_monotone("m", "(2)").is_err());
        assert!(parse_monotone("m", "(a,1)").is_err());
        assert_eq!(format_monotone(&[1, 0, -1]), "(1,0,-1)");
        assert_eq!(format_monotone(&[]), "()");
    }

    #[test]
    fn interaction_syntax() {
        assert_eq!(parse_interactions("i", "[[0, 1], [2,3,4]]").unwrap(), vec![vec![0, 1], vec![2, 3, 4]]);
        assert!(parse_interactions("i", "").unwrap().is_empty());
        assert!(parse_interactions("i", "[[0, -1]]").is_err());
        assert_eq!(format_interactions(&[vec![0, 1], vec![2]]), "[[0,1],[2]]");
        assert_eq!(parse_interactions("i", &format_interactions(&[])).unwrap(), Vec::<Vec<usize>>::new());
    }

    #[test]
    fn bounds_tighten_toward_the_midpoint() {
        let root = WeightBounds::default();
        let (left, right) = root.split(1, -1.0, 3.0);
        assert_eq!(left, WeightBounds { lower: f64::NEG_INFINITY, upper: 1.0 });
        assert_eq!(right, WeightBounds { lower: 1.0, upper: f64::INFINITY });
        let (left, right) = root.split(-1, 2.0, 0.0);
        assert_eq!(left.lower, 1.0);
        assert_eq!(right.upper, 1.0);
        assert_eq!(root.split(0, 2.0, 0.0), (root, root));
        assert_eq!(right.clamp(4.0), 1.0);
        assert!(WeightBounds::admits(1, 0.0, 1.0));
        assert!(!WeightBounds::admits(1, 1.0, 0.0));
        assert!(!WeightBounds::admits(-1, 0.0, 1.0));
    }

    #[test]
    fn interaction_sets() {
        let groups = vec![vec![0, 1], vec![1, 2], vec![3, 4]];
        let all = [0, 1, 2, 3, 4, 5];
        assert_eq!(allowed_features(&groups, &[], &all), all.to_vec());
        assert_eq!(allowed_features(&groups, &[0], &all), vec![0, 1]);
        assert_eq!(allowed_features(&groups, &[1], &all), vec![0, 1, 2]);
        assert_eq!(allowed_features(&groups, &[1, 2], &all), vec![1, 2]);
        assert_eq!(allowed_features(&groups, &[5], &all), vec![5]);
        assert_eq!(allowed_features(&[], &[0], &all), all.to_vec());
    }

    #[test]
    fn constraints_must_fit_the_features() {
        assert!(check_constraints(&[1, 0], &[vec![0, 1]], 2).is_ok());
        assert!(check_constraints(&[1, 0, 1], &[], 2).is_err());
        assert!(check_constraints(&[], &[vec![0, 2]], 2).is_err());
    }
}
