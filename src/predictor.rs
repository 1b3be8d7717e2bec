//! Prediction caches.
//!
//! The learner keeps one [`PredictionCacheEntry`] per attached training matrix so
//! that each iteration only predicts the newest layer. Matrices are held weakly;
//! entries of dropped matrices are pruned on the next access.
//!
//! Callers that predict from many threads get a private entry per thread and
//! learner through [`with_thread_local`]; nothing in it is shared. An entry
//! lives until its thread exits or its owner is dropped. Dropping the owner
//! frees the dropping thread's entry at once; entries on other threads are freed
//! the next time those threads use any thread-local entry.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};

use ndarray::Array2;

use crate::data::DMatrix;
use crate::error::{LearnerError, Result};

/// What [`Learner::predict`](crate::Learner::predict) computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PredictionType {
    /// Transformed predictions, e.g. probabilities, `(rows, groups)`.
    #[default]
    Value,
    /// Untransformed margins, `(rows, groups)`.
    Margin,
    /// Leaf index per tree, `(rows, trees)`.
    Leaf,
    /// Per-feature contributions, `(rows, groups * (features + 1))`.
    Contribution,
}

impl FromStr for PredictionType {
    type Err = LearnerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "value" => Ok(Self::Value),
            "margin" => Ok(Self::Margin),
            "leaf" => Ok(Self::Leaf),
            "contribution" => Ok(Self::Contribution),
            other => Err(LearnerError::validation(format!("unknown prediction type `{other}`"))),
        }
    }
}

impl fmt::Display for PredictionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Value => "value",
            Self::Margin => "margin",
            Self::Leaf => "leaf",
            Self::Contribution => "contribution",
        })
    }
}

// =============================================================================
// Cache entries
// =============================================================================

/// Predictions together with the number of layers they include.
#[derive(Debug, Clone)]
pub struct PredictionCacheEntry {
    pub predictions: Array2<f32>,
    pub version: usize,
}

impl Default for PredictionCacheEntry {
    fn default() -> Self {
        Self { predictions: Array2::zeros((0, 0)), version: 0 }
    }
}

impl PredictionCacheEntry {
    pub fn reset(&mut self) {
        self.predictions = Array2::zeros((0, 0));
        self.version = 0;
    }
}

/// Training-time cache keyed by matrix identity.
#[derive(Debug, Default)]
pub struct PredictionCache {
    entries: HashMap<u64, (Weak<DMatrix>, PredictionCacheEntry)>,
    /// Matrix ids in attachment order.
    order: Vec<u64>,
}

impl PredictionCache {
    /// Attach a matrix; attaching twice keeps the existing entry.
    pub fn cache(&mut self, data: &Arc<DMatrix>) {
        self.prune();
        let id = data.id();
        if !self.entries.contains_key(&id) {
            self.entries.insert(id, (Arc::downgrade(data), PredictionCacheEntry::default()));
            self.order.push(id);
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn entry_mut(&mut self, id: u64) -> Option<&mut PredictionCacheEntry> {
        self.entries.get_mut(&id).map(|(_, e)| e)
    }

    /// Live matrices in attachment order.
    pub fn matrices(&self) -> Vec<Arc<DMatrix>> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).and_then(|(w, _)| w.upgrade()))
            .collect()
    }

    /// Reset every entry, e.g. after the model was replaced.
    pub fn invalidate(&mut self) {
        for (_, entry) in self.entries.values_mut() {
            entry.reset();
        }
    }

    fn prune(&mut self) {
        self.entries.retain(|_, (weak, _)| weak.strong_count() > 0);
        let entries = &self.entries;
        self.order.retain(|id| entries.contains_key(id));
    }
}

// =============================================================================
// Thread-local entries
// =============================================================================

/// Per-thread scratch owned by the calling thread.
#[derive(Debug, Default)]
pub struct ThreadLocalEntry {
    pub prediction_entry: PredictionCacheEntry,
    /// Scratch for string results such as evaluation lines.
    pub ret_str: String,
}

thread_local! {
    static LOCAL_ENTRIES: RefCell<HashMap<u64, (Weak<()>, ThreadLocalEntry)>> = RefCell::new(HashMap::new());
}

/// Run `f` with this thread's entry for `owner`, creating it on first use.
///
/// `alive` is the owner's liveness token: once every strong reference to it is
/// gone, the owner's entries are dropped on their threads' next call. The entry
/// is taken out of the map while `f` runs, so `f` may itself use thread-local
/// entries of other owners.
pub fn with_thread_local<R>(owner: u64, alive: &Arc<()>, f: impl FnOnce(&mut ThreadLocalEntry) -> R) -> R {
    let mut entry = LOCAL_ENTRIES
        .with(|m| {
            let mut map = m.borrow_mut();
            map.retain(|_, (token, _)| token.strong_count() > 0);
            map.remove(&owner)
        })
        .map(|(_, entry)| entry)
        .unwrap_or_default();
    let out = f(&mut entry);
    LOCAL_ENTRIES.with(|m| m.borrow_mut().insert(owner, (Arc::downgrade(alive), entry)));
    out
}

/// Drop this thread's entry for `owner`.
pub(crate) fn release_thread_local(owner: u64) {
    // Ignore destruction order problems at thread exit.
    let _ = LOCAL_ENTRIES.try_with(|m| {
        if let Ok(mut map) = m.try_borrow_mut() {
            map.remove(&owner);
        }
    });
}

/// Entries held by the current thread.
#[cfg(test)]
pub(crate) fn local_entry_count() -> usize {
    LOCAL_ENTRIES.with(|m| m.borrow().len())
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn cache_prunes_dropped_matrices() {
        let a = Arc::new(DMatrix::new(array![[1.0]]));
        let b = Arc::new(DMatrix::new(array![[2.0]]));
        let mut cache = PredictionCache::default();
        cache.cache(&a);
        cache.cache(&b);
        cache.cache(&a);
        assert_eq!(cache.matrices().len(), 2);
        assert_eq!(cache.matrices()[0].id(), a.id());

        drop(a);
        let c = Arc::new(DMatrix::new(array![[3.0]]));
        cache.cache(&c);
        let ids: Vec<u64> = cache.matrices().iter().map(|m| m.id()).collect();
        assert_eq!(ids, vec![b.id(), c.id()]);
    }

    #[test]
    fn thread_local_entries_are_per_owner_and_thread() {
        let (one, two) = (Arc::new(()), Arc::new(()));
        with_thread_local(1, &one, |e| e.prediction_entry.version = 3);
        with_thread_local(2, &two, |e| assert_eq!(e.prediction_entry.version, 0));
        assert_eq!(with_thread_local(1, &one, |e| e.prediction_entry.version), 3);
        let shared = Arc::clone(&one);
        std::thread::spawn(move || assert_eq!(with_thread_local(1, &shared, |e| e.prediction_entry.version), 0))
            .join()
            .unwrap();
        release_thread_local(1);
        assert_eq!(with_thread_local(1, &one, |e| e.prediction_entry.version), 0);
    }

    #[test]
    fn entries_of_dropped_owners_are_freed_on_other_threads() {
        use std::sync::mpsc;

        let owner = Arc::new(());
        let token = Arc::clone(&owner);
        let (used_tx, used_rx) = mpsc::channel();
        let (dropped_tx, dropped_rx) = mpsc::channel::<()>();
        let worker = std::thread::spawn(move || {
            with_thread_local(10, &token, |e| e.ret_str.push_str("held"));
            drop(token);
            assert_eq!(local_entry_count(), 1);
            used_tx.send(()).unwrap();
            dropped_rx.recv().unwrap();

            let other = Arc::new(());
            with_thread_local(11, &other, |e| assert!(e.ret_str.is_empty()));
            local_entry_count()
        });

        used_rx.recv().unwrap();
        // The owner goes away on this thread; the worker still holds its entry.
        release_thread_local(10);
        drop(owner);
        dropped_tx.send(()).unwrap();
        assert_eq!(worker.join().unwrap(), 1);
    }

    #[test]
    fn prediction_type_names() {
        for kind in ["value", "margin", "leaf", "contribution"] {
            assert_eq!(kind.parse::<PredictionType>().unwrap().to_string(), kind);
        }
    }
}
