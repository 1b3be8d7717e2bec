//! Shared helpers for integration tests.
//!
//! Data generators live in `boosters_learner::testing`; this module only wraps
//! the learner calls most tests repeat.

#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use boosters_learner::{DMatrix, Learner, PredictionCacheEntry, PredictionType};
use ndarray::Array2;
use tracing::Level;

#[allow(unused_imports)]
pub use boosters_learner::testing::{
    RandomDataGenerator, TEST_NUM_CLASS, assert_slice_approx_eq, make_dmatrix_for_objective,
};

/// Learner with `params`, trained for `rounds` iterations on `data`.
pub fn train(params: &[(&str, &str)], data: &Arc<DMatrix>, rounds: usize) -> Learner {
    let mut learner = Learner::create(&[Arc::clone(data)]);
    learner.set_params(params.iter().copied());
    for i in 0..rounds {
        learner
            .update_one_iter(i, data)
            .unwrap_or_else(|e| panic!("iteration {i} failed: {e}"));
    }
    learner
}

/// Predictions over every layer.
pub fn predict(learner: &Learner, data: &DMatrix, kind: PredictionType) -> Array2<f32> {
    let mut out = PredictionCacheEntry::default();
    learner
        .predict(data, false, &mut out, 0, 0, kind)
        .unwrap_or_else(|e| panic!("{kind} prediction failed: {e}"));
    out.predictions
}

/// Value of the last metric in an evaluation line.
pub fn last_metric(line: &str) -> f64 {
    line.rsplit(':')
        .next()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| panic!("malformed evaluation line `{line}`"))
}

/// Writer appending formatted events to a shared buffer.
#[derive(Clone, Default)]
struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` with a subscriber on the current thread and return what it logged.
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let writer = CaptureWriter::default();
    let buffer = Arc::clone(&writer.0);
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(Level::DEBUG)
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    let logged = String::from_utf8_lossy(&buffer.lock().unwrap_or_else(PoisonError::into_inner)).into_owned();
    (result, logged)
}
