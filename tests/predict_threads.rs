//! Concurrent prediction from one learner.

mod common;

use std::sync::Arc;
use std::thread;

use boosters_learner::{Learner, PredictionCacheEntry, PredictionType};
use common::{make_dmatrix_for_objective, predict, train};
use rstest::rstest;

const THREADS: usize = 8;

#[rstest]
#[case(PredictionType::Value)]
#[case(PredictionType::Margin)]
#[case(PredictionType::Leaf)]
#[case(PredictionType::Contribution)]
fn threads_match_the_single_threaded_baseline(#[case] kind: PredictionType) {
    let data = make_dmatrix_for_objective("multi:softprob", 200, 6, 12);
    let learner = train(&[("objective", "multi:softprob"), ("num_class", "3"), ("max_depth", "4")], &data, 4);
    let baseline = predict(&learner, &data, kind);

    thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    (0..5)
                        .map(|_| {
                            let mut out = PredictionCacheEntry::default();
                            learner.predict(&data, false, &mut out, 0, 0, kind).unwrap();
                            out.predictions
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        for handle in handles {
            for predictions in handle.join().unwrap() {
                assert_eq!(predictions, baseline);
            }
        }
    });
}

#[test]
fn first_use_from_many_threads_configures_once() {
    let data = make_dmatrix_for_objective("reg:squarederror", 100, 4, 1);
    let trained = train(&[], &data, 3);
    let bytes = trained.save_model_bytes().unwrap();
    let baseline = predict(&trained, &data, PredictionType::Value);

    let mut learner = Learner::create(&[]);
    learner.load_model_bytes(&bytes).unwrap();
    let learner = Arc::new(learner);
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let learner = Arc::clone(&learner);
            let data = Arc::clone(&data);
            thread::spawn(move || predict(&learner, &data, PredictionType::Value))
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), baseline);
    }
}

#[test]
fn thread_local_entries_are_private() {
    let data = make_dmatrix_for_objective("reg:squarederror", 50, 3, 2);
    let learner = train(&[], &data, 2);
    let baseline = predict(&learner, &data, PredictionType::Margin);

    thread::scope(|s| {
        for t in 0..THREADS {
            let learner = &learner;
            let data = &data;
            let baseline = &baseline;
            s.spawn(move || {
                learner.with_thread_local(|entry| {
                    assert_eq!(entry.prediction_entry.version, 0);
                    entry.ret_str = format!("thread {t}");
                    learner
                        .predict(data, false, &mut entry.prediction_entry, 0, 0, PredictionType::Margin)
                        .unwrap();
                });
                learner.with_thread_local(|entry| {
                    assert_eq!(entry.ret_str, format!("thread {t}"));
                    assert_eq!(entry.prediction_entry.version, 2);
                    assert_eq!(&entry.prediction_entry.predictions, baseline);
                });
            });
        }
    });
}

#[test]
fn thread_local_entries_are_per_learner() {
    let data = make_dmatrix_for_objective("reg:squarederror", 20, 2, 3);
    let a = train(&[], &data, 1);
    let b = train(&[], &data, 2);
    a.with_thread_local(|entry| entry.ret_str.push_str("a"));
    b.with_thread_local(|entry| assert!(entry.ret_str.is_empty()));
    a.with_thread_local(|entry| assert_eq!(entry.ret_str, "a"));
}
