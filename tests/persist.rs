//! Model and configuration persistence.

mod common;

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::sync::Arc;

use boosters_learner::persist::{FormatError, GradientBoosterSchema};
use boosters_learner::{Learner, LearnerError, PredictionType};
use common::{make_dmatrix_for_objective, predict, train};
use rstest::rstest;

fn trained(objective: &str, booster: &str) -> (Learner, Arc<boosters_learner::DMatrix>) {
    let data = make_dmatrix_for_objective(objective, 48, 4, 5);
    let mut params = vec![("objective", objective), ("booster", booster)];
    if objective.starts_with("multi:") {
        params.push(("num_class", "3"));
    }
    (train(&params, &data, 3), data)
}

// =============================================================================
// Model document
// =============================================================================

#[rstest]
fn json_file_round_trip_is_byte_exact(
    #[values("reg:squarederror", "binary:logistic", "multi:softprob", "reg:quantileerror")] objective: &str,
    #[values("gbtree", "gblinear")] booster: &str,
) {
    let (learner, data) = trained(objective, booster);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.json");
    {
        let mut writer = BufWriter::new(File::create(&path).unwrap());
        learner.save_model_json(&mut writer).unwrap();
        writer.flush().unwrap();
    }
    let original = std::fs::read(&path).unwrap();

    let mut loaded = Learner::create(&[]);
    loaded.load_model_json(BufReader::new(File::open(&path).unwrap())).unwrap();
    assert_eq!(loaded.save_model_bytes().unwrap(), original);

    let expected = predict(&learner, &data, PredictionType::Value);
    let actual = predict(&loaded, &data, PredictionType::Value);
    assert_eq!(actual, expected);
}

#[test]
fn scalars_are_strings() {
    let (learner, _) = trained("multi:softprob", "gbtree");
    let json: serde_json::Value = serde_json::from_slice(&learner.save_model_bytes().unwrap()).unwrap();
    let param = &json["learner"]["learner_model_param"];
    assert_eq!(param["num_class"], "3");
    assert_eq!(param["num_feature"], "4");
    assert_eq!(param["num_target"], "1");
    assert!(param["base_score"].as_str().unwrap().starts_with('['));
    assert_eq!(json["learner"]["objective"]["name"], "multi:softprob");
    assert_eq!(json["learner"]["gradient_booster"]["name"], "gbtree");
}

#[test]
fn attributes_survive_a_round_trip() {
    let (mut learner, _) = trained("reg:squarederror", "gbtree");
    assert!(learner.attr_names().is_empty());
    learner.set_attr("best_iteration", "2");
    learner.set_attr("best_score", "0.125");
    learner.set_attr("note", "");
    learner.del_attr("note");

    let mut loaded = Learner::create(&[]);
    loaded.load_model(learner.save_model().unwrap()).unwrap();
    assert_eq!(loaded.attr_names(), vec!["best_iteration".to_string(), "best_score".to_string()]);
    assert_eq!(loaded.get_attr("best_score"), Some("0.125"));
    assert_eq!(loaded.get_attr("note"), None);
}

#[test]
fn feature_info_survives_a_round_trip() {
    let (mut learner, _) = trained("reg:squarederror", "gbtree");
    let names: Vec<String> = ["age", "height", "weight", "zone"].map(String::from).to_vec();
    let types: Vec<String> = ["int", "q", "float", "c"].map(String::from).to_vec();
    learner.set_feature_names(names.clone()).unwrap();
    learner.set_feature_types(types.clone()).unwrap();

    let mut loaded = Learner::create(&[]);
    loaded.load_model_bytes(&learner.save_model_bytes().unwrap()).unwrap();
    assert_eq!(loaded.feature_names(), names.as_slice());
    assert_eq!(loaded.feature_types(), types.as_slice());
}

#[test]
fn mismatched_feature_info_is_a_model_error() {
    let (learner, _) = trained("reg:squarederror", "gbtree");
    let mut doc = learner.save_model().unwrap();
    doc.learner.feature_names = vec!["only_one".into()];
    assert!(matches!(Learner::create(&[]).load_model(doc), Err(LearnerError::Model(_))));
}

#[test]
fn loaded_model_keeps_training() {
    let (learner, data) = trained("binary:logistic", "gbtree");
    let mut loaded = Learner::create(&[Arc::clone(&data)]);
    loaded.load_model(learner.save_model().unwrap()).unwrap();
    loaded.update_one_iter(3, &data).unwrap();
    assert_eq!(loaded.boosted_rounds(), 4);
    assert_eq!(loaded.base_score().unwrap(), learner.base_score().unwrap());
}

#[test]
fn malformed_documents_are_rejected() {
    let mut learner = Learner::create(&[]);
    assert!(matches!(learner.load_model_bytes(b"{\"version\": [0, 3, 0]}"), Err(LearnerError::Json(_))));
    assert!(matches!(learner.load_model_bytes(b"not json"), Err(LearnerError::Json(_))));

    let (trained_learner, _) = trained("reg:squarederror", "gbtree");
    let mut doc = trained_learner.save_model().unwrap();
    if let GradientBoosterSchema::GbTree { model } = &mut doc.learner.gradient_booster {
        model.trees[0].left_children.pop();
    }
    assert!(matches!(learner.load_model(doc), Err(LearnerError::Model(_))));
}

// =============================================================================
// Config document
// =============================================================================

#[test]
fn config_document_fields() {
    let data = make_dmatrix_for_objective("reg:squarederror", 16, 2, 0);
    let learner = train(&[("seed", "-9223372036854775808"), ("nthread", "3"), ("eval_metric", "mae")], &data, 1);
    let config = learner.save_config().unwrap();
    let generic = &config.learner.generic_param;
    assert_eq!(generic["seed"], "-9223372036854775808");
    assert_eq!(generic["nthread"], "3");
    assert_eq!(generic["device"], "cpu");
    assert_eq!(generic["validate_parameters"], "0");
    assert_eq!(config.learner.objective.name, "reg:squarederror");
    assert_eq!(config.learner.gradient_booster.name, "gbtree");
    assert_eq!(config.learner.metrics, vec!["mae"]);
}

#[test]
fn config_round_trip_reproduces_training() {
    let data = make_dmatrix_for_objective("binary:logistic", 64, 4, 1);
    let params = [("objective", "binary:logistic"), ("eta", "0.1"), ("max_depth", "2"), ("subsample", "0.8")];
    let reference = train(&params, &data, 2);

    let mut fresh = Learner::create(&[Arc::clone(&data)]);
    fresh.load_config(reference.save_config().unwrap()).unwrap();
    for i in 0..2 {
        fresh.update_one_iter(i, &data).unwrap();
    }
    assert_eq!(fresh.save_model_bytes().unwrap(), reference.save_model_bytes().unwrap());
}

// =============================================================================
// Binary container
// =============================================================================

#[rstest]
#[case("gbtree")]
#[case("gblinear")]
fn container_file_round_trip(#[case] booster: &str) {
    let (mut learner, data) = trained("binary:logistic", booster);
    learner.set_attr("trained_by", "tests");
    let mut file = tempfile::tempfile().unwrap();
    learner.save(&mut file).unwrap();

    use std::io::{Seek, SeekFrom};
    file.seek(SeekFrom::Start(0)).unwrap();
    let mut loaded = Learner::create(&[]);
    loaded.load(&mut file).unwrap();

    assert_eq!(loaded.save_model_bytes().unwrap(), learner.save_model_bytes().unwrap());
    assert_eq!(loaded.save_config().unwrap(), learner.save_config().unwrap());
    assert_eq!(loaded.get_attr("trained_by"), Some("tests"));
    assert_eq!(predict(&loaded, &data, PredictionType::Margin), predict(&learner, &data, PredictionType::Margin));
}

#[test]
fn evaluation_survives_a_round_trip() {
    let data = make_dmatrix_for_objective("binary:logistic", 64, 4, 2);
    let params = [("objective", "binary:logistic"), ("eval_metric", "auc"), ("eval_metric", "logloss")];
    let learner = train(&params, &data, 3);
    let before = learner.eval_one_iter(3, &[(&data, "train")]).unwrap();
    assert!(before.contains("train-auc:") && before.contains("train-logloss:"), "{before}");

    let mut buf = Vec::new();
    learner.save(&mut buf).unwrap();
    let mut loaded = Learner::create(&[Arc::clone(&data)]);
    loaded.load(&mut buf.as_slice()).unwrap();
    assert_eq!(loaded.eval_one_iter(3, &[(&data, "train")]).unwrap(), before);

    let mut from_documents = Learner::create(&[Arc::clone(&data)]);
    from_documents.load_config(learner.save_config().unwrap()).unwrap();
    from_documents.load_model(learner.save_model().unwrap()).unwrap();
    assert_eq!(from_documents.eval_one_iter(3, &[(&data, "train")]).unwrap(), before);
}

#[test]
fn container_rejects_foreign_and_damaged_input() {
    let mut learner = Learner::create(&[]);
    let err = learner.load(&mut &b"{\"learner\": {}}"[..]).unwrap_err();
    assert!(matches!(err, LearnerError::Format(FormatError::NotAModel)), "{err}");

    let (trained_learner, _) = trained("reg:squarederror", "gbtree");
    let mut buf = Vec::new();
    trained_learner.save(&mut buf).unwrap();

    let truncated = &buf[..buf.len() - 10];
    let err = learner.load(&mut &truncated[..]).unwrap_err();
    assert!(matches!(err, LearnerError::Format(FormatError::Truncated { .. })), "{err}");

    let mut damaged = buf.clone();
    damaged[40] ^= 0x55;
    let err = learner.load(&mut damaged.as_slice()).unwrap_err();
    assert!(matches!(err, LearnerError::Format(FormatError::ChecksumMismatch { .. })), "{err}");
}
