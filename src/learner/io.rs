//! Model and configuration IO for [`Learner`].

use std::collections::BTreeMap;
use std::io::{Read, Write};

use super::Learner;
use super::config::{LearnerModelParam, LearnerState, check_feature_info};
use crate::data::validate_feature_types;
use crate::error::{LearnerError, Result};
use crate::gbm::{self, GradientBooster};
use crate::objective::{self, ObjectiveFn};
use crate::params::{EVAL_METRIC, ParamSet, bool_str, parse_bool, parse_value};
use crate::persist::{
    BoosterConfigSchema, BoosterType, ConfigDocument, FormatHeader, LearnerConfigSchema, LearnerModelParamSchema,
    LearnerModelSchema, LearnerSnapshot, ModelDocument, ObjectiveSchema, current_version, format_base_score,
    parse_base_score, read_container, write_container,
};

impl Learner {
    // =========================================================================
    // Model document
    // =========================================================================

    /// Structural model document.
    pub fn save_model(&self) -> Result<ModelDocument> {
        let state = self.configured()?;
        Ok(ModelDocument {
            version: current_version(),
            learner: LearnerModelSchema {
                learner_model_param: model_param_schema(&state.model),
                objective: ObjectiveSchema {
                    name: state.objective.name().to_string(),
                    params: state.objective.to_args(),
                },
                gradient_booster: state.booster.save_model(),
                attributes: self.attributes.clone(),
                feature_names: self.feature_names.clone(),
                feature_types: self.feature_types.clone(),
            },
        })
    }

    /// Replace the model with `doc`. Parameters set on the learner are kept.
    pub fn load_model(&mut self, doc: ModelDocument) -> Result<()> {
        let current = current_version();
        if doc.version[0] > current[0] {
            return Err(LearnerError::model(format!(
                "model version {:?} is newer than this library ({current:?})",
                doc.version
            )));
        }
        let learner = doc.learner;
        let p = &learner.learner_model_param;
        let model = LearnerModelParam {
            num_feature: model_field(parse_value("num_feature", &p.num_feature))?,
            num_class: model_field(parse_value("num_class", &p.num_class))?,
            num_target: model_field(parse_value("num_target", &p.num_target))?,
            base_score: model_field(parse_base_score(&p.base_score))?,
            boost_from_average: model_field(parse_bool("boost_from_average", &p.boost_from_average))?,
        };

        let mut objective = model_field(objective::create(&learner.objective.name))?;
        model_field(objective.load_args(&learner.objective.params))?;
        let n_groups = objective.num_groups(model.num_target).max(1);
        if model.base_score.len() != n_groups {
            return Err(LearnerError::model(format!(
                "base_score has {} values for {n_groups} output groups",
                model.base_score.len()
            )));
        }

        let mut booster = model_field(gbm::create(learner.gradient_booster.name()))?;
        model_field(booster.load_model(learner.gradient_booster, model.num_feature, n_groups))?;

        model_field(validate_feature_types(&learner.feature_types))?;
        model_field(check_feature_info(&learner.feature_names, &learner.feature_types, model.num_feature))?;

        let state: &mut LearnerState = self.state_mut();
        state.train.objective = objective.name().to_string();
        state.train.booster = booster.name().to_string();
        state.objective = objective;
        state.booster = booster;
        state.model = model;
        state.user_base_score = false;
        state.epoch += 1;
        state.invalidate();

        self.attributes = learner.attributes;
        self.feature_names = learner.feature_names;
        self.feature_types = learner.feature_types;
        Ok(())
    }

    pub fn save_model_json<W: Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer(writer, &self.save_model()?)?;
        Ok(())
    }

    pub fn load_model_json<R: Read>(&mut self, reader: R) -> Result<()> {
        let doc: ModelDocument = serde_json::from_reader(reader)?;
        self.load_model(doc)
    }

    /// Model document as JSON bytes.
    pub fn save_model_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.save_model()?)?)
    }

    pub fn load_model_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let doc: ModelDocument = serde_json::from_slice(bytes)?;
        self.load_model(doc)
    }

    // =========================================================================
    // Config document
    // =========================================================================

    /// Runtime configuration document.
    pub fn save_config(&self) -> Result<ConfigDocument> {
        let state = self.configured()?;
        Ok(ConfigDocument {
            version: current_version(),
            learner: LearnerConfigSchema {
                generic_param: state.ctx.to_args(),
                learner_train_param: state.train.to_args(),
                learner_model_param: model_param_schema(&state.model),
                objective: ObjectiveSchema {
                    name: state.objective.name().to_string(),
                    params: state.objective.to_args(),
                },
                gradient_booster: BoosterConfigSchema {
                    name: state.booster.name().to_string(),
                    params: state.booster.to_args(),
                },
                metrics: self.params.metrics().to_vec(),
            },
        })
    }

    /// Restore parameters from `doc`. The model parameter block is informational.
    pub fn load_config(&mut self, doc: ConfigDocument) -> Result<()> {
        let learner = doc.learner;
        let blocks: [&BTreeMap<String, String>; 4] = [
            &learner.generic_param,
            &learner.learner_train_param,
            &learner.objective.params,
            &learner.gradient_booster.params,
        ];
        for block in blocks {
            for (key, value) in block {
                self.params.set(key, value);
            }
        }
        self.params.set("objective", &learner.objective.name);
        self.params.set("booster", &learner.gradient_booster.name);
        for metric in &learner.metrics {
            self.params.set(EVAL_METRIC, metric);
        }
        self.state_mut().invalidate();
        Ok(())
    }

    // =========================================================================
    // Binary container
    // =========================================================================

    /// Write model and configuration into a checksummed container.
    pub fn save<W: Write>(&self, writer: &mut W) -> Result<()> {
        let snapshot = LearnerSnapshot { model: self.save_model()?, config: self.save_config()? };
        let booster_name = snapshot.model.learner.gradient_booster.name();
        let booster = BoosterType::from_name(booster_name)
            .ok_or_else(|| LearnerError::model(format!("booster `{booster_name}` has no container tag")))?;
        let (num_feature, num_groups) = {
            let state = self.configured()?;
            (state.model.num_feature, state.num_groups())
        };
        let payload = serde_json::to_vec(&snapshot)?;
        let mut header = FormatHeader::new(booster, num_feature as u32, num_groups as u32);
        write_container(writer, &mut header, &payload)?;
        Ok(())
    }

    /// Read a container written by [`Learner::save`].
    pub fn load<R: Read>(&mut self, reader: &mut R) -> Result<()> {
        let (header, payload) = read_container(reader)?;
        let snapshot: LearnerSnapshot = serde_json::from_slice(&payload)?;
        let name = snapshot.model.learner.gradient_booster.name();
        if BoosterType::from_name(name) != Some(header.booster) {
            return Err(LearnerError::model(format!(
                "container header says {:?}, payload holds `{name}`",
                header.booster
            )));
        }
        self.load_model(snapshot.model)?;
        self.load_config(snapshot.config)
    }
}

fn model_param_schema(model: &LearnerModelParam) -> LearnerModelParamSchema {
    LearnerModelParamSchema {
        base_score: format_base_score(&model.base_score),
        boost_from_average: bool_str(model.boost_from_average),
        num_class: model.num_class.to_string(),
        num_feature: model.num_feature.to_string(),
        num_target: model.num_target.to_string(),
    }
}

/// Report any failure while reading a model document as a model error.
fn model_field<T>(result: Result<T>) -> Result<T> {
    result.map_err(|err| match err {
        LearnerError::Model(_) => err,
        other => LearnerError::model(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ndarray::array;

    use super::*;
    use crate::data::DMatrix;
    use crate::persist::GradientBoosterSchema;

    fn trained(booster: &str) -> Learner {
        let train = DMatrix::new(array![[0.0, 1.0], [1.0, 0.0], [2.0, 1.0], [3.0, 0.0]]);
        train.set_label_vec(vec![0.0, 1.0, 0.0, 1.0]).unwrap();
        let train = Arc::new(train);
        let mut learner = Learner::create(&[Arc::clone(&train)]);
        learner.set_params([("objective", "binary:logistic"), ("booster", booster)]);
        for i in 0..2 {
            learner.update_one_iter(i, &train).unwrap();
        }
        learner
    }

    #[test]
    fn model_bytes_round_trip_exactly() {
        for booster in ["gbtree", "gblinear"] {
            let learner = trained(booster);
            let bytes = learner.save_model_bytes().unwrap();
            let mut loaded = Learner::create(&[]);
            loaded.load_model_bytes(&bytes).unwrap();
            assert_eq!(loaded.save_model_bytes().unwrap(), bytes, "{booster}");
            assert_eq!(loaded.boosted_rounds(), 2);
        }
    }

    #[test]
    fn newer_major_version_is_rejected() {
        let mut doc = trained("gbtree").save_model().unwrap();
        doc.version[0] += 1;
        let err = Learner::create(&[]).load_model(doc).unwrap_err();
        assert!(matches!(err, LearnerError::Model(_)));
    }

    #[test]
    fn base_score_length_must_match_groups() {
        let mut doc = trained("gbtree").save_model().unwrap();
        doc.learner.learner_model_param.base_score = "[0.5,0.5]".into();
        assert!(matches!(Learner::create(&[]).load_model(doc), Err(LearnerError::Model(_))));
    }

    #[test]
    fn unknown_objective_is_a_model_error() {
        let mut doc = trained("gbtree").save_model().unwrap();
        doc.learner.objective.name = "reg:unknown".into();
        assert!(matches!(Learner::create(&[]).load_model(doc), Err(LearnerError::Model(_))));
    }

    #[test]
    fn config_restores_parameters() {
        let mut learner = trained("gbtree");
        learner.set_params([("eta", "0.1"), ("eval_metric", "auc")]);
        let config = learner.save_config().unwrap();
        assert_eq!(config.learner.gradient_booster.params.get("eta").map(String::as_str), Some("0.1"));
        assert_eq!(config.learner.metrics, vec!["auc".to_string()]);

        let mut fresh = Learner::create(&[]);
        fresh.load_config(config.clone()).unwrap();
        let args = fresh.get_configuration_arguments();
        assert_eq!(args.get("objective").map(String::as_str), Some("binary:logistic"));
        let reloaded = fresh.save_config().unwrap();
        assert_eq!(reloaded.learner.gradient_booster, config.learner.gradient_booster);
        assert_eq!(reloaded.learner.metrics, config.learner.metrics);
    }

    #[test]
    fn container_round_trip() {
        let learner = trained("gblinear");
        let mut buf = Vec::new();
        learner.save(&mut buf).unwrap();

        let mut loaded = Learner::create(&[]);
        loaded.load(&mut buf.as_slice()).unwrap();
        assert_eq!(loaded.save_model().unwrap(), learner.save_model().unwrap());
        assert!(matches!(
            loaded.save_model().unwrap().learner.gradient_booster,
            GradientBoosterSchema::GbLinear { .. }
        ));
    }

    #[test]
    fn corrupted_container_is_rejected() {
        let mut buf = Vec::new();
        trained("gbtree").save(&mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        let err = Learner::create(&[]).load(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, LearnerError::Format(_)));
    }
}
