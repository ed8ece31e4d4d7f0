use crate::error::{CtrError, Result};
use crate::estimator::RunConfig;
use crate::model::deepfm::DeepFmParams;
use crate::model::layers::{ActivationFunction, InitMethod};
use crate::model::optimizer::OptimizerKind;
use crate::parsing::schema::{Column, FeatureSchema};
use crate::parsing::InputFormat;
use clap::ValueEnum;
use std::path::PathBuf;

pub const SUPPORTED_DATASETS: [&str; 3] = ["census", "frappe", "amazon"];

/// Training hyperparameters, overridable from a JSON file
#[derive(Clone, Debug, PartialEq)]
pub struct ModelParams {
    pub batch_size: usize,
    pub num_epochs: usize,
    pub buffer_size: usize,
    pub learning_rate: f64,
    pub optimizer: OptimizerKind,
    pub embedding_dim: usize,
    pub hidden_units: Vec<usize>,
    pub activation: ActivationFunction,
    pub init_method: InitMethod,
    pub seed: u64,
}

impl Default for ModelParams {
    fn default() -> Self {
        ModelParams {
            batch_size: 512,
            num_epochs: 10,
            buffer_size: 512,
            learning_rate: 0.0004,
            optimizer: OptimizerKind::Adam,
            embedding_dim: 32,
            hidden_units: vec![50, 40],
            activation: ActivationFunction::ReLU,
            init_method: InitMethod::Xavier,
            seed: 42,
        }
    }
}

pub struct Config {
    pub model_name: String,
    pub data_name: String,
    pub checkpoint_dir: PathBuf,
    /// Path of the input files, with `{}` standing for `train` or `valid`
    pub data_dir: String,
    pub input_parser: InputFormat,
    pub schema: FeatureSchema,
    pub num_fields: usize,
    pub params: ModelParams,
    pub run_config: RunConfig,
    /// Batches per evaluation
    pub eval_steps: usize,
    pub throttle_secs: u64,
    pub max_steps_without_decrease: u64,
}

/// The UCI adult census income dataset
fn census_schema() -> FeatureSchema {
    FeatureSchema::delimited(vec![
        Column::numeric("age", 100.0),
        Column::categorical("workclass", 100),
        Column::ignore("fnlwgt"),
        Column::categorical("education", 100),
        Column::numeric("education_num", 16.0),
        Column::categorical("marital_status", 100),
        Column::categorical("occupation", 100),
        Column::categorical("relationship", 100),
        Column::categorical("race", 100),
        Column::categorical("gender", 100),
        Column::numeric("capital_gain", 100000.0),
        Column::numeric("capital_loss", 5000.0),
        Column::numeric("hours_per_week", 100.0),
        Column::categorical("native_country", 100),
        Column::target("income_bracket", ">50K"),
    ])
}

impl Config {
    pub fn new(model_name: &str, data_name: &str) -> Result<Config> {
        let (input_parser, schema, num_fields) = match data_name {
            "census" => {
                let schema = census_schema();
                let num_fields = schema.num_fields();
                (InputFormat::Csv, schema, num_fields)
            }
            "frappe" => (InputFormat::Libsvm, FeatureSchema::sparse(5500), 10),
            "amazon" => (InputFormat::TfRecord, FeatureSchema::sparse(70000), 8),
            other => {
                return Err(CtrError::Unsupported {
                    name: other.to_string(),
                    supported: SUPPORTED_DATASETS.join(","),
                })
            }
        };

        Ok(Config {
            model_name: model_name.to_string(),
            data_name: data_name.to_string(),
            checkpoint_dir: PathBuf::from(format!("./checkpoint/{}_{}", data_name, model_name)),
            data_dir: format!("./data/{}/{{}}.{}", data_name, input_parser.extension()),
            input_parser,
            schema,
            num_fields,
            params: ModelParams::default(),
            run_config: RunConfig::default(),
            eval_steps: 200,
            throttle_secs: 60,
            max_steps_without_decrease: 20 * 100,
        })
    }

    /// Input file for a step, e.g. `train` or `valid`
    pub fn data_path(&self, step: &str) -> PathBuf {
        PathBuf::from(self.data_dir.replace("{}", step))
    }

    pub fn model_params(&self) -> DeepFmParams {
        DeepFmParams {
            embedding_dim: self.params.embedding_dim,
            hidden_units: self.params.hidden_units.clone(),
            activation: self.params.activation,
            init_method: self.params.init_method,
            ..DeepFmParams::new(self.schema.feature_size, self.num_fields)
        }
    }

    /// Apply overrides from a JSON object such as
    /// `{"batch_size": 256, "hidden_units": [64, 32], "optimizer": "adagrad"}`
    pub fn apply_json(&mut self, text: &str) -> Result<()> {
        let data = json::parse(text)?;

        if !data.is_object() {
            return Err(CtrError::Config("params must be a JSON object".to_string()));
        }

        for (key, value) in data.entries() {
            let bad = || CtrError::Config(format!("invalid value for '{}': {}", key, value.dump()));
            let p = &mut self.params;

            match key {
                "batch_size" => p.batch_size = value.as_usize().ok_or_else(bad)?,
                "num_epochs" => p.num_epochs = value.as_usize().ok_or_else(bad)?,
                "buffer_size" => p.buffer_size = value.as_usize().ok_or_else(bad)?,
                "learning_rate" => p.learning_rate = value.as_f64().ok_or_else(bad)?,
                "embedding_dim" => p.embedding_dim = value.as_usize().ok_or_else(bad)?,
                "seed" => p.seed = value.as_u64().ok_or_else(bad)?,
                "hidden_units" => {
                    p.hidden_units = value
                        .members()
                        .map(|x| x.as_usize())
                        .collect::<Option<Vec<_>>>()
                        .filter(|_| value.is_array())
                        .ok_or_else(bad)?
                }
                "optimizer" => {
                    p.optimizer = value
                        .as_str()
                        .and_then(|s| OptimizerKind::from_str(s, true).ok())
                        .ok_or_else(bad)?
                }
                "activation" => {
                    p.activation = value
                        .as_str()
                        .and_then(|s| ActivationFunction::from_str(s, true).ok())
                        .ok_or_else(bad)?
                }
                "init_method" => {
                    p.init_method = value
                        .as_str()
                        .and_then(|s| InitMethod::from_str(s, true).ok())
                        .ok_or_else(bad)?
                }
                "input_parser" => self.input_parser = value.as_str().ok_or_else(bad)?.parse()?,
                "ids_key" => self.schema.record_keys.ids = value.as_str().ok_or_else(bad)?.to_string(),
                "vals_key" => self.schema.record_keys.vals = value.as_str().ok_or_else(bad)?.to_string(),
                "label_key" => self.schema.record_keys.label = value.as_str().ok_or_else(bad)?.to_string(),
                "feature_size" => self.schema.feature_size = value.as_usize().ok_or_else(bad)?,
                "num_fields" => self.num_fields = value.as_usize().ok_or_else(bad)?,
                "eval_steps" => self.eval_steps = value.as_usize().ok_or_else(bad)?,
                "throttle_secs" => self.throttle_secs = value.as_u64().ok_or_else(bad)?,
                "max_steps_without_decrease" => {
                    self.max_steps_without_decrease = value.as_u64().ok_or_else(bad)?
                }
                "save_checkpoints_steps" => {
                    self.run_config.save_checkpoints_steps = value.as_u64().ok_or_else(bad)?
                }
                "keep_checkpoint_max" => {
                    self.run_config.keep_checkpoint_max = value.as_usize().ok_or_else(bad)?
                }
                other => return Err(CtrError::Config(format!("unknown parameter '{}'", other))),
            }
        }

        Ok(())
    }
}
