use crate::error::{CtrError, Result};
use ndarray::{Array1, Array2};
use std::path::Path;
use std::str::FromStr;

pub mod csv_input;
pub mod libsvm;
pub mod pipeline;
pub mod schema;
pub mod tfrecord;

use schema::FeatureSchema;

/// One labelled row: parallel feature ids and values
#[derive(Clone, Debug, PartialEq)]
pub struct Example {
    pub feat_ids: Vec<usize>,
    pub feat_vals: Vec<f64>,
    pub label: f64,
}

/// A parsed input file. Row `i` of `feat_ids`/`feat_vals` holds the fields of example `i`
pub struct Dataset {
    pub feat_ids: Array2<usize>,
    pub feat_vals: Array2<f64>,
    pub target: Array1<f64>,
}

impl Dataset {
    /// Stack examples into matrices. Short rows are padded with id 0 and value 0,
    /// which contribute nothing to the model
    pub fn from_examples(examples: Vec<Example>) -> Dataset {
        let num_fields = examples.iter().map(|e| e.feat_ids.len()).max().unwrap_or(0);
        let mut feat_ids = Array2::zeros((examples.len(), num_fields));
        let mut feat_vals = Array2::zeros((examples.len(), num_fields));
        let mut target = Array1::zeros(examples.len());

        for (row, example) in examples.iter().enumerate() {
            for (col, (id, val)) in example.feat_ids.iter().zip(&example.feat_vals).enumerate() {
                feat_ids[[row, col]] = *id;
                feat_vals[[row, col]] = *val;
            }
            target[row] = example.label;
        }

        Dataset {
            feat_ids,
            feat_vals,
            target,
        }
    }

    pub fn len(&self) -> usize {
        self.target.len()
    }

    pub fn is_empty(&self) -> bool {
        self.target.is_empty()
    }

    pub fn num_fields(&self) -> usize {
        self.feat_ids.ncols()
    }
}

/// Serialization of an input file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputFormat {
    Csv,
    Libsvm,
    TfRecord,
}

impl InputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            InputFormat::Csv => "csv",
            InputFormat::Libsvm => "libsvm",
            InputFormat::TfRecord => "tfrecord",
        }
    }
}

impl FromStr for InputFormat {
    type Err = CtrError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "csv" => Ok(InputFormat::Csv),
            "libsvm" => Ok(InputFormat::Libsvm),
            "tfrecord" => Ok(InputFormat::TfRecord),
            other => Err(CtrError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Parse an input file according to its format
pub fn parse_dataset(path: &Path, format: InputFormat, schema: &FeatureSchema) -> Result<Dataset> {
    let dataset = match format {
        InputFormat::Csv => {
            if schema.columns.is_empty() {
                return Err(CtrError::Config(
                    "csv input needs a column schema".to_string(),
                ));
            }
            csv_input::parse_dataset(path, schema)?
        }
        InputFormat::Libsvm => libsvm::parse_dataset(path, schema.feature_size)?,
        InputFormat::TfRecord => {
            tfrecord::parse_dataset(path, &schema.record_keys, schema.feature_size)?
        }
    };

    if dataset.is_empty() {
        log::warn!("no examples in {}", path.display());
    }

    log::info!(
        "parsed {} examples with {} fields from {}",
        dataset.len(),
        dataset.num_fields(),
        path.display()
    );

    Ok(dataset)
}
