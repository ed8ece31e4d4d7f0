use crate::error::{CtrError, Result};
use crate::parsing::pipeline::Batch;
use ndarray::{Array1, ArrayD, ArrayViewD};
use rand::rngs::StdRng;
use std::collections::BTreeMap;

pub mod deepfm;
pub mod layers;
pub mod optimizer;

use deepfm::{DeepFm, DeepFmParams};
use optimizer::Optimizer;

/// Gradient of the loss WRT each trainable variable, by variable name
pub type Gradients = BTreeMap<String, ArrayD<f64>>;

/// Result of one training step
pub struct StepOutput {
    pub loss: f64,
    /// Scalar summaries of intermediate layers, by tag
    pub summaries: Vec<(String, f64)>,
}

pub trait Model {
    /// Forward pass, backward pass and one optimizer update on a batch
    fn train_step(&mut self, batch: &Batch, optimizer: &mut dyn Optimizer) -> Result<StepOutput>;

    /// Logits for a batch, in inference mode
    fn predict(&self, batch: &Batch) -> Result<Array1<f64>>;

    /// Every variable (trainable or not) that a checkpoint must hold
    fn variables(&self) -> Vec<(String, ArrayViewD<'_, f64>)>;

    /// Overwrite a variable, e.g. when restoring a checkpoint
    fn assign(&mut self, name: &str, value: ArrayD<f64>) -> Result<()>;
}

pub const SUPPORTED_MODELS: [&str; 1] = ["deepfm"];

/// Build the model function registered under `model_name`
pub fn build_model(model_name: &str, params: &DeepFmParams, rng: &mut StdRng) -> Result<Box<dyn Model>> {
    match model_name.to_lowercase().as_str() {
        "deepfm" => Ok(Box::new(DeepFm::new(params, rng))),
        _ => Err(CtrError::Unsupported {
            name: model_name.to_string(),
            supported: SUPPORTED_MODELS.join(","),
        }),
    }
}
