use super::layers::{zero_fraction, ActivationFunction, BatchNorm, BatchNormCache, Dense, InitMethod};
use super::optimizer::Optimizer;
use super::{Gradients, Model, StepOutput};
use crate::error::{CtrError, Result};
use crate::metrics::{mean_cross_entropy, sigmoid};
use crate::parsing::pipeline::Batch;
use ndarray::{array, s, Array1, Array2, ArrayD, ArrayViewD, ArrayViewMutD, Axis};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;

/// Hyperparameters of the network
#[derive(Clone, Debug, PartialEq)]
pub struct DeepFmParams {
    pub feature_size: usize,
    pub num_fields: usize,
    pub embedding_dim: usize,
    pub hidden_units: Vec<usize>,
    pub activation: ActivationFunction,
    pub init_method: InitMethod,
    pub batch_norm_momentum: f64,
    pub batch_norm_epsilon: f64,
}

impl DeepFmParams {
    pub fn new(feature_size: usize, num_fields: usize) -> DeepFmParams {
        DeepFmParams {
            feature_size,
            num_fields,
            embedding_dim: 32,
            hidden_units: vec![50, 40],
            activation: ActivationFunction::ReLU,
            init_method: InitMethod::Xavier,
            batch_norm_momentum: 0.99,
            batch_norm_epsilon: 0.001,
        }
    }
}

/// A dense layer of the deep part, optionally followed by batch norm
struct DeepLayer {
    dense: Dense,
    norm: Option<BatchNorm>,
}

/// A linear part, a factorization-machine part and a deep part sharing
/// one embedding table, fused into a single logit
pub struct DeepFm {
    linear_weights: Array1<f64>,
    linear_bias: Array1<f64>,
    embeddings: Array2<f64>,
    deep: Vec<DeepLayer>,
    output: Dense,
    num_fields: usize,
    embedding_dim: usize,
}

/// Intermediate values of a deep layer kept for backprop
struct DeepCache {
    input: Array2<f64>,
    linear: Array2<f64>,
    norm: Option<BatchNormCache>,
}

/// Everything the backward pass needs from the forward pass
struct Forward {
    embedded: Array2<f64>,
    field_sum: Array2<f64>,
    deep: Vec<DeepCache>,
    deep_width: usize,
    concat: Array2<f64>,
    output_linear: Array2<f64>,
    logits: Array1<f64>,
    summaries: Vec<(String, f64)>,
}

impl DeepFm {
    pub fn new(params: &DeepFmParams, rng: &mut StdRng) -> DeepFm {
        let k = params.embedding_dim;
        // Same variance as a normal with stddev 1/sqrt(k)
        let boundary = (3f64 / k.max(1) as f64).sqrt();
        let distribution = Uniform::new_inclusive(-boundary, boundary);
        let embeddings = Array2::zeros((params.feature_size, k)).map(|_: &f64| distribution.sample(rng));

        let mut deep = vec![];
        let mut fan_in = params.num_fields * k;

        for (i, &units) in params.hidden_units.iter().enumerate() {
            // Batch norm follows every hidden layer but the last
            let norm = (i + 1 < params.hidden_units.len())
                .then(|| BatchNorm::new(units, params.batch_norm_momentum, params.batch_norm_epsilon));

            deep.push(DeepLayer {
                dense: Dense::new(fan_in, units, params.activation, params.init_method, rng),
                norm,
            });
            fan_in = units;
        }

        let output = Dense::new(
            1 + fan_in + k,
            1,
            ActivationFunction::Linear,
            params.init_method,
            rng,
        );

        DeepFm {
            linear_weights: Array1::zeros(params.feature_size),
            linear_bias: Array1::zeros(1),
            embeddings,
            deep,
            output,
            num_fields: params.num_fields,
            embedding_dim: k,
        }
    }

    fn check_batch(&self, batch: &Batch) -> Result<()> {
        if batch.feat_ids.ncols() > self.num_fields {
            return Err(CtrError::Model(format!(
                "batch has {} fields but the model was built for {}",
                batch.feat_ids.ncols(),
                self.num_fields
            )));
        }

        if let Some(id) = batch.feat_ids.iter().find(|id| **id >= self.linear_weights.len()) {
            return Err(CtrError::Model(format!(
                "feature id {} out of range (feature size {})",
                id,
                self.linear_weights.len()
            )));
        }

        Ok(())
    }

    fn forward(&self, batch: &Batch, training: bool) -> Result<Forward> {
        self.check_batch(batch)?;

        let (n, k) = (batch.len(), self.embedding_dim);
        let mut summaries = vec![];

        // Embedding lookup, each embedding scaled by its feature value
        let mut embedded = Array2::zeros((n, self.num_fields * k));
        let mut wide = Array1::from_elem(n, self.linear_bias[0]);

        for ((row, field), &id) in batch.feat_ids.indexed_iter() {
            let val = batch.feat_vals[[row, field]];
            embedded
                .slice_mut(s![row, field * k..(field + 1) * k])
                .scaled_add(val, &self.embeddings.row(id));
            wide[row] += self.linear_weights[id] * val;
        }

        // Second-order interactions: 0.5 * ((sum e)^2 - sum e^2)
        let mut field_sum = Array2::zeros((n, k));
        let mut square_sum = Array2::<f64>::zeros((n, k));

        for field in 0..self.num_fields {
            let e = embedded.slice(s![.., field * k..(field + 1) * k]);
            field_sum += &e;
            square_sum += &e.map(|x| x * x);
        }
        let fm = (&field_sum * &field_sum - &square_sum) * 0.5;

        let mut deep = Vec::with_capacity(self.deep.len());
        let mut hidden = embedded.clone();

        for (i, layer) in self.deep.iter().enumerate() {
            let (activated, linear) = layer.dense.forward(&hidden.view());

            if training {
                let tag = format!("deep/dense_{}", i);
                summaries.push((format!("{}/fraction_of_zero_values", tag), zero_fraction(&activated)));
                summaries.push((format!("{}/activation_mean", tag), activated.mean().unwrap_or(0f64)));
            }

            let (output, norm) = match &layer.norm {
                Some(norm) if training => {
                    let (output, cache) = norm.forward_train(&activated.view());
                    (output, Some(cache))
                }
                Some(norm) => (norm.forward_inference(&activated.view()), None),
                None => (activated, None),
            };

            deep.push(DeepCache {
                input: hidden,
                linear,
                norm,
            });
            hidden = output;
        }

        if training {
            summaries.push(("wide/activation_mean".to_string(), wide.mean().unwrap_or(0f64)));
            summaries.push(("fm/activation_mean".to_string(), fm.mean().unwrap_or(0f64)));
        }

        let deep_width = hidden.ncols();
        let mut concat = Array2::zeros((n, 1 + deep_width + k));
        concat.column_mut(0).assign(&wide);
        concat.slice_mut(s![.., 1..1 + deep_width]).assign(&hidden);
        concat.slice_mut(s![.., 1 + deep_width..]).assign(&fm);

        let (output, output_linear) = self.output.forward(&concat.view());
        let logits = output.column(0).to_owned();

        Ok(Forward {
            embedded,
            field_sum,
            deep,
            deep_width,
            concat,
            output_linear,
            logits,
            summaries,
        })
    }

    /// Gradients of the mean cross-entropy loss WRT every trainable variable
    fn backward(&self, batch: &Batch, forward: &Forward) -> Gradients {
        let mut gradients = Gradients::new();
        let n = batch.len().max(1) as f64;
        let k = self.embedding_dim;
        let h = forward.deep_width;

        let grad_logits = (forward.logits.map(|x| sigmoid(*x)) - &batch.target) / n;
        let out = self.output.backward(
            &forward.concat.view(),
            &forward.output_linear,
            grad_logits.insert_axis(Axis(1)),
        );
        gradients.insert("output/kernel".to_string(), out.weights.into_dyn());
        gradients.insert("output/bias".to_string(), out.bias.into_dyn());

        let grad_wide = out.input.column(0).to_owned();
        let grad_fm = out.input.slice(s![.., 1 + h..]).to_owned();
        let mut grad_hidden = out.input.slice(s![.., 1..1 + h]).to_owned();

        for (i, (layer, cache)) in self.deep.iter().zip(&forward.deep).enumerate().rev() {
            if let (Some(norm), Some(norm_cache)) = (&layer.norm, &cache.norm) {
                let (grad_gamma, grad_beta, grad_input) = norm.backward(norm_cache, &grad_hidden);
                gradients.insert(format!("deep/batch_norm_{}/gamma", i), grad_gamma.into_dyn());
                gradients.insert(format!("deep/batch_norm_{}/beta", i), grad_beta.into_dyn());
                grad_hidden = grad_input;
            }

            let dense = layer.dense.backward(&cache.input.view(), &cache.linear, grad_hidden);
            gradients.insert(format!("deep/dense_{}/kernel", i), dense.weights.into_dyn());
            gradients.insert(format!("deep/dense_{}/bias", i), dense.bias.into_dyn());
            grad_hidden = dense.input;
        }

        // The deep part is fed the flattened embeddings
        let mut grad_embedded = grad_hidden;

        for field in 0..self.num_fields {
            let others = &forward.field_sum - &forward.embedded.slice(s![.., field * k..(field + 1) * k]);
            let mut target = grad_embedded.slice_mut(s![.., field * k..(field + 1) * k]);
            target += &(&grad_fm * &others);
        }

        let mut grad_embeddings = Array2::zeros(self.embeddings.raw_dim());
        let mut grad_linear = Array1::zeros(self.linear_weights.len());

        for ((row, field), &id) in batch.feat_ids.indexed_iter() {
            let val = batch.feat_vals[[row, field]];
            grad_embeddings
                .row_mut(id)
                .scaled_add(val, &grad_embedded.slice(s![row, field * k..(field + 1) * k]));
            grad_linear[id] += grad_wide[row] * val;
        }

        gradients.insert("embeddings".to_string(), grad_embeddings.into_dyn());
        gradients.insert("linear/weights".to_string(), grad_linear.into_dyn());
        gradients.insert("linear/bias".to_string(), array![grad_wide.sum()].into_dyn());

        gradients
    }

    fn variables_mut(&mut self) -> Vec<(String, ArrayViewMutD<'_, f64>)> {
        let mut variables = vec![
            ("linear/weights".to_string(), self.linear_weights.view_mut().into_dyn()),
            ("linear/bias".to_string(), self.linear_bias.view_mut().into_dyn()),
            ("embeddings".to_string(), self.embeddings.view_mut().into_dyn()),
        ];

        for (i, layer) in self.deep.iter_mut().enumerate() {
            variables.push((format!("deep/dense_{}/kernel", i), layer.dense.weights.view_mut().into_dyn()));
            variables.push((format!("deep/dense_{}/bias", i), layer.dense.bias.view_mut().into_dyn()));

            if let Some(norm) = &mut layer.norm {
                let prefix = format!("deep/batch_norm_{}", i);
                variables.push((format!("{}/gamma", prefix), norm.gamma.view_mut().into_dyn()));
                variables.push((format!("{}/beta", prefix), norm.beta.view_mut().into_dyn()));
                variables.push((format!("{}/moving_mean", prefix), norm.moving_mean.view_mut().into_dyn()));
                variables.push((
                    format!("{}/moving_variance", prefix),
                    norm.moving_variance.view_mut().into_dyn(),
                ));
            }
        }

        variables.push(("output/kernel".to_string(), self.output.weights.view_mut().into_dyn()));
        variables.push(("output/bias".to_string(), self.output.bias.view_mut().into_dyn()));

        variables
    }
}

impl Model for DeepFm {
    fn train_step(&mut self, batch: &Batch, optimizer: &mut dyn Optimizer) -> Result<StepOutput> {
        let forward = self.forward(batch, true)?;
        let loss = mean_cross_entropy(forward.logits.view(), batch.target.view());
        let gradients = self.backward(batch, &forward);

        optimizer.apply_gradients(self.variables_mut(), &gradients);

        for (layer, cache) in self.deep.iter_mut().zip(&forward.deep) {
            if let (Some(norm), Some(norm_cache)) = (&mut layer.norm, &cache.norm) {
                norm.update_moving_statistics(norm_cache);
            }
        }

        Ok(StepOutput {
            loss,
            summaries: forward.summaries,
        })
    }

    fn predict(&self, batch: &Batch) -> Result<Array1<f64>> {
        Ok(self.forward(batch, false)?.logits)
    }

    fn variables(&self) -> Vec<(String, ArrayViewD<'_, f64>)> {
        let mut variables = vec![
            ("linear/weights".to_string(), self.linear_weights.view().into_dyn()),
            ("linear/bias".to_string(), self.linear_bias.view().into_dyn()),
            ("embeddings".to_string(), self.embeddings.view().into_dyn()),
        ];

        for (i, layer) in self.deep.iter().enumerate() {
            variables.push((format!("deep/dense_{}/kernel", i), layer.dense.weights.view().into_dyn()));
            variables.push((format!("deep/dense_{}/bias", i), layer.dense.bias.view().into_dyn()));

            if let Some(norm) = &layer.norm {
                let prefix = format!("deep/batch_norm_{}", i);
                variables.push((format!("{}/gamma", prefix), norm.gamma.view().into_dyn()));
                variables.push((format!("{}/beta", prefix), norm.beta.view().into_dyn()));
                variables.push((format!("{}/moving_mean", prefix), norm.moving_mean.view().into_dyn()));
                variables.push((format!("{}/moving_variance", prefix), norm.moving_variance.view().into_dyn()));
            }
        }

        variables.push(("output/kernel".to_string(), self.output.weights.view().into_dyn()));
        variables.push(("output/bias".to_string(), self.output.bias.view().into_dyn()));

        variables
    }

    fn assign(&mut self, name: &str, value: ArrayD<f64>) -> Result<()> {
        let (_, mut variable) = self
            .variables_mut()
            .into_iter()
            .find(|(n, _)| n == name)
            .ok_or_else(|| CtrError::Model(format!("unknown variable '{}'", name)))?;

        if variable.shape() != value.shape() {
            return Err(CtrError::Model(format!(
                "shape mismatch for '{}': expected {:?}, found {:?}",
                name,
                variable.shape(),
                value.shape()
            )));
        }

        variable.assign(&value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::optimizer::Adam;
    use crate::parsing::pipeline::InputPipeline;
    use crate::parsing::{Dataset, Example};
    use rand::SeedableRng;

    fn small_params() -> DeepFmParams {
        DeepFmParams {
            embedding_dim: 4,
            hidden_units: vec![6, 5],
            activation: ActivationFunction::Tanh,
            ..DeepFmParams::new(12, 3)
        }
    }

    fn batch() -> Batch {
        Batch {
            feat_ids: array![[0, 4, 8], [1, 5, 9], [2, 4, 10], [3, 6, 11]],
            feat_vals: array![[1.0, 0.5, 1.0], [1.0, 1.0, 0.3], [0.7, 1.0, 1.0], [1.0, 1.0, 0.0]],
            target: array![1.0, 0.0, 1.0, 0.0],
        }
    }

    fn loss(model: &DeepFm, batch: &Batch) -> f64 {
        let forward = model.forward(batch, true).unwrap();
        mean_cross_entropy(forward.logits.view(), batch.target.view())
    }

    #[test]
    fn gradients_match_finite_differences() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut model = DeepFm::new(&small_params(), &mut rng);
        model.linear_weights.fill(0.1);
        let batch = batch();

        let forward = model.forward(&batch, true).unwrap();
        let gradients = model.backward(&batch, &forward);

        let probes = [
            ("embeddings", vec![4, 2]),
            ("embeddings", vec![9, 0]),
            ("linear/weights", vec![5]),
            ("linear/bias", vec![0]),
            ("deep/dense_0/kernel", vec![3, 1]),
            ("deep/batch_norm_0/gamma", vec![2]),
            ("deep/dense_1/kernel", vec![0, 4]),
            ("output/kernel", vec![7, 0]),
        ];
        let h = 1e-6;

        for (name, index) in probes {
            let base = loss(&model, &batch);
            let mut value = model
                .variables()
                .into_iter()
                .find(|(n, _)| n == name)
                .unwrap()
                .1
                .to_owned();
            value[index.as_slice()] += h;
            let mut shifted = DeepFm::new(&small_params(), &mut StdRng::seed_from_u64(3));
            shifted.linear_weights.fill(0.1);
            shifted.assign(name, value).unwrap();

            let numeric = (loss(&shifted, &batch) - base) / h;
            let analytic = gradients[name][index.as_slice()];

            assert!(
                (numeric - analytic).abs() < 1e-4,
                "{} {:?}: numeric {} analytic {}",
                name,
                index,
                numeric,
                analytic
            );
        }
    }

    #[test]
    fn fm_part_is_pairwise_interactions() {
        let params = DeepFmParams {
            embedding_dim: 2,
            hidden_units: vec![],
            ..DeepFmParams::new(3, 3)
        };
        let mut model = DeepFm::new(&params, &mut StdRng::seed_from_u64(0));
        model.embeddings = array![[1.0, 2.0], [3.0, -1.0], [0.5, 0.5]];
        let batch = Batch {
            feat_ids: array![[0, 1, 2]],
            feat_vals: array![[1.0, 2.0, 1.0]],
            target: array![1.0],
        };

        let forward = model.forward(&batch, false).unwrap();
        // e = [1,2], [6,-2], [0.5,0.5]; pairwise dot products summed per dimension
        let expected = [1.0 * 6.0 + 1.0 * 0.5 + 6.0 * 0.5, 2.0 * -2.0 + 2.0 * 0.5 + -2.0 * 0.5];
        let fm = forward.concat.slice(s![0, 1 + forward.deep_width..]).to_vec();

        assert!((fm[0] - expected[0]).abs() < 1e-12);
        assert!((fm[1] - expected[1]).abs() < 1e-12);
    }

    #[test]
    fn training_reduces_loss() {
        // The label is fully determined by the id of the first field
        let examples: Vec<Example> = (0..64)
            .map(|i| Example {
                feat_ids: vec![i % 2, 2 + i % 5, 7 + i % 3],
                feat_vals: vec![1.0, 1.0, 1.0],
                label: (i % 2) as f64,
            })
            .collect();
        let dataset = Dataset::from_examples(examples);
        let params = DeepFmParams {
            embedding_dim: 4,
            hidden_units: vec![8, 4],
            batch_norm_momentum: 0.9,
            ..DeepFmParams::new(10, 3)
        };
        let mut model = DeepFm::new(&params, &mut StdRng::seed_from_u64(11));
        let mut optimizer = Adam::new(0.02);

        let full = InputPipeline::new(&dataset, 64).batches().next().unwrap();
        let before = mean_cross_entropy(model.predict(&full).unwrap().view(), full.target.view());

        for batch in InputPipeline::new(&dataset, 16).shuffle(64, 1).repeat(60).batches() {
            model.train_step(&batch, &mut optimizer).unwrap();
        }

        let after = mean_cross_entropy(model.predict(&full).unwrap().view(), full.target.view());
        assert!(after < before * 0.5, "loss went from {} to {}", before, after);
    }

    #[test]
    fn train_step_updates_moving_statistics() {
        let mut model = DeepFm::new(&small_params(), &mut StdRng::seed_from_u64(5));
        let mut optimizer = Adam::new(0.01);

        let output = model.train_step(&batch(), &mut optimizer).unwrap();

        assert!(output.loss.is_finite());
        assert!(output
            .summaries
            .iter()
            .any(|(tag, _)| tag == "deep/dense_0/fraction_of_zero_values"));
        let norm = model.deep[0].norm.as_ref().unwrap();
        assert!(norm.moving_mean.iter().any(|x| *x != 0.0));
        assert!(model.deep[1].norm.is_none());
    }

    #[test]
    fn rejects_bad_batches() {
        let model = DeepFm::new(&small_params(), &mut StdRng::seed_from_u64(0));
        let too_wide = Batch {
            feat_ids: array![[0, 1, 2, 3]],
            feat_vals: array![[1.0, 1.0, 1.0, 1.0]],
            target: array![1.0],
        };
        let out_of_range = Batch {
            feat_ids: array![[0, 1, 12]],
            feat_vals: array![[1.0, 1.0, 1.0]],
            target: array![1.0],
        };

        assert!(model.predict(&too_wide).is_err());
        assert!(model.predict(&out_of_range).is_err());
    }

    #[test]
    fn assign_checks_shapes() {
        let mut model = DeepFm::new(&small_params(), &mut StdRng::seed_from_u64(0));

        assert!(model.assign("linear/bias", array![0.5].into_dyn()).is_ok());
        assert_eq!(model.linear_bias[0], 0.5);
        assert!(model.assign("linear/bias", array![0.5, 1.0].into_dyn()).is_err());
        assert!(model.assign("nope", array![0.5].into_dyn()).is_err());
    }
}
