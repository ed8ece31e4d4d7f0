use ndarray::{Array, Array1, Array2, ArrayView2, Axis};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivationFunction {
    #[value(name = "relu")]
    ReLU,
    Sigmoid,
    Tanh,
    Linear,
    #[value(name = "leaky-relu")]
    LeakyReLU,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitMethod {
    Default,
    Xavier,
}

pub fn activation(name: ActivationFunction, z: f64) -> f64 {
    match name {
        ActivationFunction::ReLU => z.max(0f64),
        ActivationFunction::Sigmoid => (1f64 + (-z).exp()).recip(),
        ActivationFunction::Tanh => z.tanh(),
        ActivationFunction::Linear => z,
        ActivationFunction::LeakyReLU => z.max(0.01 * z),
    }
}

pub fn delta_activation(name: ActivationFunction, z: f64) -> f64 {
    match name {
        ActivationFunction::ReLU => {
            if z > 0f64 {
                1f64
            } else {
                0f64
            }
        }
        ActivationFunction::Sigmoid => activation(name, z) * (1f64 - activation(name, z)),
        ActivationFunction::Tanh => 1f64 - activation(name, z) * activation(name, z),
        ActivationFunction::Linear => 1f64,
        ActivationFunction::LeakyReLU => {
            if z > 0f64 {
                1f64
            } else {
                0.01f64
            }
        }
    }
}

/// Random weight matrix between a layer of `fan_in` units and one of `fan_out` units
pub fn init_weights(fan_in: usize, fan_out: usize, method: InitMethod, rng: &mut StdRng) -> Array2<f64> {
    let boundary = match method {
        InitMethod::Default => 0.3,
        // Glorot uniform
        InitMethod::Xavier => (6f64 / (fan_in + fan_out).max(1) as f64).sqrt(),
    };
    let distribution = Uniform::new_inclusive(-boundary, boundary);

    Array::zeros((fan_in, fan_out)).map(|_: &f64| distribution.sample(rng))
}

/// Fully connected layer: `activation(input . weights + bias)`
#[derive(Clone, Debug)]
pub struct Dense {
    pub weights: Array2<f64>,
    pub bias: Array1<f64>,
    pub activation: ActivationFunction,
}

pub struct DenseGrads {
    pub weights: Array2<f64>,
    pub bias: Array1<f64>,
    pub input: Array2<f64>,
}

impl Dense {
    pub fn new(
        fan_in: usize,
        fan_out: usize,
        activation: ActivationFunction,
        init_method: InitMethod,
        rng: &mut StdRng,
    ) -> Dense {
        Dense {
            weights: init_weights(fan_in, fan_out, init_method, rng),
            bias: Array1::zeros(fan_out),
            activation,
        }
    }

    /// Returns the activated output and the linear output (kept for backprop)
    pub fn forward(&self, input: &ArrayView2<f64>) -> (Array2<f64>, Array2<f64>) {
        let linear = input.dot(&self.weights) + &self.bias;
        let output = linear.map(|x| activation(self.activation, *x));

        (output, linear)
    }

    /// Gradients given the gradient of the loss WRT this layer's activated output
    pub fn backward(
        &self,
        input: &ArrayView2<f64>,
        linear: &Array2<f64>,
        grad_output: Array2<f64>,
    ) -> DenseGrads {
        let grad_linear = grad_output * linear.map(|x| delta_activation(self.activation, *x));

        DenseGrads {
            weights: input.t().dot(&grad_linear),
            bias: grad_linear.sum_axis(Axis(0)),
            input: grad_linear.dot(&self.weights.t()),
        }
    }
}

/// Batch normalization over the batch axis, with learned scale and offset
#[derive(Clone, Debug)]
pub struct BatchNorm {
    pub gamma: Array1<f64>,
    pub beta: Array1<f64>,
    pub moving_mean: Array1<f64>,
    pub moving_variance: Array1<f64>,
    pub momentum: f64,
    pub epsilon: f64,
}

/// What the backward pass needs from a training forward pass
pub struct BatchNormCache {
    normalized: Array2<f64>,
    inv_std: Array1<f64>,
    pub mean: Array1<f64>,
    pub variance: Array1<f64>,
}

impl BatchNorm {
    pub fn new(units: usize, momentum: f64, epsilon: f64) -> BatchNorm {
        BatchNorm {
            gamma: Array1::ones(units),
            beta: Array1::zeros(units),
            moving_mean: Array1::zeros(units),
            moving_variance: Array1::ones(units),
            momentum,
            epsilon,
        }
    }

    /// Normalize with the statistics of the batch itself
    pub fn forward_train(&self, input: &ArrayView2<f64>) -> (Array2<f64>, BatchNormCache) {
        let n = input.nrows().max(1) as f64;
        let mean = input.sum_axis(Axis(0)) / n;
        let centered = input - &mean;
        let variance = centered.map(|x| x * x).sum_axis(Axis(0)) / n;
        let inv_std = variance.map(|v| (v + self.epsilon).sqrt().recip());
        let normalized = centered * &inv_std;
        let output = &normalized * &self.gamma + &self.beta;

        (
            output,
            BatchNormCache {
                normalized,
                inv_std,
                mean,
                variance,
            },
        )
    }

    /// Normalize with the moving statistics
    pub fn forward_inference(&self, input: &ArrayView2<f64>) -> Array2<f64> {
        let inv_std = self.moving_variance.map(|v| (v + self.epsilon).sqrt().recip());
        (input - &self.moving_mean) * &inv_std * &self.gamma + &self.beta
    }

    pub fn update_moving_statistics(&mut self, cache: &BatchNormCache) {
        let m = self.momentum;
        self.moving_mean = &self.moving_mean * m + &cache.mean * (1f64 - m);
        self.moving_variance = &self.moving_variance * m + &cache.variance * (1f64 - m);
    }

    /// Returns the gradients WRT gamma, beta and the input
    pub fn backward(
        &self,
        cache: &BatchNormCache,
        grad_output: &Array2<f64>,
    ) -> (Array1<f64>, Array1<f64>, Array2<f64>) {
        let n = grad_output.nrows().max(1) as f64;
        let grad_gamma = (grad_output * &cache.normalized).sum_axis(Axis(0));
        let grad_beta = grad_output.sum_axis(Axis(0));

        let grad_normalized = grad_output * &self.gamma;
        let sum_grad = grad_normalized.sum_axis(Axis(0));
        let sum_grad_dot = (&grad_normalized * &cache.normalized).sum_axis(Axis(0));

        let grad_input = (grad_normalized * n - &sum_grad - &cache.normalized * &sum_grad_dot)
            * &cache.inv_std
            / n;

        (grad_gamma, grad_beta, grad_input)
    }
}

/// Fraction of exactly-zero entries, e.g. dead ReLU units
pub fn zero_fraction(values: &Array2<f64>) -> f64 {
    if values.is_empty() {
        return 0f64;
    }
    values.iter().filter(|x| **x == 0f64).count() as f64 / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn dense_forward() {
        let layer = Dense {
            weights: array![[1.0, -1.0], [2.0, 0.5]],
            bias: array![0.5, -3.0],
            activation: ActivationFunction::ReLU,
        };

        let (output, linear) = layer.forward(&array![[1.0, 1.0]].view());

        assert_eq!(linear, array![[3.5, -3.5]]);
        assert_eq!(output, array![[3.5, 0.0]]);
    }

    #[test]
    fn dense_backward_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(1);
        let layer = Dense::new(3, 2, ActivationFunction::Tanh, InitMethod::Xavier, &mut rng);
        let input = array![[0.3, -0.2, 0.9], [0.1, 0.4, -0.5]];

        // loss = sum of outputs
        let loss = |layer: &Dense| layer.forward(&input.view()).0.sum();
        let (output, linear) = layer.forward(&input.view());
        let grads = layer.backward(&input.view(), &linear, Array2::ones(output.raw_dim()));

        let h = 1e-6;
        let mut shifted = layer.clone();
        shifted.weights[[1, 0]] += h;
        let numeric = (loss(&shifted) - loss(&layer)) / h;

        assert!((numeric - grads.weights[[1, 0]]).abs() < 1e-4);
    }

    #[test]
    fn batch_norm_normalizes_batch() {
        let norm = BatchNorm::new(1, 0.99, 0.001);
        let (output, cache) = norm.forward_train(&array![[1.0], [3.0]].view());

        assert!((cache.mean[0] - 2.0).abs() < 1e-12);
        assert!((cache.variance[0] - 1.0).abs() < 1e-12);
        assert!((output[[0, 0]] + output[[1, 0]]).abs() < 1e-12);
        assert!(output[[1, 0]] > 0.99);
    }

    #[test]
    fn batch_norm_moving_statistics() {
        let mut norm = BatchNorm::new(1, 0.9, 0.001);
        let (_, cache) = norm.forward_train(&array![[1.0], [3.0]].view());
        norm.update_moving_statistics(&cache);

        assert!((norm.moving_mean[0] - 0.2).abs() < 1e-12);
        assert!((norm.moving_variance[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn batch_norm_backward_matches_finite_differences() {
        let mut norm = BatchNorm::new(2, 0.99, 0.001);
        norm.gamma = array![1.5, 0.5];
        let input = array![[0.3, -1.0], [1.2, 0.4], [-0.7, 2.0]];
        let weights = array![[1.0, 2.0], [-1.0, 0.5], [0.3, 0.3]];

        // loss = sum(weights * output), so the output gradient is `weights`
        let loss = |x: &Array2<f64>| (norm.forward_train(&x.view()).0 * &weights).sum();
        let (_, cache) = norm.forward_train(&input.view());
        let (_, _, grad_input) = norm.backward(&cache, &weights);

        let h = 1e-6;
        let mut shifted = input.clone();
        shifted[[1, 0]] += h;
        let numeric = (loss(&shifted) - loss(&input)) / h;

        assert!((numeric - grad_input[[1, 0]]).abs() < 1e-4);
    }

    #[test]
    fn zero_fraction_counts_zeros() {
        assert_eq!(zero_fraction(&array![[0.0, 1.0], [0.0, 0.0]]), 0.75);
    }
}
