use super::Gradients;
use ndarray::{ArrayD, ArrayViewMutD, Zip};
use std::collections::HashMap;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptimizerKind {
    Adam,
    Adagrad,
}

/// Slot variables are keyed by variable name and created the first time
/// a variable receives a gradient
pub trait Optimizer {
    /// Apply one update step to every variable that has a gradient
    fn apply_gradients(&mut self, variables: Vec<(String, ArrayViewMutD<'_, f64>)>, gradients: &Gradients);

    fn learning_rate(&self) -> f64;
}

pub fn build_optimizer(kind: OptimizerKind, learning_rate: f64) -> Box<dyn Optimizer> {
    match kind {
        OptimizerKind::Adam => Box::new(Adam::new(learning_rate)),
        OptimizerKind::Adagrad => Box::new(Adagrad::new(learning_rate)),
    }
}

pub struct Adam {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    t: i32,
    m: HashMap<String, ArrayD<f64>>,
    v: HashMap<String, ArrayD<f64>>,
}

impl Adam {
    pub fn new(learning_rate: f64) -> Adam {
        Adam {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            t: 0,
            m: HashMap::new(),
            v: HashMap::new(),
        }
    }
}

impl Optimizer for Adam {
    fn apply_gradients(&mut self, variables: Vec<(String, ArrayViewMutD<'_, f64>)>, gradients: &Gradients) {
        self.t += 1;
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);
        // Bias correction folded into the step size
        let lr_t = self.learning_rate * (1f64 - beta2.powi(self.t)).sqrt() / (1f64 - beta1.powi(self.t));

        for (name, variable) in variables {
            let Some(grad) = gradients.get(&name) else {
                continue;
            };
            let m = self
                .m
                .entry(name.clone())
                .or_insert_with(|| ArrayD::zeros(grad.raw_dim()));
            let v = self
                .v
                .entry(name)
                .or_insert_with(|| ArrayD::zeros(grad.raw_dim()));

            Zip::from(variable)
                .and(grad)
                .and(m)
                .and(v)
                .for_each(|param, &g, m, v| {
                    *m = beta1 * *m + (1f64 - beta1) * g;
                    *v = beta2 * *v + (1f64 - beta2) * g * g;
                    *param -= lr_t * *m / (v.sqrt() + epsilon);
                });
        }
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }
}

pub struct Adagrad {
    pub learning_rate: f64,
    pub initial_accumulator_value: f64,
    accumulators: HashMap<String, ArrayD<f64>>,
}

impl Adagrad {
    pub fn new(learning_rate: f64) -> Adagrad {
        Adagrad {
            learning_rate,
            initial_accumulator_value: 0.1,
            accumulators: HashMap::new(),
        }
    }
}

impl Optimizer for Adagrad {
    fn apply_gradients(&mut self, variables: Vec<(String, ArrayViewMutD<'_, f64>)>, gradients: &Gradients) {
        let lr = self.learning_rate;

        for (name, variable) in variables {
            let Some(grad) = gradients.get(&name) else {
                continue;
            };
            let initial = self.initial_accumulator_value;
            let acc = self
                .accumulators
                .entry(name)
                .or_insert_with(|| ArrayD::from_elem(grad.raw_dim(), initial));

            Zip::from(variable).and(grad).and(acc).for_each(|param, &g, acc| {
                *acc += g * g;
                *param -= lr * g / acc.sqrt();
            });
        }
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }
}
