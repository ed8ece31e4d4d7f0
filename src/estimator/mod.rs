use crate::error::{CtrError, Result};
use crate::metrics::{sigmoid, EvalMetrics};
use crate::model::optimizer::Optimizer;
use crate::model::Model;
use crate::parsing::pipeline::Batch;
use ndarray::Array1;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub mod checkpoint;
pub mod summary;

use checkpoint::CheckpointManager;
use summary::SummaryWriter;

/// How often the training loop logs, summarizes and checkpoints
#[derive(Clone, Debug, PartialEq)]
pub struct RunConfig {
    pub save_summary_steps: u64,
    pub log_step_count_steps: u64,
    pub keep_checkpoint_max: usize,
    pub save_checkpoints_steps: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            save_summary_steps: 50,
            log_step_count_steps: 50,
            keep_checkpoint_max: 3,
            save_checkpoints_steps: 50,
        }
    }
}

/// Stops training once the evaluation loss has not decreased for
/// `max_steps_without_decrease` global steps
#[derive(Clone, Debug)]
pub struct EarlyStopping {
    pub max_steps_without_decrease: u64,
    best: Option<(f64, u64)>,
}

impl EarlyStopping {
    pub fn new(max_steps_without_decrease: u64) -> EarlyStopping {
        EarlyStopping {
            max_steps_without_decrease,
            best: None,
        }
    }

    /// Record an evaluation loss. Returns true if training should stop
    pub fn should_stop(&mut self, global_step: u64, loss: f64) -> bool {
        match self.best {
            Some((best, _)) if loss >= best => {}
            _ => self.best = Some((loss, global_step)),
        }

        let best_step = self.best.map_or(global_step, |(_, step)| step);
        global_step - best_step >= self.max_steps_without_decrease
    }
}

pub struct TrainSpec {
    /// Stop after this many global steps. `None` trains until the input is exhausted
    pub max_steps: Option<u64>,
    pub early_stopping: Option<EarlyStopping>,
}

pub struct EvalSpec {
    /// Evaluate on at most this many batches. `None` evaluates on the whole input
    pub steps: Option<usize>,
    /// Minimum time between two evaluations
    pub throttle_secs: u64,
}

pub struct Estimator {
    model: Box<dyn Model>,
    optimizer: Box<dyn Optimizer>,
    config: RunConfig,
    model_dir: PathBuf,
    checkpoints: CheckpointManager,
    global_step: u64,
}

impl Estimator {
    /// Build an estimator, warm-starting from the newest checkpoint in `model_dir` if any
    pub fn new(
        mut model: Box<dyn Model>,
        optimizer: Box<dyn Optimizer>,
        config: RunConfig,
        model_dir: &Path,
    ) -> Result<Estimator> {
        fs::create_dir_all(model_dir)?;
        let checkpoints = CheckpointManager::new(model_dir, config.keep_checkpoint_max);
        let global_step = checkpoints.restore(model.as_mut())?.unwrap_or(0);

        Ok(Estimator {
            model,
            optimizer,
            config,
            model_dir: model_dir.to_path_buf(),
            checkpoints,
            global_step,
        })
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    fn save(&self) -> Result<()> {
        let path = self.checkpoints.save(self.model.as_ref(), self.global_step)?;
        log::info!(
            "Saving checkpoints for {} into {}",
            self.global_step,
            path.display()
        );
        Ok(())
    }

    fn evaluate_and_log<I>(
        &self,
        input: I,
        steps: Option<usize>,
        summaries: &mut SummaryWriter,
    ) -> Result<EvalMetrics>
    where
        I: Iterator<Item = Batch>,
    {
        let metrics = self.evaluate(input, steps)?;

        log::info!(
            "Saving dict for global step {}: accuracy = {:.4}, auc = {:.4}, pr = {:.4}, loss = {:.6}, global_step = {}",
            self.global_step,
            metrics.accuracy,
            metrics.auc,
            metrics.pr,
            metrics.loss,
            self.global_step
        );

        for (tag, value) in metrics.scalars() {
            summaries.scalar(self.global_step, tag, value)?;
        }
        summaries.flush()?;

        Ok(metrics)
    }

    /// Train on `train_input`, evaluating on a fresh `eval_input()` after
    /// checkpoints (at most once per `throttle_secs`) and once at the end.
    /// Returns the final evaluation
    pub fn train_and_evaluate<I, E, J>(
        &mut self,
        train_input: I,
        train_spec: &mut TrainSpec,
        eval_input: E,
        eval_spec: &EvalSpec,
    ) -> Result<EvalMetrics>
    where
        I: Iterator<Item = Batch>,
        E: Fn() -> J,
        J: Iterator<Item = Batch>,
    {
        let mut train_summaries = SummaryWriter::create(&self.model_dir)?;
        let mut eval_summaries = SummaryWriter::create(&self.model_dir.join("eval"))?;
        let throttle = Duration::from_secs(eval_spec.throttle_secs);

        let mut last_eval: Option<(Instant, u64, EvalMetrics)> = None;
        let mut last_saved = self.global_step;
        let mut timer = (Instant::now(), self.global_step);

        log::info!(
            "Start training from global step {} with learning rate {}",
            self.global_step,
            self.optimizer.learning_rate()
        );

        for batch in train_input {
            if train_spec.max_steps.map_or(false, |max| self.global_step >= max) {
                break;
            }

            let output = self.model.train_step(&batch, self.optimizer.as_mut())?;
            self.global_step += 1;
            let step = self.global_step;

            if !output.loss.is_finite() {
                return Err(CtrError::Model(format!("loss is {} at step {}", output.loss, step)));
            }

            if step % self.config.log_step_count_steps.max(1) == 0 {
                let elapsed = timer.0.elapsed().as_secs_f64().max(1e-9);
                log::info!(
                    "loss = {:.6}, step = {} ({:.1} global_step/sec)",
                    output.loss,
                    step,
                    (step - timer.1) as f64 / elapsed
                );
                timer = (Instant::now(), step);
            }

            if step % self.config.save_summary_steps.max(1) == 0 {
                train_summaries.scalar(step, "loss", output.loss)?;
                train_summaries.scalar(step, "label_mean", batch.target.mean().unwrap_or(0f64))?;
                for (tag, value) in &output.summaries {
                    train_summaries.scalar(step, tag, *value)?;
                }
                train_summaries.flush()?;
            }

            if step % self.config.save_checkpoints_steps.max(1) == 0 {
                self.save()?;
                last_saved = step;

                if last_eval.as_ref().map_or(true, |(at, _, _)| at.elapsed() >= throttle) {
                    let metrics = self.evaluate_and_log(eval_input(), eval_spec.steps, &mut eval_summaries)?;
                    let stop = train_spec
                        .early_stopping
                        .as_mut()
                        .map_or(false, |hook| hook.should_stop(step, metrics.loss));
                    last_eval = Some((Instant::now(), step, metrics));

                    if stop {
                        log::info!("Requesting early stopping at global step {}", step);
                        break;
                    }
                }
            }
        }

        if last_saved != self.global_step {
            self.save()?;
        }

        match last_eval {
            Some((_, step, metrics)) if step == self.global_step => Ok(metrics),
            _ => self.evaluate_and_log(eval_input(), eval_spec.steps, &mut eval_summaries),
        }
    }

    /// Metrics over at most `steps` batches of `input`, in inference mode
    pub fn evaluate<I>(&self, input: I, steps: Option<usize>) -> Result<EvalMetrics>
    where
        I: Iterator<Item = Batch>,
    {
        let mut logits = vec![];
        let mut labels = vec![];

        for batch in input.take(steps.unwrap_or(usize::MAX)) {
            logits.extend(self.model.predict(&batch)?.iter().copied());
            labels.extend(batch.target.iter().copied());
        }

        Ok(EvalMetrics::compute(
            &Array1::from_vec(logits),
            &Array1::from_vec(labels),
        ))
    }

    /// Click probabilities for every example of `input`, in order
    pub fn predict<I>(&self, input: I) -> Result<Vec<f64>>
    where
        I: Iterator<Item = Batch>,
    {
        let mut probabilities = vec![];

        for batch in input {
            probabilities.extend(self.model.predict(&batch)?.iter().map(|x| sigmoid(*x)));
        }

        Ok(probabilities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::deepfm::{DeepFm, DeepFmParams};
    use crate::model::optimizer::Adam;
    use crate::parsing::pipeline::InputPipeline;
    use crate::parsing::{Dataset, Example};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeSet;

    fn dataset(n: usize) -> Dataset {
        Dataset::from_examples(
            (0..n)
                .map(|i| Example {
                    feat_ids: vec![i % 2, 2 + i % 3],
                    feat_vals: vec![1.0, 1.0],
                    label: (i % 2) as f64,
                })
                .collect(),
        )
    }

    fn estimator(dir: &Path) -> Estimator {
        let params = DeepFmParams {
            embedding_dim: 3,
            hidden_units: vec![4, 3],
            ..DeepFmParams::new(5, 2)
        };
        let config = RunConfig {
            save_summary_steps: 5,
            log_step_count_steps: 5,
            keep_checkpoint_max: 2,
            save_checkpoints_steps: 10,
        };

        Estimator::new(
            Box::new(DeepFm::new(&params, &mut StdRng::seed_from_u64(4))),
            Box::new(Adam::new(0.01)),
            config,
            dir,
        )
        .unwrap()
    }

    #[test]
    fn early_stopping_waits_for_no_decrease() {
        let mut hook = EarlyStopping::new(100);

        assert!(!hook.should_stop(50, 0.6));
        assert!(!hook.should_stop(100, 0.5));
        assert!(!hook.should_stop(150, 0.55));
        assert!(hook.should_stop(200, 0.5));
    }

    #[test]
    fn train_and_evaluate_checkpoints_and_summarizes() {
        let dir = tempfile::tempdir().unwrap();
        let train = dataset(40);
        let valid = dataset(12);
        let mut est = estimator(dir.path());

        let mut train_spec = TrainSpec {
            max_steps: Some(35),
            early_stopping: None,
        };
        let eval_spec = EvalSpec {
            steps: Some(200),
            throttle_secs: 0,
        };

        let metrics = est
            .train_and_evaluate(
                InputPipeline::new(&train, 4).shuffle(16, 0).repeat(100).batches(),
                &mut train_spec,
                || InputPipeline::new(&valid, 4).batches(),
                &eval_spec,
            )
            .unwrap();

        assert_eq!(est.global_step(), 35);
        assert_eq!(metrics.num_examples, 12);

        let checkpoints = CheckpointManager::new(dir.path(), 2).checkpoints().unwrap();
        assert_eq!(checkpoints, vec!["model.ckpt-30.json", "model.ckpt-35.json"]);

        let summaries = fs::read_to_string(dir.path().join("summaries.csv")).unwrap();
        assert!(summaries.contains("35,loss,"));
        assert!(summaries.contains("label_mean"));
        let eval = fs::read_to_string(dir.path().join("eval").join("summaries.csv")).unwrap();
        assert!(eval.contains("10,auc,"));
        assert!(eval.contains("35,auc,"));
    }

    #[test]
    fn throttled_evaluations_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let train = dataset(40);
        let valid = dataset(12);
        let mut est = estimator(dir.path());

        let metrics = est
            .train_and_evaluate(
                InputPipeline::new(&train, 4).repeat(100).batches(),
                &mut TrainSpec {
                    max_steps: Some(35),
                    early_stopping: None,
                },
                || InputPipeline::new(&valid, 4).batches(),
                &EvalSpec {
                    steps: None,
                    throttle_secs: 3600,
                },
            )
            .unwrap();

        // Checkpoints at 10, 20 and 30 but only the first one evaluates
        let eval = fs::read_to_string(dir.path().join("eval").join("summaries.csv")).unwrap();
        let steps: BTreeSet<u64> = eval
            .lines()
            .skip(1)
            .map(|line| line.split(',').next().unwrap().parse().unwrap())
            .collect();
        assert_eq!(steps, BTreeSet::from([10, 35]));

        // The final evaluation is of the step 35 weights
        let fresh = est.evaluate(InputPipeline::new(&valid, 4).batches(), None).unwrap();
        assert_eq!(metrics, fresh);
    }

    #[test]
    fn warm_starts_from_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let train = dataset(20);
        let valid = dataset(6);

        let mut est = estimator(dir.path());
        est.train_and_evaluate(
            InputPipeline::new(&train, 4).batches(),
            &mut TrainSpec {
                max_steps: None,
                early_stopping: None,
            },
            || InputPipeline::new(&valid, 4).batches(),
            &EvalSpec {
                steps: None,
                throttle_secs: 60,
            },
        )
        .unwrap();
        let before = est.predict(InputPipeline::new(&valid, 4).batches()).unwrap();

        let restored = estimator(dir.path());
        let after = restored.predict(InputPipeline::new(&valid, 4).batches()).unwrap();

        assert_eq!(restored.global_step(), 5);
        assert_eq!(before.len(), 6);
        for (a, b) in before.iter().zip(&after) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn early_stopping_ends_training() {
        let dir = tempfile::tempdir().unwrap();
        let train = dataset(40);
        let valid = dataset(8);
        let mut est = estimator(dir.path());

        est.train_and_evaluate(
            InputPipeline::new(&train, 4).repeat(1000).batches(),
            &mut TrainSpec {
                max_steps: Some(5000),
                early_stopping: Some(EarlyStopping::new(0)),
            },
            || InputPipeline::new(&valid, 4).batches(),
            &EvalSpec {
                steps: None,
                throttle_secs: 0,
            },
        )
        .unwrap();

        // With no tolerance the hook fires at the first evaluation
        assert_eq!(est.global_step(), 10);
    }

    #[test]
    fn evaluate_respects_steps() {
        let dir = tempfile::tempdir().unwrap();
        let valid = dataset(10);
        let est = estimator(dir.path());

        let metrics = est.evaluate(InputPipeline::new(&valid, 3).batches(), Some(2)).unwrap();

        assert_eq!(metrics.num_examples, 6);
    }
}
