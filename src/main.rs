pub mod config;
pub mod error;
pub mod estimator;
pub mod metrics;
pub mod model;
pub mod parsing;

use clap::Parser;
use config::Config;
use error::Result;
use estimator::{EarlyStopping, EvalSpec, Estimator, TrainSpec};
use model::optimizer::build_optimizer;
use parsing::pipeline::InputPipeline;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    Train,
    Predict,
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Which model to use [deepfm]
    #[arg(short, long)]
    model: String,

    /// Train, or predict on the validation file
    #[arg(short, long, value_enum, default_value_t = Step::Train)]
    step: Step,

    /// Whether to clear the existing model (any non-zero value clears it)
    #[arg(short, long, default_value_t = 1)]
    clear_model: u8,

    /// Which dataset to use [census|frappe|amazon]
    #[arg(short, long, default_value = "census")]
    dataset: String,

    /// Input file template, `{}` is replaced by `train` or `valid`
    #[arg(long)]
    data_dir: Option<String>,

    /// Model directory. Defaults to ./checkpoint/<dataset>_<model>
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// JSON file overriding the model parameters
    #[arg(short, long)]
    params: Option<PathBuf>,

    /// Directory the prediction file is written to
    #[arg(short, long, default_value = "./result")]
    output_dir: PathBuf,
}

#[derive(Serialize)]
struct PredictionRow {
    #[serde(rename = "")]
    index: usize,
    predict_prob: f64,
}

/// Delete the model directory. Failure is reported and otherwise ignored
fn clear_model(checkpoint_dir: &Path) {
    match fs::remove_dir_all(checkpoint_dir) {
        Err(e) => log::error!("Error! {} occured at model cleaning", e),
        Ok(()) => log::info!("{} model cleaned", checkpoint_dir.display()),
    }
}

fn build_estimator(config: &Config) -> Result<Estimator> {
    let mut rng = StdRng::seed_from_u64(config.params.seed);
    let model = model::build_model(&config.model_name, &config.model_params(), &mut rng)?;
    let optimizer = build_optimizer(config.params.optimizer, config.params.learning_rate);

    Estimator::new(
        model,
        optimizer,
        config.run_config.clone(),
        &config.checkpoint_dir,
    )
}

fn train(config: &Config) -> Result<()> {
    let train = parsing::parse_dataset(&config.data_path("train"), config.input_parser, &config.schema)?;
    let valid = parsing::parse_dataset(&config.data_path("valid"), config.input_parser, &config.schema)?;
    let mut estimator = build_estimator(config)?;
    let params = &config.params;

    let mut train_spec = TrainSpec {
        max_steps: None,
        early_stopping: Some(EarlyStopping::new(config.max_steps_without_decrease)),
    };
    let eval_spec = EvalSpec {
        steps: Some(config.eval_steps),
        throttle_secs: config.throttle_secs,
    };

    let metrics = estimator.train_and_evaluate(
        InputPipeline::new(&train, params.batch_size)
            .shuffle(params.buffer_size, params.seed)
            .repeat(params.num_epochs)
            .batches(),
        &mut train_spec,
        || InputPipeline::new(&valid, params.batch_size).batches(),
        &eval_spec,
    )?;

    log::info!(
        "Finished training at step {}: auc = {:.4}, pr = {:.4}, accuracy = {:.4}, loss = {:.6}",
        estimator.global_step(),
        metrics.auc,
        metrics.pr,
        metrics.accuracy,
        metrics.loss
    );

    Ok(())
}

/// Write one `<index>,<probability>` row per example
fn write_predictions(path: &Path, probabilities: &[f64]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;

    for (index, &predict_prob) in probabilities.iter().enumerate() {
        writer.serialize(PredictionRow { index, predict_prob })?;
    }
    writer.flush()?;

    Ok(())
}

fn predict(config: &Config, output_dir: &Path) -> Result<PathBuf> {
    let valid = parsing::parse_dataset(&config.data_path("valid"), config.input_parser, &config.schema)?;
    let estimator = build_estimator(config)?;

    if estimator.global_step() == 0 {
        log::warn!(
            "no checkpoint in {}, predicting with an untrained model",
            estimator.model_dir().display()
        );
    }

    let probabilities = estimator.predict(InputPipeline::new(&valid, config.params.batch_size).batches())?;

    fs::create_dir_all(output_dir)?;
    let path = output_dir.join(format!("prediction_{}.csv", config.model_name));
    write_predictions(&path, &probabilities)?;
    log::info!("wrote {} predictions to {}", probabilities.len(), path.display());

    Ok(path)
}

fn run(args: Args) -> Result<()> {
    let mut config = Config::new(&args.model, &args.dataset)?;

    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(checkpoint_dir) = args.checkpoint_dir {
        config.checkpoint_dir = checkpoint_dir;
    }
    if let Some(path) = &args.params {
        config.apply_json(&fs::read_to_string(path)?)?;
    }

    if args.clear_model != 0 {
        clear_model(&config.checkpoint_dir);
    }

    match args.step {
        Step::Train => train(&config),
        Step::Predict => predict(&config, &args.output_dir).map(|_| ()),
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
