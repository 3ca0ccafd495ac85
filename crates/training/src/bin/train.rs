use std::{fs, path::PathBuf, str::FromStr};

use candle_core::{DType, Device};
use clap::Parser;
use datasets::{BertPreprocessor, Preprocessor};
use model::{ClassifierConfig, Network, SequenceClassifier};
use serde_json::{Number, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use training::{
    AdamConfig, AdamOptimizer, CrossEntropyLoss, DatasetLoader, LoaderOptions, Logger,
    LoggingSettings, Optimizer, Trainer, TrainerSettings, TrainingConfig, TrainingError,
};

const LABEL_MAPPER_FILENAME: &str = "label_mapper.json";
const TOKENIZER_FILENAME: &str = "tokenizer.json";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Fine-tune a sentence classifier", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to training config file"
    )]
    config: PathBuf,

    #[arg(long, value_name = "DIR", help = "Directory for the best model and artifacts")]
    model_dir: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Directory holding the resumable checkpoint")]
    checkpoint_dir: Option<PathBuf>,

    #[arg(long, help = "Maximum number of epochs")]
    epochs: Option<usize>,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    if let Some(model_dir) = args.model_dir {
        config.runtime.model_dir = model_dir;
    }
    if let Some(directory) = args.checkpoint_dir {
        match config.runtime.checkpoint.as_mut() {
            Some(checkpoint) => checkpoint.directory = directory,
            None => {
                config.runtime.checkpoint = Some(training::config::CheckpointConfig {
                    directory,
                    every_n_epochs: 1,
                })
            }
        }
    }
    if let Some(epochs) = args.epochs {
        config.runtime.epochs = epochs;
    }
    config.validate()?;
    config.ensure_prerequisites()?;

    let device = select_device();
    let tokenizer = config.load_tokenizer()?;
    let preprocessor = BertPreprocessor::new(&tokenizer, config.data.max_seq_len)?;
    let label_mapper = config.task.label_mapper();

    let train_dataset = config.task.open(&config.data.train_file)?;
    let validation_dataset = config.task.open(&config.data.validation_file)?;
    let mut train_loader = DatasetLoader::new(
        &train_dataset,
        &preprocessor,
        LoaderOptions {
            batch_size: config.data.batch_size,
            shuffle_seed: Some(config.data.shuffle_seed),
            device: device.clone(),
        },
    )?;
    let mut validation_loader = DatasetLoader::new(
        &validation_dataset,
        &preprocessor,
        LoaderOptions {
            batch_size: config.data.batch_size,
            shuffle_seed: None,
            device: device.clone(),
        },
    )?;
    info!(
        task = %config.task,
        labels = ?label_mapper.labels(),
        positive = label_mapper.positive_label(),
        train_records = train_loader.num_records(),
        validation_records = validation_loader.num_records(),
        "datasets ready"
    );

    let network = SequenceClassifier::new(ClassifierConfig {
        vocab_size: config.resolve_vocab_size(&tokenizer),
        hidden_dim: config.model.hidden_size,
        max_seq_len: config.data.max_seq_len,
        num_classes: label_mapper.num_classes(),
        pad_token_id: preprocessor.pad_token_id(),
        dropout_p: (config.model.dropout > 0.0).then_some(config.model.dropout),
        freeze_encoder: config.model.freeze_encoder,
        dtype: DType::F32,
        device,
    })
    .map_err(|err| TrainingError::initialization(format!("failed to build network: {err}")))?;
    let mut optimizer = AdamOptimizer::new(
        network.trainable_parameters(),
        AdamConfig::from(&config.optimizer),
    )?;

    info!(
        parameters = network.trainable_parameters().len(),
        learning_rate = optimizer.learning_rate(),
        algorithm = ?config.optimizer.algorithm,
        "optimizer ready"
    );

    let loss = CrossEntropyLoss::new().with_label_smoothing(config.loss.label_smoothing)?;

    let logger = Logger::new(LoggingSettings::from_config(&config.runtime.logging))?;
    let mut trainer = Trainer::new(TrainerSettings::from_config(&config), logger)?;
    persist_artifacts(&config, &label_mapper)?;

    let outcome = trainer.run_train(
        &mut train_loader,
        &mut validation_loader,
        network,
        &loss,
        &mut optimizer,
        label_mapper.positive_label_index(),
    )?;

    info!(
        termination = %outcome.termination,
        epochs = outcome.epochs_completed,
        best_f1 = ?outcome.best_metric,
        model_dir = %config.runtime.model_dir.display(),
        "run complete"
    );
    Ok(())
}

fn select_device() -> Device {
    match Device::cuda_if_available(0) {
        Ok(device) => {
            info!(cuda = device.is_cuda(), "device selected");
            device
        }
        Err(err) => {
            warn!(error = %err, "cuda initialization failed, falling back to CPU");
            Device::Cpu
        }
    }
}

/// Saves what inference needs besides the weights: the label mapping and tokenizer.
fn persist_artifacts(
    config: &TrainingConfig,
    label_mapper: &datasets::LabelMapper,
) -> Result<(), TrainingError> {
    let model_dir = &config.runtime.model_dir;
    let mapper_path = model_dir.join(LABEL_MAPPER_FILENAME);
    let json = serde_json::to_vec_pretty(label_mapper)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize label mapper: {err}")))?;
    fs::write(&mapper_path, json).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to write {}: {err}",
            mapper_path.display()
        ))
    })?;

    let tokenizer_path = model_dir.join(TOKENIZER_FILENAME);
    if tokenizer_path != config.tokenizer.tokenizer_json {
        fs::copy(&config.tokenizer.tokenizer_json, &tokenizer_path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to copy tokenizer to {}: {err}",
                tokenizer_path.display()
            ))
        })?;
    }
    Ok(())
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        assign_at_path(&mut value, &override_arg.path, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to deserialize config after overrides: {err}"
        ))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    Value::String(trimmed.to_string())
}

fn assign_at_path(target: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments = path.split('.').collect::<Vec<_>>();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::runtime(format!(
            "invalid override path '{path}'"
        )));
    }

    let mut current = target;
    for (idx, segment) in segments.iter().enumerate() {
        if current.is_null() {
            *current = Value::Object(serde_json::Map::new());
        }
        let Some(map) = current.as_object_mut() else {
            return Err(TrainingError::runtime(format!(
                "override path segment '{}' points to non-object value",
                segment
            )));
        };
        let entry = map.entry(segment.to_string()).or_insert(Value::Null);
        if idx + 1 == segments.len() {
            *entry = new_value;
            return Ok(());
        }
        current = entry;
    }

    Ok(())
}
