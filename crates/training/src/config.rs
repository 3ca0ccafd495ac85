use datasets::Task;
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};
use tokenizers::Tokenizer;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub task: Task,
    #[serde(default)]
    pub model: ModelConfig,
    pub tokenizer: TokenizerConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub loss: LossConfig,
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.model.hidden_size == 0 {
            errors.push("model.hidden_size must be greater than 0".to_string());
        }

        if let Some(vocab_size) = self.model.vocab_size {
            if vocab_size == 0 {
                errors.push("model.vocab_size must be greater than 0".to_string());
            }
        }

        if !(0.0..1.0).contains(&self.model.dropout) {
            errors.push(format!(
                "model.dropout must be in [0, 1) (got {})",
                self.model.dropout
            ));
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if self.data.gradient_accumulation_steps == 0 {
            errors.push("data.gradient_accumulation_steps must be greater than 0".to_string());
        }

        if self.data.max_seq_len < datasets::preprocess::MIN_SEQ_LEN {
            errors.push(format!(
                "data.max_seq_len must be at least {}",
                datasets::preprocess::MIN_SEQ_LEN
            ));
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if self.optimizer.epsilon <= 0.0 {
            errors.push("optimizer.epsilon must be greater than 0".to_string());
        }

        if !(0.0..1.0).contains(&self.loss.label_smoothing) {
            errors.push(format!(
                "loss.label_smoothing must be in [0, 1) (got {})",
                self.loss.label_smoothing
            ));
        }

        if self.runtime.epochs == 0 {
            errors.push("runtime.epochs must be greater than 0".to_string());
        }

        if self.runtime.early_stopping_patience == 0 {
            errors.push("runtime.early_stopping_patience must be greater than 0".to_string());
        }

        if let Some(checkpoint) = &self.runtime.checkpoint {
            if checkpoint.every_n_epochs == 0 {
                errors.push("runtime.checkpoint.every_n_epochs must be greater than 0".to_string());
            }
        }

        if let Some(every) = self.runtime.logging.log_every_n_batches {
            if every == 0 {
                errors.push("runtime.logging.log_every_n_batches must be greater than 0".to_string());
            }
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.tokenizer.apply_base_path(base);
        self.data.apply_base_path(base);
        self.runtime.apply_base_path(base);
    }

    /// Loads the tokenizer file named by `[tokenizer]`.
    pub fn load_tokenizer(&self) -> Result<Tokenizer, TrainingError> {
        let path = &self.tokenizer.tokenizer_json;
        Tokenizer::from_file(path).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to load tokenizer json {}: {}",
                path.display(),
                err
            ))
        })
    }

    /// Vocabulary size from the config, falling back to the tokenizer's.
    pub fn resolve_vocab_size(&self, tokenizer: &Tokenizer) -> usize {
        self.model
            .vocab_size
            .unwrap_or_else(|| tokenizer.get_vocab_size(true))
    }

    /// Fails fast when input files named by the config are missing.
    pub fn ensure_prerequisites(&self) -> Result<(), TrainingError> {
        let mut missing = Vec::new();
        for path in [
            &self.tokenizer.tokenizer_json,
            &self.data.train_file,
            &self.data.validation_file,
        ] {
            if !path.is_file() {
                missing.push(path.display().to_string());
            }
        }

        if !missing.is_empty() {
            return Err(TrainingError::initialization(format!(
                "missing required artifacts: {}",
                missing.join(", ")
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default)]
    pub vocab_size: Option<usize>,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    /// Train only the classification head.
    #[serde(default)]
    pub freeze_encoder: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_size: default_hidden_size(),
            vocab_size: None,
            dropout: default_dropout(),
            freeze_encoder: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizerConfig {
    pub tokenizer_json: PathBuf,
}

impl TokenizerConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.tokenizer_json, base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub train_file: PathBuf,
    pub validation_file: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_gradient_accumulation_steps")]
    pub gradient_accumulation_steps: usize,
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
    #[serde(default = "default_seed")]
    pub shuffle_seed: u64,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.train_file, base);
        absolutize_in_place(&mut self.validation_file, base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub algorithm: OptimizerType,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: OptimizerType::default(),
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    #[default]
    Adam,
    #[serde(rename = "adamw")]
    AdamW,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LossConfig {
    /// Weight moved from the target class to a uniform distribution.
    #[serde(default)]
    pub label_smoothing: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub model_dir: PathBuf,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_patience")]
    pub early_stopping_patience: usize,
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.model_dir, base);
        if let Some(checkpoint) = self.checkpoint.as_mut() {
            checkpoint.apply_base_path(base);
        }
        if let Some(history) = self.logging.history_file.as_mut() {
            absolutize_in_place(history, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub directory: PathBuf,
    #[serde(default = "default_checkpoint_frequency")]
    pub every_n_epochs: usize,
}

impl CheckpointConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.directory, base);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// CSV file receiving one row per completed epoch.
    #[serde(default)]
    pub history_file: Option<PathBuf>,
    #[serde(default)]
    pub log_every_n_batches: Option<usize>,
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_hidden_size() -> usize {
    128
}

fn default_dropout() -> f32 {
    0.1
}

fn default_batch_size() -> usize {
    32
}

fn default_gradient_accumulation_steps() -> usize {
    1
}

fn default_max_seq_len() -> usize {
    256
}

fn default_seed() -> u64 {
    42
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_epochs() -> usize {
    10
}

fn default_patience() -> usize {
    10
}

fn default_checkpoint_frequency() -> usize {
    1
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Checkpoint(String),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "failed to read config: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Checkpoint(msg) => write!(f, "checkpoint error: {}", msg),
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::ConfigFormat(_) | TrainingError::Validation(_) => None,
            TrainingError::Initialization(_)
            | TrainingError::Checkpoint(_)
            | TrainingError::Runtime(_) => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<datasets::Error> for TrainingError {
    fn from(value: datasets::Error) -> Self {
        TrainingError::Initialization(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MINIMAL: &str = r#"
task = "snli"

[tokenizer]
tokenizer_json = "artifacts/tokenizer.json"

[data]
train_file = "data/train.json"
validation_file = "data/validation.json"

[runtime]
model_dir = "out/model"

[runtime.checkpoint]
directory = "out/checkpoints"
"#;

    #[test]
    fn loads_toml_with_defaults_and_resolves_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("train.toml");
        fs::write(&path, MINIMAL).unwrap();

        let config = TrainingConfig::from_path(&path).unwrap();

        assert_eq!(config.task, Task::Snli);
        assert_eq!(config.data.batch_size, 32);
        assert_eq!(config.data.max_seq_len, 256);
        assert_eq!(config.runtime.epochs, 10);
        assert_eq!(config.runtime.early_stopping_patience, 10);
        assert_eq!(config.optimizer.algorithm, OptimizerType::Adam);
        assert_eq!(config.optimizer.learning_rate, 1e-4);
        assert_eq!(config.loss.label_smoothing, 0.0);
        assert_eq!(config.runtime.model_dir, dir.path().join("out/model"));
        let checkpoint = config.runtime.checkpoint.unwrap();
        assert_eq!(checkpoint.directory, dir.path().join("out/checkpoints"));
        assert_eq!(checkpoint.every_n_epochs, 1);
    }

    #[test]
    fn json_and_toml_are_equivalent() {
        let dir = tempdir().unwrap();
        let toml_path = dir.path().join("train.toml");
        fs::write(&toml_path, MINIMAL).unwrap();
        let from_toml = TrainingConfig::from_path(&toml_path).unwrap();

        let json_path = dir.path().join("train.json");
        fs::write(&json_path, serde_json::to_string(&from_toml).unwrap()).unwrap();
        let from_json = TrainingConfig::from_path(&json_path).unwrap();

        assert_eq!(from_json.runtime.model_dir, from_toml.runtime.model_dir);
        assert_eq!(from_json.data.train_file, from_toml.data.train_file);
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        config.data.batch_size = 0;
        config.runtime.early_stopping_patience = 0;
        config.data.max_seq_len = 3;
        config.loss.label_smoothing = 1.0;

        let err = config.validate().unwrap_err();
        let TrainingError::Validation(messages) = err else {
            panic!("expected validation error, got {err}");
        };
        assert_eq!(messages.len(), 4);
        assert!(messages.iter().any(|m| m.starts_with("loss.label_smoothing")));
    }

    #[test]
    fn reads_label_smoothing_section() {
        let text = format!("{MINIMAL}\n[loss]\nlabel_smoothing = 0.1\n");
        let config: TrainingConfig = toml::from_str(&text).unwrap();

        assert!((config.loss.label_smoothing - 0.1).abs() < 1e-6);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("train.yaml");
        fs::write(&path, MINIMAL).unwrap();

        assert!(matches!(
            TrainingConfig::from_path(&path),
            Err(TrainingError::ConfigFormat(_))
        ));
    }
}
