use std::fs;

use anyhow::Result;
use candle_core::{DType, Device};
use datasets::{BertPreprocessor, Dataset, SnliDataset, SnliRecord};
use model::{ClassifierConfig, Network, SequenceClassifier};
use tempfile::tempdir;
use tokenizers::Tokenizer;
use training::{
    checkpoint, AdamConfig, AdamOptimizer, CheckpointSettings, CrossEntropyLoss, DatasetLoader,
    LoaderOptions, Logger, LoggingSettings, Termination, Trainer, TrainerSettings,
};

const TOKENIZER_JSON: &str = r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [],
  "normalizer": {"type": "Lowercase"},
  "pre_tokenizer": {"type": "Whitespace"},
  "post_processor": null,
  "decoder": null,
  "model": {
    "type": "WordLevel",
    "vocab": {
      "[PAD]": 0, "[UNK]": 1, "[CLS]": 2, "[SEP]": 3,
      "a": 4, "dog": 5, "cat": 6, "runs": 7, "sleeps": 8, "is": 9,
      "moving": 10, "still": 11, "the": 12, "outside": 13, ".": 14
    },
    "unk_token": "[UNK]"
  }
}"#;

const MAX_LEN: usize = 12;

fn records() -> Vec<SnliRecord> {
    let rows = [
        ("A dog runs outside.", "The dog is moving.", "entailment"),
        ("A cat sleeps.", "The cat is moving.", "contradiction"),
        ("A dog sleeps.", "The dog is outside.", "neutral"),
        ("A cat runs.", "The cat is moving.", "entailment"),
        ("A dog runs.", "The dog is still.", "contradiction"),
        ("A cat sleeps outside.", "A zebra is still.", "neutral"),
    ];
    rows.iter()
        .map(|(premise, hypothesis, label)| SnliRecord {
            premise: premise.to_string(),
            hypothesis: hypothesis.to_string(),
            label: label.to_string(),
        })
        .collect()
}

#[test]
fn trains_snapshots_and_resumes_sequence_classifier() -> Result<()> {
    let workdir = tempdir()?;
    let tokenizer_path = workdir.path().join("tokenizer.json");
    fs::write(&tokenizer_path, TOKENIZER_JSON)?;
    let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(anyhow::Error::msg)?;
    let preprocessor = BertPreprocessor::new(&tokenizer, MAX_LEN)?;

    let dataset = SnliDataset::from_records(records());
    let mapper = dataset.label_mapper().clone();
    let options = LoaderOptions {
        batch_size: 4,
        shuffle_seed: Some(3),
        device: Device::Cpu,
    };
    let mut train = DatasetLoader::new(&dataset, &preprocessor, options.clone())?;
    let mut validation = DatasetLoader::new(
        &dataset,
        &preprocessor,
        LoaderOptions {
            shuffle_seed: None,
            ..options
        },
    )?;

    let model_dir = workdir.path().join("model");
    let checkpoint_dir = workdir.path().join("checkpoints");
    let history = workdir.path().join("history.csv");
    let settings = |epochs| TrainerSettings {
        model_dir: model_dir.clone(),
        epochs,
        early_stopping_patience: 10,
        checkpoint: Some(CheckpointSettings {
            directory: checkpoint_dir.clone(),
            every_n_epochs: 1,
        }),
        accumulation_steps: 2,
    };
    let logger = || {
        Logger::new(LoggingSettings {
            history_file: Some(history.clone()),
            log_every_n_batches: Some(1),
        })
    };
    let classifier = || {
        SequenceClassifier::new(ClassifierConfig {
            vocab_size: 15,
            hidden_dim: 16,
            max_seq_len: MAX_LEN,
            num_classes: mapper.num_classes(),
            pad_token_id: 0,
            dropout_p: Some(0.1),
            freeze_encoder: false,
            dtype: DType::F32,
            device: Device::Cpu,
        })
    };

    let network = classifier()?;
    let mut optimizer = AdamOptimizer::new(
        network.trainable_parameters(),
        AdamConfig {
            learning_rate: 1e-2,
            ..AdamConfig::default()
        },
    )?;
    let mut trainer = Trainer::new(settings(2), logger()?)?;
    let outcome = trainer.run_train(
        &mut train,
        &mut validation,
        network,
        &CrossEntropyLoss::new(),
        &mut optimizer,
        mapper.positive_label_index(),
    )?;
    drop(trainer);

    assert_eq!(outcome.termination, Termination::EpochBudgetExhausted);
    assert_eq!(outcome.epochs_completed, 2);
    assert!(outcome.history.iter().all(|e| e.validation_loss.is_finite()));
    assert!(model_dir.join(checkpoint::BEST_MODEL_FILENAME).is_file());
    assert!(checkpoint_dir.join(checkpoint::MANIFEST_FILENAME).is_file());

    let network = classifier()?;
    let mut optimizer = AdamOptimizer::new(
        network.trainable_parameters(),
        AdamConfig::default(),
    )?;
    let mut resumed = Trainer::new(settings(3), logger()?)?;
    assert_eq!(resumed.epoch(), 2);
    let outcome = resumed.run_train(
        &mut train,
        &mut validation,
        network,
        &CrossEntropyLoss::new(),
        &mut optimizer,
        mapper.positive_label_index(),
    )?;
    drop(resumed);

    assert_eq!(outcome.epochs_completed, 1);
    assert_eq!(outcome.history[0].epoch, 2);

    let rows = fs::read_to_string(&history)?;
    assert_eq!(rows.lines().count(), 4);
    Ok(())
}
