use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use candle_core::{DType, Tensor, D};
use model::{Network, ParameterState};

use crate::{
    checkpoint::{self, CheckpointState},
    data::BatchSource,
    logging::Logger,
    loss::LossFunction,
    metrics::{EpochSummary, EvaluationMetrics, EvaluationSummary, RunningMean},
    optimizer::{GradientAccumulator, Optimizer},
    TrainingConfig, TrainingError,
};

/// Fixed run configuration for a [`Trainer`].
#[derive(Debug, Clone)]
pub struct TrainerSettings {
    pub model_dir: PathBuf,
    pub epochs: usize,
    pub early_stopping_patience: usize,
    pub checkpoint: Option<CheckpointSettings>,
    pub accumulation_steps: usize,
}

#[derive(Debug, Clone)]
pub struct CheckpointSettings {
    pub directory: PathBuf,
    pub every_n_epochs: usize,
}

impl TrainerSettings {
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            model_dir: config.runtime.model_dir.clone(),
            epochs: config.runtime.epochs,
            early_stopping_patience: config.runtime.early_stopping_patience,
            checkpoint: config
                .runtime
                .checkpoint
                .as_ref()
                .map(|checkpoint| CheckpointSettings {
                    directory: checkpoint.directory.clone(),
                    every_n_epochs: checkpoint.every_n_epochs,
                }),
            accumulation_steps: config.data.gradient_accumulation_steps,
        }
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.epochs == 0 {
            errors.push("epochs must be greater than 0".to_string());
        }
        if self.early_stopping_patience == 0 {
            errors.push("early_stopping_patience must be greater than 0".to_string());
        }
        if self.accumulation_steps == 0 {
            errors.push("accumulation_steps must be greater than 0".to_string());
        }
        if let Some(checkpoint) = &self.checkpoint {
            if checkpoint.every_n_epochs == 0 {
                errors.push("checkpoint frequency must be greater than 0".to_string());
            }
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }
        Ok(())
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    EarlyStopped,
    EpochBudgetExhausted,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::EarlyStopped => f.write_str("early_stopped"),
            Termination::EpochBudgetExhausted => f.write_str("epoch_budget_exhausted"),
        }
    }
}

/// Result of [`Trainer::run_train`]. `network` holds the last epoch's
/// parameters; the best ones are in the model directory snapshot.
pub struct TrainingOutcome<N> {
    pub network: N,
    pub termination: Termination,
    pub epochs_completed: usize,
    pub best_metric: Option<f64>,
    pub history: Vec<EpochSummary>,
}

/// Epoch loop with validation, best-model tracking, checkpoint recovery and
/// early stopping.
pub struct Trainer {
    settings: TrainerSettings,
    logger: Logger,
    epoch: usize,
    best_metric: Option<f64>,
    patience_counter: usize,
    resumed_parameters: Option<ParameterState>,
}

impl Trainer {
    /// Validates `settings`, prepares output directories and restores the
    /// checkpoint slot when one exists.
    pub fn new(settings: TrainerSettings, logger: Logger) -> Result<Self, TrainingError> {
        settings.validate()?;
        prepare_directory(&settings.model_dir)?;
        if let Some(checkpoint) = &settings.checkpoint {
            prepare_directory(&checkpoint.directory)?;
        }

        let mut trainer = Self {
            settings,
            logger,
            epoch: 0,
            best_metric: None,
            patience_counter: 0,
            resumed_parameters: None,
        };

        if let Some(state) = trainer.load_checkpoint_state()? {
            trainer
                .logger
                .log_resume(state.epoch, state.best_metric, state.patience_counter);
            trainer.epoch = state.epoch;
            trainer.best_metric = state.best_metric;
            trainer.patience_counter = state.patience_counter;
            trainer.resumed_parameters = Some(state.parameters);
        }
        trainer.logger.rewind_history(trainer.epoch)?;

        Ok(trainer)
    }

    /// Index of the next epoch to run.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn best_metric(&self) -> Option<f64> {
        self.best_metric
    }

    pub fn patience_counter(&self) -> usize {
        self.patience_counter
    }

    /// Parameter state from the checkpoint slot, if any.
    pub fn try_load_statedict_from_checkpoint(
        &self,
    ) -> Result<Option<ParameterState>, TrainingError> {
        Ok(self.load_checkpoint_state()?.map(|state| state.parameters))
    }

    /// Overwrites the checkpoint slot. Does nothing when checkpointing is off.
    pub fn create_checkpoint(
        &self,
        epoch: usize,
        best_metric: Option<f64>,
        patience_counter: usize,
        state: &ParameterState,
    ) -> Result<Option<PathBuf>, TrainingError> {
        let Some(settings) = &self.settings.checkpoint else {
            return Ok(None);
        };
        let path = checkpoint::save_checkpoint(
            &settings.directory,
            epoch,
            best_metric,
            patience_counter,
            state,
        )?;
        self.logger.log_checkpoint(epoch, &path);
        Ok(Some(path))
    }

    /// Overwrites the best-model snapshot in the model directory.
    pub fn snapshot(&self, state: &ParameterState) -> Result<PathBuf, TrainingError> {
        checkpoint::save_snapshot(&self.settings.model_dir, state)
    }

    /// Trains `network` until the epoch budget runs out or validation F1 for
    /// `positive_label` stops improving for `early_stopping_patience` epochs.
    pub fn run_train<N, L, O, T, V>(
        &mut self,
        train: &mut T,
        validation: &mut V,
        network: N,
        loss: &L,
        optimizer: &mut O,
        positive_label: usize,
    ) -> Result<TrainingOutcome<N>, TrainingError>
    where
        N: Network,
        L: LossFunction + ?Sized,
        O: Optimizer + ?Sized,
        T: BatchSource + ?Sized,
        V: BatchSource + ?Sized,
    {
        let num_classes = network.num_classes();
        if positive_label >= num_classes {
            return Err(TrainingError::validation(vec![format!(
                "positive label index {positive_label} must be below num_classes ({num_classes})"
            )]));
        }

        if let Some(state) = self.resumed_parameters.take() {
            network.load_state(&state).map_err(|err| {
                TrainingError::checkpoint(format!("failed to restore parameters: {err}"))
            })?;
        }

        let trainable = network
            .trainable_parameters()
            .into_iter()
            .map(|(_, var)| var.as_tensor().clone())
            .collect::<Vec<_>>();
        let mut history = Vec::new();

        let termination = loop {
            if self.patience_counter >= self.settings.early_stopping_patience {
                break Termination::EarlyStopped;
            }
            if self.epoch >= self.settings.epochs {
                break Termination::EpochBudgetExhausted;
            }

            let epoch = self.epoch;
            let train_loss = self.train_epoch(
                epoch,
                train,
                &network,
                loss,
                optimizer,
                GradientAccumulator::new(trainable.clone()),
            )?;
            let evaluation = self.evaluate(epoch, validation, &network, loss, positive_label)?;

            let improved = match self.best_metric {
                Some(best) => evaluation.f1 > best,
                None => true,
            };
            if improved {
                self.best_metric = Some(evaluation.f1);
                self.patience_counter = 0;
                let path = self.snapshot(&network.state().map_err(to_runtime_error)?)?;
                self.logger.log_snapshot(evaluation.f1, &path);
            } else {
                self.patience_counter += 1;
            }
            self.epoch += 1;

            if let Some(settings) = &self.settings.checkpoint {
                if epoch % settings.every_n_epochs == 0 {
                    let state = network.state().map_err(to_runtime_error)?;
                    self.create_checkpoint(
                        self.epoch,
                        self.best_metric,
                        self.patience_counter,
                        &state,
                    )?;
                }
            }

            let summary = EpochSummary {
                epoch,
                train_loss,
                validation_loss: evaluation.average_loss,
                precision: evaluation.precision,
                recall: evaluation.recall,
                f1: evaluation.f1,
                improved,
            };
            self.logger.log_epoch(&summary);
            history.push(summary);
        };

        self.logger.log_termination(
            &termination.to_string(),
            history.len(),
            self.best_metric,
        );
        self.logger.flush();

        Ok(TrainingOutcome {
            network,
            termination,
            epochs_completed: history.len(),
            best_metric: self.best_metric,
            history,
        })
    }

    fn train_epoch<N, L, O, T>(
        &self,
        epoch: usize,
        source: &mut T,
        network: &N,
        loss_fn: &L,
        optimizer: &mut O,
        mut accumulator: GradientAccumulator,
    ) -> Result<Option<f64>, TrainingError>
    where
        N: Network,
        L: LossFunction + ?Sized,
        O: Optimizer + ?Sized,
        T: BatchSource + ?Sized,
    {
        let accumulation = self.settings.accumulation_steps;
        let mut mean_loss = RunningMean::default();

        for (index, batch) in source.iter_epoch(epoch)?.enumerate() {
            let batch = batch?.to_device(network.device())?;
            let output = network
                .forward(&batch.inputs, true)
                .map_err(to_runtime_error)?;
            let loss = loss_fn.compute(&output.logits, &batch.labels)?;
            let value = scalar(&loss)?;
            mean_loss.update(value);
            self.logger.log_training_batch(epoch, index, value);

            let grads = loss
                .affine(1.0 / accumulation as f64, 0.0)
                .map_err(to_runtime_error)?
                .backward()
                .map_err(to_runtime_error)?;
            accumulator.accumulate(grads)?;

            if accumulator.pending() == accumulation {
                accumulator.flush(optimizer)?;
            }
        }
        // A partial trailing group still gets its update.
        accumulator.flush(optimizer)?;

        Ok(mean_loss.value())
    }

    fn evaluate<N, L, V>(
        &self,
        epoch: usize,
        source: &mut V,
        network: &N,
        loss_fn: &L,
        positive_label: usize,
    ) -> Result<EvaluationSummary, TrainingError>
    where
        N: Network,
        L: LossFunction + ?Sized,
        V: BatchSource + ?Sized,
    {
        let mut metrics = EvaluationMetrics::default();

        for batch in source.iter_epoch(epoch)? {
            let batch = batch?.to_device(network.device())?;
            let logits = network
                .forward(&batch.inputs, false)
                .map_err(to_runtime_error)?
                .logits
                .detach();
            let loss = scalar(&loss_fn.compute(&logits, &batch.labels)?)?;
            let predictions = logits
                .argmax(D::Minus1)
                .and_then(|p| p.to_dtype(DType::U32))
                .and_then(|p| p.to_vec1::<u32>())
                .map_err(to_runtime_error)?;
            let labels = batch
                .labels
                .to_dtype(DType::U32)
                .and_then(|l| l.to_vec1::<u32>())
                .map_err(to_runtime_error)?;
            if predictions.len() != labels.len() {
                return Err(TrainingError::runtime(format!(
                    "validation produced {} predictions for {} labels",
                    predictions.len(),
                    labels.len()
                )));
            }
            metrics.update(loss, &predictions, &labels, positive_label as u32);
        }

        metrics
            .finalize()
            .ok_or_else(|| TrainingError::runtime("validation source produced no batches"))
    }

    fn load_checkpoint_state(&self) -> Result<Option<CheckpointState>, TrainingError> {
        match &self.settings.checkpoint {
            Some(settings) => checkpoint::load_checkpoint(&settings.directory),
            None => Ok(None),
        }
    }
}

fn prepare_directory(path: &Path) -> Result<(), TrainingError> {
    if path.exists() && !path.is_dir() {
        return Err(TrainingError::initialization(format!(
            "{} exists and is not a directory",
            path.display()
        )));
    }
    fs::create_dir_all(path).map_err(|err| {
        TrainingError::initialization(format!(
            "failed to create directory {}: {err}",
            path.display()
        ))
    })
}

fn scalar(loss: &Tensor) -> Result<f64, TrainingError> {
    loss.to_dtype(DType::F64)
        .and_then(|value| value.to_vec0::<f64>())
        .map_err(|err| TrainingError::runtime(format!("loss must be a scalar tensor: {err}")))
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
