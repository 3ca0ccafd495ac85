use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use crate::{config::LoggingConfig, metrics::EpochSummary, TrainingError};

#[derive(Clone, Debug, Default)]
pub struct LoggingSettings {
    pub history_file: Option<PathBuf>,
    pub log_every_n_batches: Option<usize>,
}

impl LoggingSettings {
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self {
            history_file: config.history_file.clone(),
            log_every_n_batches: config.log_every_n_batches.map(|n| n.max(1)),
        }
    }
}

/// Structured training events plus an optional CSV history of epochs.
///
/// Events go through `tracing`; the subscriber is installed by the binary.
pub struct Logger {
    settings: LoggingSettings,
    history: Option<csv::Writer<File>>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let history = match settings.history_file.as_deref() {
            Some(path) => Some(open_history(path)?),
            None => None,
        };
        Ok(Self { settings, history })
    }

    /// Logger that only emits `tracing` events.
    pub fn disabled() -> Self {
        Self {
            settings: LoggingSettings::default(),
            history: None,
        }
    }

    /// Drops history rows for epochs at or after `epoch`, which are about to
    /// be run again. Rows written after the last checkpoint would otherwise
    /// appear twice.
    pub fn rewind_history(&mut self, epoch: usize) -> Result<(), TrainingError> {
        let Some(path) = self.settings.history_file.clone() else {
            return Ok(());
        };
        if let Some(mut writer) = self.history.take() {
            writer.flush().map_err(|err| history_error(&path, err))?;
        }

        let existing = fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
        if existing {
            let mut reader = csv::Reader::from_path(&path).map_err(|err| history_error(&path, err))?;
            let mut kept = Vec::new();
            let mut dropped = 0usize;
            for row in reader.deserialize::<EpochSummary>() {
                let row = row.map_err(|err| history_error(&path, err))?;
                if row.epoch < epoch {
                    kept.push(row);
                } else {
                    dropped += 1;
                }
            }

            if dropped > 0 {
                let mut tmp = path.clone().into_os_string();
                tmp.push(".tmp");
                let tmp = PathBuf::from(tmp);
                {
                    let mut writer =
                        csv::Writer::from_path(&tmp).map_err(|err| history_error(&tmp, err))?;
                    for row in &kept {
                        writer.serialize(row).map_err(|err| history_error(&tmp, err))?;
                    }
                    writer.flush().map_err(|err| history_error(&tmp, err))?;
                }
                fs::rename(&tmp, &path).map_err(|err| history_error(&path, err))?;
                debug!(epoch, dropped, "rewound epoch history");
            }
        }

        self.history = Some(open_history(&path)?);
        Ok(())
    }

    pub fn log_resume(&self, epoch: usize, best_metric: Option<f64>, patience_counter: usize) {
        info!(
            epoch,
            best_metric = ?best_metric,
            patience_counter,
            "resuming from checkpoint"
        );
    }

    pub fn log_training_batch(&self, epoch: usize, batch: usize, loss: f64) {
        let Some(every) = self.settings.log_every_n_batches else {
            return;
        };
        if (batch + 1) % every == 0 {
            debug!(epoch, batch = batch + 1, loss, "train batch");
        }
    }

    pub fn log_epoch(&mut self, summary: &EpochSummary) {
        info!(
            epoch = summary.epoch,
            train_loss = ?summary.train_loss,
            validation_loss = summary.validation_loss,
            precision = summary.precision,
            recall = summary.recall,
            f1 = summary.f1,
            improved = summary.improved,
            "epoch complete"
        );

        if let Some(writer) = self.history.as_mut() {
            if let Err(err) = writer.serialize(summary) {
                warn!(error = %err, "failed to append epoch history");
            }
        }
    }

    pub fn log_checkpoint(&self, epoch: usize, path: &Path) {
        info!(epoch, path = %path.display(), "checkpoint saved");
    }

    pub fn log_snapshot(&self, f1: f64, path: &Path) {
        info!(f1, path = %path.display(), "new best model snapshot");
    }

    pub fn log_termination(&self, reason: &str, epochs_completed: usize, best_metric: Option<f64>) {
        info!(reason, epochs_completed, best_metric = ?best_metric, "training finished");
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.history.as_mut() {
            if let Err(err) = writer.flush() {
                warn!(error = %err, "failed to flush epoch history");
            }
        }
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.flush();
    }
}

fn history_error(path: &Path, err: impl std::fmt::Display) -> TrainingError {
    TrainingError::initialization(format!(
        "failed to rewrite history file {}: {err}",
        path.display()
    ))
}

fn open_history(path: &Path) -> Result<csv::Writer<File>, TrainingError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to create history directory {}: {err}",
                parent.display()
            ))
        })?;
    }
    // Appending after a resume keeps a single header row.
    let write_header = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| {
            TrainingError::initialization(format!(
                "failed to open history file {}: {err}",
                path.display()
            ))
        })?;
    Ok(csv::WriterBuilder::new()
        .has_headers(write_header)
        .from_writer(file))
}
