use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::Device;
use hex::encode as hex_encode;
use model::ParameterState;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::TrainingError;

pub const CHECKPOINT_VERSION: u32 = 1;
pub const MANIFEST_FILENAME: &str = "checkpoint.json";
pub const BEST_MODEL_FILENAME: &str = "best_model.safetensors";
const PARAMETERS_PREFIX: &str = "parameters-";
const SAFETENSORS_EXTENSION: &str = ".safetensors";
const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    /// Completed epochs; training resumes at this epoch index.
    pub epoch: usize,
    pub best_metric: Option<f64>,
    pub patience_counter: usize,
    pub parameters: FileRecord,
}

/// Everything needed to continue an interrupted run.
#[derive(Debug, Clone)]
pub struct CheckpointState {
    pub epoch: usize,
    pub best_metric: Option<f64>,
    pub patience_counter: usize,
    pub parameters: ParameterState,
}

/// Overwrites the checkpoint slot in `directory`.
///
/// The parameters file lands first and the manifest is swapped in with a
/// rename, so a reader sees either the previous checkpoint or the new one.
pub fn save_checkpoint(
    directory: &Path,
    epoch: usize,
    best_metric: Option<f64>,
    patience_counter: usize,
    parameters: &ParameterState,
) -> Result<PathBuf, TrainingError> {
    fs::create_dir_all(directory).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to create checkpoint directory {}: {err}",
            directory.display()
        ))
    })?;

    let parameters_path = directory.join(format!(
        "{PARAMETERS_PREFIX}{epoch:06}{SAFETENSORS_EXTENSION}"
    ));
    write_parameters(parameters, &parameters_path)?;
    let parameters_record = file_record(&parameters_path)?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        epoch,
        best_metric,
        patience_counter,
        parameters: parameters_record,
    };
    let manifest_path = directory.join(MANIFEST_FILENAME);
    let tmp_path = tmp_path_for(&manifest_path);
    write_json(&tmp_path, &manifest)?;
    replace(&tmp_path, &manifest_path)?;

    prune_parameter_files(directory, &manifest.parameters.filename)?;

    Ok(manifest_path)
}

/// Reads the checkpoint slot in `directory`.
///
/// A missing directory or one without a manifest yields `None`; anything
/// present but unreadable is an error.
pub fn load_checkpoint(directory: &Path) -> Result<Option<CheckpointState>, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        let orphans = orphan_parameter_files(directory);
        if !orphans.is_empty() {
            warn!(
                directory = %directory.display(),
                files = ?orphans,
                "parameter files without a manifest; starting from scratch"
            );
        }
        return Ok(None);
    }

    let manifest: CheckpointManifest = read_json(&manifest_path)?;
    ensure_version_supported(manifest.version)?;

    let parameters_path = directory.join(&manifest.parameters.filename);
    validate_file(&parameters_path, &manifest.parameters)?;
    let parameters = ParameterState::load(&parameters_path, &Device::Cpu).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to read parameters {}: {err}",
            parameters_path.display()
        ))
    })?;

    Ok(Some(CheckpointState {
        epoch: manifest.epoch,
        best_metric: manifest.best_metric,
        patience_counter: manifest.patience_counter,
        parameters,
    }))
}

/// Overwrites the best-model snapshot in `model_dir`.
pub fn save_snapshot(model_dir: &Path, parameters: &ParameterState) -> Result<PathBuf, TrainingError> {
    fs::create_dir_all(model_dir).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to create model directory {}: {err}",
            model_dir.display()
        ))
    })?;
    let path = model_dir.join(BEST_MODEL_FILENAME);
    write_parameters(parameters, &path)?;
    Ok(path)
}

pub fn load_snapshot(model_dir: &Path, device: &Device) -> Result<ParameterState, TrainingError> {
    let path = model_dir.join(BEST_MODEL_FILENAME);
    ParameterState::load(&path, device).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to read model snapshot {}: {err}",
            path.display()
        ))
    })
}

fn write_parameters(parameters: &ParameterState, path: &Path) -> Result<(), TrainingError> {
    let tmp_path = tmp_path_for(path);
    parameters.save(&tmp_path).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to serialize parameters to {}: {err}",
            tmp_path.display()
        ))
    })?;
    replace(&tmp_path, path)
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

fn replace(from: &Path, to: &Path) -> Result<(), TrainingError> {
    fs::rename(from, to).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to move {} into place at {}: {err}",
            from.display(),
            to.display()
        ))
    })
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::checkpoint(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha,
        bytes,
    })
}

fn prune_parameter_files(directory: &Path, keep: &str) -> Result<(), TrainingError> {
    for entry in fs::read_dir(directory).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to read checkpoint directory {}: {err}",
            directory.display()
        ))
    })? {
        let entry = entry.map_err(|err| {
            TrainingError::checkpoint(format!("failed to read checkpoint entry: {err}"))
        })?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == keep
            || !name.starts_with(PARAMETERS_PREFIX)
            || !name.ends_with(SAFETENSORS_EXTENSION)
        {
            continue;
        }
        fs::remove_file(entry.path()).map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to prune stale parameters {}: {err}",
                entry.path().display()
            ))
        })?;
    }
    Ok(())
}

/// Parameter files left behind when a save stopped before its manifest landed.
fn orphan_parameter_files(directory: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(directory) else {
        return Vec::new();
    };
    let mut names = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| {
            name.starts_with(PARAMETERS_PREFIX) && name.ends_with(SAFETENSORS_EXTENSION)
        })
        .collect::<Vec<_>>();
    names.sort_unstable();
    names
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::checkpoint(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, record: &FileRecord) -> Result<(), TrainingError> {
    if !path.is_file() {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint references missing file {}",
            path.display()
        )));
    }
    let actual = sha256_file(path)?;
    if actual != record.sha256 {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::checkpoint(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::checkpoint(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data).map_err(|err| {
        TrainingError::checkpoint(format!("failed to write {}: {err}", path.display()))
    })?;
    file.write_all(b"\n").map_err(|err| {
        TrainingError::checkpoint(format!("failed to write {}: {err}", path.display()))
    })?;
    file.sync_all().map_err(|err| {
        TrainingError::checkpoint(format!("failed to sync {}: {err}", path.display()))
    })
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::checkpoint(format!("failed to parse JSON {}: {err}", path.display()))
    })
}
