//! Checkpoint I/O.
//!
//! A checkpoint directory holds the full parameter set by name in
//! `model.safetensors` plus a `manifest.json` with checksum records, so a
//! restore can verify what it is about to load and fail with a precise
//! message instead of silently evaluating the wrong weights. Because
//! parameter names are scoped per stage, checkpoints stay loadable across
//! structural edits to unrelated stages.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::safetensors::load as load_safetensors;
use hex::encode as hex_encode;
use model::NonLocalNet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{RunConfig, TrainingError};

pub const CHECKPOINT_VERSION: u32 = 1;
const MODEL_FILENAME: &str = "model.safetensors";
const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub num_classes: usize,
    pub model: FileRecord,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

/// Serializes the network's parameter set and manifest into `directory`.
pub fn save_checkpoint(
    directory: &Path,
    network: &NonLocalNet,
    config: &RunConfig,
) -> Result<CheckpointDescriptor, TrainingError> {
    fs::create_dir_all(directory).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            directory.display()
        ))
    })?;

    let named_parameters = network.parameters();
    if named_parameters.is_empty() {
        return Err(TrainingError::runtime(
            "network contains no parameters to checkpoint",
        ));
    }
    let mut tensors = HashMap::with_capacity(named_parameters.len());
    for (name, var) in named_parameters {
        tensors.insert(name, var.as_tensor().clone());
    }

    let model_path = directory.join(MODEL_FILENAME);
    candle_core::safetensors::save(&tensors, &model_path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize parameters to {}: {err}",
            model_path.display()
        ))
    })?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        config_sha256: fingerprint_config(config)?,
        num_classes: network.config().num_classes,
        model: file_record(&model_path)?,
    };
    write_json(&directory.join(MANIFEST_FILENAME), &manifest)?;

    Ok(CheckpointDescriptor {
        directory: directory.to_path_buf(),
        manifest,
    })
}

/// Verifies a checkpoint and copies its parameters into `network` by name.
/// Missing and unused entries are both reported as errors.
pub fn load_checkpoint(
    directory: &Path,
    network: &NonLocalNet,
) -> Result<CheckpointManifest, TrainingError> {
    let manifest: CheckpointManifest = read_json(&directory.join(MANIFEST_FILENAME))?;
    if manifest.version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {} (expected {CHECKPOINT_VERSION})",
            manifest.version
        )));
    }

    let model_path = directory.join(&manifest.model.filename);
    let actual_sha = sha256_file(&model_path)?;
    if actual_sha != manifest.model.sha256 {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            model_path.display()
        )));
    }

    let device = network.config().device.clone();
    let tensors = load_safetensors(&model_path, &device)
        .map_err(|err| TrainingError::runtime(err.to_string()))?;
    let mut by_name: HashMap<_, _> = tensors.into_iter().collect();

    for (name, var) in network.parameters() {
        let tensor = by_name
            .remove(&name)
            .ok_or_else(|| TrainingError::runtime(format!("checkpoint missing parameter {name}")))?;
        let tensor = if tensor.dtype() == var.as_tensor().dtype() {
            tensor
        } else {
            tensor
                .to_dtype(var.as_tensor().dtype())
                .map_err(|err| TrainingError::runtime(err.to_string()))?
        };
        var.set(&tensor)
            .map_err(|err| TrainingError::runtime(format!("parameter {name}: {err}")))?;
    }

    if !by_name.is_empty() {
        let mut extra: Vec<String> = by_name.into_keys().collect();
        extra.sort();
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }

    Ok(manifest)
}

/// SHA-256 fingerprint of the serialized run configuration.
pub fn fingerprint_config(config: &RunConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256,
        bytes,
    })
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path)
        .map_err(|err| TrainingError::runtime(format!("failed to open {}: {err}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
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
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data)
        .and_then(|_| file.write_all(b"\n"))
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path)
        .map_err(|err| TrainingError::runtime(format!("failed to open {}: {err}", path.display())))?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}
