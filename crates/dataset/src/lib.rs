//! Radar HAR dataset glue.
//!
//! Spectrogram exports live in one directory per class; scanning assigns
//! stable label indices by sorted class name, the split holds out every Nth
//! file per class for validation, and loading turns a sample file into the
//! `(3, H, W)` f32 tensor the classifier consumes.

pub mod folders;
pub mod loader;
pub mod split;

use std::path::PathBuf;

use thiserror::Error;

pub use folders::{normalized_name, scan_class_folders, ClassFolder, Sample};
pub use loader::{load_sample, stack_batch, FolderDataset};
pub use split::{split_samples, SplitSamples};

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("dataset root {0} contains no class directories")]
    EmptyRoot(PathBuf),
    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(PathBuf),
    #[error("sample archive {0} holds no tensors")]
    EmptyArchive(PathBuf),
    #[error("sample {path}: expected a (3, H, W) tensor, got {dims:?}")]
    BadShape { path: PathBuf, dims: Vec<usize> },
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}
