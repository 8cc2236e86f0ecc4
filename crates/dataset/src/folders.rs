//! Class-folder scanning.

use std::fs;
use std::path::{Path, PathBuf};

use crate::DatasetError;

const SAMPLE_EXTENSIONS: [&str; 2] = ["npy", "safetensors"];

/// One class directory: its (normalized) name, stable label index, and the
/// sorted list of sample files it holds.
#[derive(Debug, Clone)]
pub struct ClassFolder {
    pub name: String,
    pub label: u32,
    pub files: Vec<PathBuf>,
}

/// A single labeled sample file.
#[derive(Debug, Clone)]
pub struct Sample {
    pub path: PathBuf,
    pub label: u32,
}

/// Spaces in exported file or class names are normalized to underscores, as
/// the original dataset preparation did.
pub fn normalized_name(name: &str) -> String {
    name.replace(' ', "_")
}

/// Scans `root` for class directories. Classes are sorted lexicographically
/// so label indices stay stable across runs; files are sorted within each
/// class for the same reason.
pub fn scan_class_folders(root: &Path) -> Result<Vec<ClassFolder>, DatasetError> {
    let read_dir = |path: &Path| {
        fs::read_dir(path).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })
    };

    let mut class_dirs = Vec::new();
    for entry in read_dir(root)? {
        let entry = entry.map_err(|source| DatasetError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        if entry.path().is_dir() {
            class_dirs.push(entry.path());
        }
    }
    class_dirs.sort();
    if class_dirs.is_empty() {
        return Err(DatasetError::EmptyRoot(root.to_path_buf()));
    }

    let mut folders = Vec::with_capacity(class_dirs.len());
    for (label, dir) in class_dirs.iter().enumerate() {
        let mut files = Vec::new();
        for entry in read_dir(dir)? {
            let entry = entry.map_err(|source| DatasetError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            let supported = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| SAMPLE_EXTENSIONS.contains(&ext));
            if path.is_file() && supported {
                files.push(path);
            }
        }
        files.sort();
        let name = dir
            .file_name()
            .map(|name| normalized_name(&name.to_string_lossy()))
            .unwrap_or_default();
        folders.push(ClassFolder {
            name,
            label: label as u32,
            files,
        });
    }
    Ok(folders)
}
