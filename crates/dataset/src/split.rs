//! Deterministic train/validation split.

use crate::folders::{ClassFolder, Sample};

/// The two halves of a split, flattened across classes.
#[derive(Debug, Default)]
pub struct SplitSamples {
    pub train: Vec<Sample>,
    pub validation: Vec<Sample>,
}

/// Holds out every `holdout_every`-th file of each class for validation
/// (file index 0, N, 2N, ... per class), everything else for training. The
/// assignment depends only on the sorted file order, never on file content,
/// so repeated runs see the same split.
pub fn split_samples(folders: &[ClassFolder], holdout_every: usize) -> SplitSamples {
    let mut split = SplitSamples::default();
    for folder in folders {
        for (index, path) in folder.files.iter().enumerate() {
            let sample = Sample {
                path: path.clone(),
                label: folder.label,
            };
            if holdout_every > 0 && index % holdout_every == 0 {
                split.validation.push(sample);
            } else {
                split.train.push(sample);
            }
        }
    }
    split
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn folder(label: u32, count: usize) -> ClassFolder {
        ClassFolder {
            name: format!("class{label}"),
            label,
            files: (0..count)
                .map(|i| PathBuf::from(format!("class{label}/{i:03}.npy")))
                .collect(),
        }
    }

    #[test]
    fn every_fifth_file_is_held_out() {
        let folders = vec![folder(0, 10), folder(1, 7)];
        let split = split_samples(&folders, 5);
        // class 0: indices 0 and 5; class 1: indices 0 and 5.
        assert_eq!(split.validation.len(), 4);
        assert_eq!(split.train.len(), 13);
        assert!(split
            .validation
            .iter()
            .any(|s| s.path.ends_with("class0/005.npy")));
    }

    #[test]
    fn zero_period_keeps_everything_in_train() {
        let folders = vec![folder(0, 4)];
        let split = split_samples(&folders, 0);
        assert!(split.validation.is_empty());
        assert_eq!(split.train.len(), 4);
    }
}
