//! Sample loading and batch stacking.

use std::path::Path;

use candle_core::{DType, Device, Tensor};

use crate::folders::Sample;
use crate::DatasetError;

/// Loads one exported spectrogram into a `(3, H, W)` f32 tensor.
///
/// `.npy` files hold the tensor directly; `.safetensors` archives are
/// expected to hold a single tensor (the first entry is taken when the
/// exporter wrote several).
pub fn load_sample(path: &Path) -> Result<Tensor, DatasetError> {
    let extension = path.extension().and_then(|ext| ext.to_str());
    let tensor = match extension {
        Some("npy") => Tensor::read_npy(path)?,
        Some("safetensors") => {
            let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
            let mut names: Vec<String> = tensors.keys().cloned().collect();
            names.sort();
            let first = names
                .first()
                .ok_or_else(|| DatasetError::EmptyArchive(path.to_path_buf()))?;
            tensors.remove(first).expect("key taken from the map")
        }
        _ => return Err(DatasetError::UnsupportedFormat(path.to_path_buf())),
    };
    match tensor.dims() {
        [3, _, _] => Ok(tensor.to_dtype(DType::F32)?),
        dims => Err(DatasetError::BadShape {
            path: path.to_path_buf(),
            dims: dims.to_vec(),
        }),
    }
}

/// An in-memory view over one half of a split: paths plus labels, loaded
/// lazily per sample.
pub struct FolderDataset {
    samples: Vec<Sample>,
    classes: Vec<String>,
}

impl FolderDataset {
    pub fn new(samples: Vec<Sample>, classes: Vec<String>) -> Self {
        Self { samples, classes }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Loads sample `index` as an `(image, label)` pair.
    pub fn get(&self, index: usize) -> Result<(Tensor, u32), DatasetError> {
        let sample = &self.samples[index];
        Ok((load_sample(&sample.path)?, sample.label))
    }
}

/// Stacks the given samples into `(B, 3, H, W)` images and `(B,)` u32
/// labels. All samples in a batch must share one spatial size.
pub fn stack_batch(
    dataset: &FolderDataset,
    indices: &[usize],
) -> Result<(Tensor, Tensor), DatasetError> {
    let mut images = Vec::with_capacity(indices.len());
    let mut labels = Vec::with_capacity(indices.len());
    for &index in indices {
        let (image, label) = dataset.get(index)?;
        images.push(image.unsqueeze(0)?);
        labels.push(label);
    }
    let images = Tensor::cat(&images, 0)?;
    let labels = Tensor::from_vec(labels, indices.len(), &Device::Cpu)?;
    Ok((images, labels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{scan_class_folders, split_samples};
    use candle_core::Tensor;
    use tempfile::tempdir;

    fn write_npy(path: &Path, value: f32) -> anyhow::Result<()> {
        let tensor = Tensor::full(value, (3, 4, 4), &Device::Cpu)?;
        tensor.write_npy(path)?;
        Ok(())
    }

    #[test]
    fn scan_split_load_round_trip() -> anyhow::Result<()> {
        let dir = tempdir()?;
        for class in ["sit down", "walk"] {
            let class_dir = dir.path().join(class);
            std::fs::create_dir(&class_dir)?;
            for i in 0..6 {
                write_npy(&class_dir.join(format!("{i:02}.npy")), i as f32)?;
            }
        }

        let folders = scan_class_folders(dir.path())?;
        assert_eq!(folders.len(), 2);
        assert_eq!(folders[0].name, "sit_down");
        assert_eq!(folders[0].label, 0);
        assert_eq!(folders[1].name, "walk");

        let split = split_samples(&folders, 5);
        let classes: Vec<String> = folders.iter().map(|f| f.name.clone()).collect();
        let validation = FolderDataset::new(split.validation, classes);
        // 6 files per class, every 5th held out: indices 0 and 5 -> 2 each.
        assert_eq!(validation.len(), 4);

        let (image, label) = validation.get(0)?;
        assert_eq!(image.dims(), &[3, 4, 4]);
        assert_eq!(label, 0);

        let (batch, labels) = stack_batch(&validation, &[0, 1, 2, 3])?;
        assert_eq!(batch.dims(), &[4, 3, 4, 4]);
        assert_eq!(labels.dims(), &[4]);
        Ok(())
    }

    #[test]
    fn wrong_channel_count_is_rejected() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("bad.npy");
        Tensor::zeros((1, 4, 4), DType::F32, &Device::Cpu)?.write_npy(&path)?;
        assert!(matches!(
            load_sample(&path),
            Err(DatasetError::BadShape { .. })
        ));
        Ok(())
    }
}
