//! Validation-set evaluation.

use candle_core::D;
use dataset::{stack_batch, FolderDataset};
use model::NonLocalNet;
use serde::Serialize;

use crate::config::TrainingError;

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationSummary {
    pub samples: usize,
    pub correct: usize,
    pub accuracy: f64,
    pub average_loss: f64,
}

/// Runs the network over `dataset` in evaluation mode and aggregates
/// accuracy and mean cross-entropy loss.
pub fn evaluate(
    network: &NonLocalNet,
    dataset: &FolderDataset,
    batch_size: usize,
) -> Result<EvaluationSummary, TrainingError> {
    if batch_size == 0 {
        return Err(TrainingError::initialization(
            "evaluation batch size must be greater than zero",
        ));
    }

    let indices: Vec<usize> = (0..dataset.len()).collect();
    let mut correct = 0usize;
    let mut loss_sum = 0f64;
    for chunk in indices.chunks(batch_size) {
        let (images, labels) = stack_batch(dataset, chunk)?;
        let logits = network.forward(&images, false)?;
        let loss = candle_nn::loss::cross_entropy(&logits, &labels)?;
        loss_sum += f64::from(loss.to_vec0::<f32>()?) * chunk.len() as f64;

        let predictions = logits.argmax(D::Minus1)?.to_vec1::<u32>()?;
        let truth = labels.to_vec1::<u32>()?;
        correct += predictions
            .iter()
            .zip(truth.iter())
            .filter(|(p, t)| p == t)
            .count();
    }

    let samples = dataset.len();
    Ok(EvaluationSummary {
        samples,
        correct,
        accuracy: if samples == 0 {
            0.0
        } else {
            correct as f64 / samples as f64
        },
        average_loss: if samples == 0 {
            0.0
        } else {
            loss_sum / samples as f64
        },
    })
}
