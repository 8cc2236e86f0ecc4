//! Seed-driven weight initialization.
//!
//! The whole network is constructed with zero-filled parameters first; the
//! protocol below then walks the [`InitLedger`] in creation order and fills
//! each parameter according to its role, drawing from a single seeded RNG.
//! Two networks built from the same configuration and seed therefore end up
//! with bit-identical parameters. The device RNG is deliberately not used:
//! candle's CPU backend cannot be seeded, and reproducibility is part of the
//! construction contract.

use candle_core::{DType, Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::vars::{InitLedger, ParamRole};

/// Stateful sampler over a seeded RNG.
pub struct Initializer {
    rng: StdRng,
}

impl Initializer {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Variance-scaling (fan-in aware) normal init for convolution kernels.
    pub fn kaiming_normal(
        &mut self,
        shape: &[usize],
        fan_in: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Tensor> {
        let std = (2.0 / fan_in.max(1) as f64).sqrt();
        let normal = Normal::new(0.0, std).map_err(candle_core::Error::wrap)?;
        let count: usize = shape.iter().product();
        let data: Vec<f32> = (0..count)
            .map(|_| normal.sample(&mut self.rng) as f32)
            .collect();
        Tensor::from_vec(data, shape, device)?.to_dtype(dtype)
    }

    /// Glorot/Xavier uniform init for dense projections.
    pub fn xavier_uniform(
        &mut self,
        shape: &[usize],
        fan_in: usize,
        fan_out: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Tensor> {
        let bound = (6.0 / (fan_in + fan_out).max(1) as f64).sqrt();
        let count: usize = shape.iter().product();
        let data: Vec<f32> = (0..count)
            .map(|_| self.rng.gen_range(-bound..bound) as f32)
            .collect();
        Tensor::from_vec(data, shape, device)?.to_dtype(dtype)
    }
}

/// Applies the default initialization protocol to every registered
/// parameter: Kaiming-normal convolutions, Xavier-uniform projections,
/// unit norm scales, zero shifts and biases, (0, 1) running statistics.
pub fn apply_protocol(ledger: &InitLedger, seed: u64) -> Result<()> {
    let mut init = Initializer::from_seed(seed);
    for entry in ledger.entries() {
        let tensor = entry.var.as_tensor();
        let shape = tensor.dims().to_vec();
        let device = tensor.device().clone();
        let dtype = tensor.dtype();
        match entry.role {
            ParamRole::ConvWeight { fan_in } => {
                entry
                    .var
                    .set(&init.kaiming_normal(&shape, fan_in, &device, dtype)?)?;
            }
            ParamRole::LinearWeight { fan_in, fan_out } => {
                entry
                    .var
                    .set(&init.xavier_uniform(&shape, fan_in, fan_out, &device, dtype)?)?;
            }
            ParamRole::Bias | ParamRole::NormShift | ParamRole::RunningMean => {
                entry.var.set(&Tensor::zeros(shape, dtype, &device)?)?;
            }
            ParamRole::NormScale | ParamRole::RunningVar => {
                entry.var.set(&Tensor::ones(shape, dtype, &device)?)?;
            }
        }
    }
    Ok(())
}

/// Re-zeroes every normalization scale and shift under `prefix`, leaving the
/// owning branch an exact no-op until training moves it off zero.
pub fn zero_norms_under(ledger: &InitLedger, prefix: &str) -> Result<()> {
    for entry in ledger.entries_under(prefix) {
        if matches!(entry.role, ParamRole::NormScale | ParamRole::NormShift) {
            let tensor = entry.var.as_tensor();
            entry.var.set(&Tensor::zeros(
                tensor.dims().to_vec(),
                tensor.dtype(),
                tensor.device(),
            )?)?;
        }
    }
    Ok(())
}

/// Re-zeroes the normalization scales directly under `prefix` (the
/// zero-init-residual treatment of a unit's final norm).
pub fn zero_scale_under(ledger: &InitLedger, prefix: &str) -> Result<()> {
    for entry in ledger.entries_under(prefix) {
        if matches!(entry.role, ParamRole::NormScale) {
            let tensor = entry.var.as_tensor();
            entry.var.set(&Tensor::zeros(
                tensor.dims().to_vec(),
                tensor.dtype(),
                tensor.device(),
            )?)?;
        }
    }
    Ok(())
}
