//! Normalization layers over `(batch, channels, height, width)` maps.
//!
//! Batch normalization keeps running statistics as named, checkpointed
//! variables that are updated in place during training forwards; evaluation
//! forwards read them without mutation, so concurrent evaluation replicas
//! can share one parameter set safely.

use candle_core::{Result, Tensor, Var};

use crate::checks;
use crate::vars::{ParamRole, ParamScope};

const BN_EPSILON: f64 = 1e-5;
const BN_MOMENTUM: f64 = 0.1;

/// Per-channel batch normalization with learnable affine parameters.
pub struct BatchNorm2d {
    weight: Tensor,
    bias: Tensor,
    running_mean: Var,
    running_var: Var,
    channels: usize,
    eps: f64,
    momentum: f64,
}

impl BatchNorm2d {
    pub fn new(channels: usize, scope: &ParamScope) -> Result<Self> {
        checks::expect_positive("batch_norm.channels", channels)?;
        let weight = scope.var("weight", channels, ParamRole::NormScale)?;
        let bias = scope.var("bias", channels, ParamRole::NormShift)?;
        let running_mean = scope.var_handle("running_mean", channels, ParamRole::RunningMean)?;
        let running_var = scope.var_handle("running_var", channels, ParamRole::RunningVar)?;
        Ok(Self {
            weight,
            bias,
            running_mean,
            running_var,
            channels,
            eps: BN_EPSILON,
            momentum: BN_MOMENTUM,
        })
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (_, c, _, _) = checks::expect_channels("batch_norm.input", xs, self.channels)?;
        let (mean, var) = if train {
            let mean = xs.mean_keepdim(0)?.mean_keepdim(2)?.mean_keepdim(3)?;
            let centered = xs.broadcast_sub(&mean)?;
            let var = centered
                .sqr()?
                .mean_keepdim(0)?
                .mean_keepdim(2)?
                .mean_keepdim(3)?;
            self.update_running(&mean, &var, c)?;
            (mean, var)
        } else {
            (
                self.running_mean.as_tensor().reshape((1, c, 1, 1))?,
                self.running_var.as_tensor().reshape((1, c, 1, 1))?,
            )
        };
        let denom = (var + self.eps)?.sqrt()?;
        let normalized = xs.broadcast_sub(&mean)?.broadcast_div(&denom)?;
        normalized
            .broadcast_mul(&self.weight.reshape((1, c, 1, 1))?)?
            .broadcast_add(&self.bias.reshape((1, c, 1, 1))?)
    }

    fn update_running(&self, mean: &Tensor, var: &Tensor, channels: usize) -> Result<()> {
        let batch_mean = mean.detach().reshape(channels)?;
        let batch_var = var.detach().reshape(channels)?;
        let new_mean = ((self.running_mean.as_tensor() * (1.0 - self.momentum))?
            + (batch_mean * self.momentum)?)?;
        let new_var = ((self.running_var.as_tensor() * (1.0 - self.momentum))?
            + (batch_var * self.momentum)?)?;
        self.running_mean.set(&new_mean)?;
        self.running_var.set(&new_var)
    }
}

/// Layer normalization over the channel axis of a `(B, C, H, W)` map, the
/// flavor the global-context bottleneck applies to its `(B, C, 1, 1)`
/// context vector.
pub struct ChannelLayerNorm {
    weight: Tensor,
    bias: Tensor,
    channels: usize,
    eps: f64,
}

impl ChannelLayerNorm {
    pub fn new(channels: usize, scope: &ParamScope) -> Result<Self> {
        checks::expect_positive("layer_norm.channels", channels)?;
        let weight = scope.var("weight", channels, ParamRole::NormScale)?;
        let bias = scope.var("bias", channels, ParamRole::NormShift)?;
        Ok(Self {
            weight,
            bias,
            channels,
            eps: BN_EPSILON,
        })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_, c, _, _) = checks::expect_channels("layer_norm.input", xs, self.channels)?;
        let mean = xs.mean_keepdim(1)?.mean_keepdim(2)?.mean_keepdim(3)?;
        let centered = xs.broadcast_sub(&mean)?;
        let var = centered
            .sqr()?
            .mean_keepdim(1)?
            .mean_keepdim(2)?
            .mean_keepdim(3)?;
        let normalized = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normalized
            .broadcast_mul(&self.weight.reshape((1, c, 1, 1))?)?
            .broadcast_add(&self.bias.reshape((1, c, 1, 1))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vars::InitLedger;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use std::sync::Mutex;

    fn scope_fixture() -> (VarMap, Mutex<InitLedger>) {
        (VarMap::new(), Mutex::new(InitLedger::new()))
    }

    #[test]
    fn batch_norm_train_normalizes_per_channel() -> Result<()> {
        let (map, ledger) = scope_fixture();
        let scope = ParamScope::root(&map, &ledger, Device::Cpu, DType::F32);
        let bn = BatchNorm2d::new(2, &scope.pp("bn"))?;
        crate::init::apply_protocol(&ledger.lock().unwrap(), 7)?;

        let data: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let xs = Tensor::from_vec(data, (2, 2, 2, 2), &Device::Cpu)?;
        let out = bn.forward(&xs, true)?;

        // Per-channel mean of the output should be ~0, variance ~1.
        let mean = out.mean_keepdim(0)?.mean_keepdim(2)?.mean_keepdim(3)?;
        let mean = mean.flatten_all()?.to_vec1::<f32>()?;
        for m in mean {
            assert!(m.abs() < 1e-5, "channel mean {m} not centered");
        }
        Ok(())
    }

    #[test]
    fn batch_norm_updates_running_statistics() -> Result<()> {
        let (map, ledger) = scope_fixture();
        let scope = ParamScope::root(&map, &ledger, Device::Cpu, DType::F32);
        let bn = BatchNorm2d::new(1, &scope.pp("bn"))?;
        crate::init::apply_protocol(&ledger.lock().unwrap(), 7)?;

        let xs = Tensor::full(4.0f32, (1, 1, 2, 2), &Device::Cpu)?;
        bn.forward(&xs, true)?;

        let mean = bn.running_mean.as_tensor().to_vec1::<f32>()?;
        // momentum 0.1 over a constant-4 batch: 0.9 * 0 + 0.1 * 4
        assert!((mean[0] - 0.4).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn channel_layer_norm_preserves_shape() -> Result<()> {
        let (map, ledger) = scope_fixture();
        let scope = ParamScope::root(&map, &ledger, Device::Cpu, DType::F32);
        let ln = ChannelLayerNorm::new(4, &scope.pp("ln"))?;
        crate::init::apply_protocol(&ledger.lock().unwrap(), 7)?;

        let xs = Tensor::from_vec(
            (0..8).map(|i| i as f32).collect::<Vec<_>>(),
            (2, 4, 1, 1),
            &Device::Cpu,
        )?;
        let out = ln.forward(&xs)?;
        assert_eq!(out.dims(), xs.dims());
        Ok(())
    }
}
