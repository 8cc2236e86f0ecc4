//! Squeeze-excitation channel gate.

use candle_core::{Result, Tensor};
use candle_nn::ops::sigmoid;

use crate::checks;
use crate::linear::Linear;
use crate::pooling::global_avg_pool;
use crate::vars::ParamScope;

/// Per-channel reweighting learned from a globally pooled representation of
/// the feature map: squeeze -> two projections with a ReLU/sigmoid sandwich
/// -> channel-wise rescale.
pub struct ChannelGate {
    fc1: Linear,
    fc2: Linear,
    channels: usize,
}

impl ChannelGate {
    pub fn new(channels: usize, reduction: usize, scope: &ParamScope) -> Result<Self> {
        checks::expect_divisible("channel_gate.channels", channels, reduction)?;
        let fc1 = Linear::new(channels, channels / reduction, &scope.pp("fc1"))?;
        let fc2 = Linear::new(channels / reduction, channels, &scope.pp("fc2"))?;
        Ok(Self {
            fc1,
            fc2,
            channels,
        })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, c, _, _) = checks::expect_channels("channel_gate.input", xs, self.channels)?;
        let squeezed = global_avg_pool(xs)?;
        let excitation = self.fc1.forward(&squeezed)?.relu()?;
        let excitation = sigmoid(&self.fc2.forward(&excitation)?)?;
        xs.broadcast_mul(&excitation.reshape((b, c, 1, 1))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vars::InitLedger;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use std::sync::Mutex;

    #[test]
    fn gate_preserves_shape_and_bounds_scaling() -> Result<()> {
        let map = VarMap::new();
        let ledger = Mutex::new(InitLedger::new());
        let scope = ParamScope::root(&map, &ledger, Device::Cpu, DType::F32);
        let gate = ChannelGate::new(8, 4, &scope.pp("gate"))?;
        crate::init::apply_protocol(&ledger.lock().unwrap(), 11)?;

        let xs = Tensor::ones((2, 8, 3, 3), DType::F32, &Device::Cpu)?;
        let out = gate.forward(&xs)?;
        assert_eq!(out.dims(), xs.dims());
        // Sigmoid gating can only attenuate an all-ones input.
        let max = out.max_all()?.to_vec0::<f32>()?;
        assert!(max <= 1.0 + 1e-6);
        Ok(())
    }
}
