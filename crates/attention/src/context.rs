//! Global-context attention.
//!
//! A parameter-light alternative to full pairwise attention: one learned
//! softmax pooling produces a single `(B, C, 1, 1)` context vector, a
//! channel bottleneck turns it into a per-channel modulation signal, and the
//! signal is broadcast-added onto the input. No `N x N` affinity matrix is
//! ever formed.

use candle_core::{Result, Tensor, D};
use candle_nn::ops::softmax;

use layers::{checks, conv1x1_biased, ChannelLayerNorm, Conv2d, ParamScope};

pub struct GlobalContextAttention {
    mask: Conv2d,
    squeeze: Conv2d,
    norm: ChannelLayerNorm,
    expand: Conv2d,
    channels: usize,
}

impl GlobalContextAttention {
    pub fn new(channels: usize, reduction: usize, scope: &ParamScope) -> Result<Self> {
        checks::expect_positive("global_context.reduction", reduction)?;
        checks::expect_divisible("global_context.channels", channels, reduction)?;
        let inner = channels / reduction;
        Ok(Self {
            mask: conv1x1_biased(channels, 1, &scope.pp("conv_mask"))?,
            squeeze: conv1x1_biased(channels, inner, &scope.pp("transform").pp("conv1"))?,
            norm: ChannelLayerNorm::new(inner, &scope.pp("transform").pp("ln"))?,
            expand: conv1x1_biased(inner, channels, &scope.pp("transform").pp("conv2"))?,
            channels,
        })
    }

    /// Softmax pooling weights over flattened spatial positions, `(B, N)`.
    fn spatial_weights(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, _, h, w) = checks::expect_channels("global_context.input", xs, self.channels)?;
        let logits = self.mask.forward(xs)?.reshape((b, h * w))?;
        softmax(&logits, D::Minus1)
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = checks::expect_channels("global_context.input", xs, self.channels)?;
        let weights = self.spatial_weights(xs)?.reshape((b, 1, h * w, 1))?;
        let context = xs
            .reshape((b, 1, c, h * w))?
            .matmul(&weights)?
            .reshape((b, c, 1, 1))?;
        let hidden = self.norm.forward(&self.squeeze.forward(&context)?)?.relu()?;
        let modulation = self.expand.forward(&hidden)?;
        xs.broadcast_add(&modulation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use layers::{init, InitLedger};
    use std::sync::Mutex;

    fn build(channels: usize, reduction: usize) -> Result<(GlobalContextAttention, Mutex<InitLedger>)> {
        let map = VarMap::new();
        let ledger = Mutex::new(InitLedger::new());
        let scope = ParamScope::root(&map, &ledger, Device::Cpu, DType::F32);
        let block = GlobalContextAttention::new(channels, reduction, &scope.pp("att"))?;
        init::apply_protocol(&ledger.lock().unwrap(), 9)?;
        Ok((block, ledger))
    }

    #[test]
    fn output_shape_matches_input() -> Result<()> {
        let (block, _) = build(16, 4)?;
        let xs = Tensor::randn(0f32, 1.0, (2, 16, 5, 7), &Device::Cpu)?;
        let out = block.forward(&xs)?;
        assert_eq!(out.dims(), xs.dims());
        Ok(())
    }

    #[test]
    fn pooling_weights_sum_to_one_per_batch_element() -> Result<()> {
        let (block, _) = build(16, 4)?;
        let xs = Tensor::randn(0f32, 1.0, (3, 16, 6, 6), &Device::Cpu)?;
        let weights = block.spatial_weights(&xs)?;
        let sums = weights.sum(D::Minus1)?.to_vec1::<f32>()?;
        for sum in sums {
            assert!((sum - 1.0).abs() < 1e-5, "pooling weights sum {sum} != 1");
        }
        Ok(())
    }

    #[test]
    fn zeroed_norm_makes_block_identity() -> Result<()> {
        let (block, ledger) = build(16, 4)?;
        init::zero_norms_under(&ledger.lock().unwrap(), "att")?;
        let xs = Tensor::randn(0f32, 1.0, (1, 16, 4, 4), &Device::Cpu)?;
        let out = block.forward(&xs)?;
        let diff = out.sub(&xs)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-6, "attention branch leaked {diff} at init");
        Ok(())
    }

    #[test]
    fn reduction_must_divide_channels() {
        let map = VarMap::new();
        let ledger = Mutex::new(InitLedger::new());
        let scope = ParamScope::root(&map, &ledger, Device::Cpu, DType::F32);
        assert!(GlobalContextAttention::new(10, 4, &scope).is_err());
    }
}
