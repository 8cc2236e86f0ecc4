//! Spatial non-local attention.
//!
//! Every position aggregates information from every other position through a
//! learned pairwise affinity matrix, following the video-non-local design:
//! query/key/value projections at half width, a softmax over the key axis,
//! and a projection back onto the residual path.

use candle_core::{Result, Tensor, D};
use candle_nn::ops::softmax;

use layers::{checks, conv1x1_biased, BatchNorm2d, Conv2d, ParamScope};

pub struct NonLocalAttention {
    t: Conv2d,
    p: Conv2d,
    g: Conv2d,
    z: Conv2d,
    norm: BatchNorm2d,
    channels: usize,
    inner: usize,
    scaled: bool,
}

impl NonLocalAttention {
    pub fn new(channels: usize, scaled: bool, scope: &ParamScope) -> Result<Self> {
        checks::expect_divisible("non_local.channels", channels, 2)?;
        let inner = channels / 2;
        Ok(Self {
            t: conv1x1_biased(channels, inner, &scope.pp("t"))?,
            p: conv1x1_biased(channels, inner, &scope.pp("p"))?,
            g: conv1x1_biased(channels, inner, &scope.pp("g"))?,
            z: conv1x1_biased(inner, channels, &scope.pp("z"))?,
            norm: BatchNorm2d::new(channels, &scope.pp("bn"))?,
            channels,
            inner,
            scaled,
        })
    }

    /// The `(B, N, N)` pairwise affinity matrix, softmax-normalized over the
    /// key axis. Exposed separately so its normalization is testable.
    fn affinity(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, _, h, w) = checks::expect_channels("non_local.input", xs, self.channels)?;
        let n = h * w;
        let queries = self
            .t
            .forward(xs)?
            .reshape((b, self.inner, n))?
            .transpose(1, 2)?
            .contiguous()?;
        let keys = self.p.forward(xs)?.reshape((b, self.inner, n))?;
        let mut affinity = queries.matmul(&keys)?;
        if self.scaled {
            affinity = (affinity / (self.inner as f64).sqrt())?;
        }
        softmax(&affinity, D::Minus1)
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (b, _, h, w) = checks::expect_channels("non_local.input", xs, self.channels)?;
        let affinity = self.affinity(xs)?;
        let values = self
            .g
            .forward(xs)?
            .reshape((b, self.inner, h * w))?
            .transpose(1, 2)?
            .contiguous()?;
        let mixed = affinity
            .matmul(&values)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, self.inner, h, w))?;
        let projected = self.z.forward(&mixed)?;
        self.norm.forward(&projected, train)?.add(xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use layers::{init, InitLedger};
    use std::sync::Mutex;

    fn build(channels: usize, scaled: bool) -> Result<(NonLocalAttention, Mutex<InitLedger>)> {
        let map = VarMap::new();
        let ledger = Mutex::new(InitLedger::new());
        let scope = ParamScope::root(&map, &ledger, Device::Cpu, DType::F32);
        let block = NonLocalAttention::new(channels, scaled, &scope.pp("att"))?;
        init::apply_protocol(&ledger.lock().unwrap(), 3)?;
        Ok((block, ledger))
    }

    #[test]
    fn output_shape_matches_input() -> Result<()> {
        let (block, _) = build(8, true)?;
        let xs = Tensor::randn(0f32, 1.0, (2, 8, 6, 6), &Device::Cpu)?;
        let out = block.forward(&xs, false)?;
        assert_eq!(out.dims(), xs.dims());
        Ok(())
    }

    #[test]
    fn affinity_rows_sum_to_one() -> Result<()> {
        let (block, _) = build(8, true)?;
        let xs = Tensor::randn(0f32, 1.0, (2, 8, 5, 5), &Device::Cpu)?;
        let affinity = block.affinity(&xs)?;
        let sums = affinity.sum(D::Minus1)?.flatten_all()?.to_vec1::<f32>()?;
        for sum in sums {
            assert!((sum - 1.0).abs() < 1e-5, "row sum {sum} != 1");
        }
        Ok(())
    }

    #[test]
    fn zeroed_norm_makes_block_identity() -> Result<()> {
        let (block, ledger) = build(8, true)?;
        init::zero_norms_under(&ledger.lock().unwrap(), "att")?;
        let xs = Tensor::randn(0f32, 1.0, (1, 8, 4, 4), &Device::Cpu)?;
        let out = block.forward(&xs, false)?;
        let diff = out.sub(&xs)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-6, "attention branch leaked {diff} at init");
        Ok(())
    }

    #[test]
    fn odd_channel_width_is_a_configuration_error() {
        let map = VarMap::new();
        let ledger = Mutex::new(InitLedger::new());
        let scope = ParamScope::root(&map, &ledger, Device::Cpu, DType::F32);
        assert!(NonLocalAttention::new(7, true, &scope).is_err());
    }
}
