//! Bilinear attention transform.
//!
//! A two-stage bottleneck around a spatial bilinear transform: reduce the
//! channel width by `reduction`, mix rows and columns of the reduced map
//! with a pair of grid-sized attention matrices, expand back, and add the
//! result onto the input. The row and column maps are sigmoid-activated and
//! L1-normalized along their summation axes, a doubly-stochastic-like
//! normalization rather than a softmax.

use candle_core::{Result, Tensor};
use candle_nn::ops::{dropout, sigmoid};

use layers::{
    checks, conv1x1_biased, pooling, BatchNorm2d, Conv2d, Conv2dConfig, ParamScope,
};

/// 1x1 convolution + batch norm + ReLU, the projection sandwich both the
/// outer bottleneck and the inner transform use.
struct ConvNormAct {
    conv: Conv2d,
    norm: BatchNorm2d,
}

impl ConvNormAct {
    fn new(in_channels: usize, out_channels: usize, scope: &ParamScope) -> Result<Self> {
        Ok(Self {
            conv: conv1x1_biased(in_channels, out_channels, &scope.pp("conv"))?,
            norm: BatchNorm2d::new(out_channels, &scope.pp("bn"))?,
        })
    }

    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.norm.forward(&self.conv.forward(xs)?, train)?.relu()
    }
}

/// The inner bilinear transform over an already-reduced feature map.
pub struct BaTransform {
    embed: ConvNormAct,
    conv_p: Conv2d,
    conv_q: Conv2d,
    out: ConvNormAct,
    channels: usize,
    grid: usize,
    heads: usize,
}

impl BaTransform {
    pub fn new(channels: usize, grid: usize, heads: usize, scope: &ParamScope) -> Result<Self> {
        checks::expect_positive("bat.grid", grid)?;
        checks::expect_positive("bat.heads", heads)?;
        checks::expect_divisible("bat.channels", channels, heads)?;
        let embed = ConvNormAct::new(channels, heads, &scope.pp("conv1"))?;
        let directional = Conv2dConfig {
            bias: true,
            ..Default::default()
        };
        let conv_p = Conv2d::new(
            heads,
            grid * grid * heads,
            (grid, 1),
            directional,
            &scope.pp("conv_p"),
        )?;
        let conv_q = Conv2d::new(
            heads,
            grid * grid * heads,
            (1, grid),
            directional,
            &scope.pp("conv_q"),
        )?;
        let out = ConvNormAct::new(channels, channels, &scope.pp("conv2"))?;
        Ok(Self {
            embed,
            conv_p,
            conv_q,
            out,
            channels,
            grid,
            heads,
        })
    }

    /// Row and column attention maps, both `(B, heads, grid, grid)`.
    /// Each row of the row map sums to one along the last axis; each column
    /// of the column map sums to one along the penultimate axis.
    fn attention_maps(&self, xs: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let (b, _, _, _) = checks::expect_channels("bat.transform.input", xs, self.channels)?;
        let embedded = self.embed.forward(xs, train)?;
        let rows = pooling::row_max_pool(&embedded, self.grid)?;
        let cols = pooling::col_max_pool(&embedded, self.grid)?;
        let p = self
            .conv_p
            .forward(&rows)?
            .reshape((b, self.heads, self.grid, self.grid))?;
        let q = self
            .conv_q
            .forward(&cols)?
            .reshape((b, self.heads, self.grid, self.grid))?;
        let p = sigmoid(&p)?;
        let q = sigmoid(&q)?;
        let p = p.broadcast_div(&p.sum_keepdim(3)?)?;
        let q = q.broadcast_div(&q.sum_keepdim(2)?)?;
        Ok((p, q))
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (_, c, h, w) = checks::expect_channels("bat.transform.input", xs, self.channels)?;
        checks::expect_divisible("bat.transform.height", h, self.grid)?;
        checks::expect_divisible("bat.transform.width", w, self.grid)?;
        let (p, q) = self.attention_maps(xs, train)?;
        let p = spread_heads(&p, c)?;
        let q = spread_heads(&q, c)?;
        let p = tile_block_diagonal(&p, h / self.grid)?;
        let q = tile_block_diagonal(&q, w / self.grid)?;
        let mixed = p.matmul(&xs.contiguous()?)?.matmul(&q)?;
        self.out.forward(&mixed, train)
    }
}

/// Broadcasts `heads` attention maps across `channels / heads` channels per
/// head: `(B, k, s, s)` -> `(B, C, s, s)`.
fn spread_heads(maps: &Tensor, channels: usize) -> Result<Tensor> {
    let (b, heads, s, s2) = maps.dims4()?;
    maps.unsqueeze(2)?
        .expand((b, heads, channels / heads, s, s2))?
        .contiguous()?
        .reshape((b, channels, s, s2))
}

/// Block-diagonal replication of a grid-sized matrix up to full spatial
/// resolution: the Kronecker product of each `(s, s)` map with an identity
/// of side `tile`, giving `(B, C, s*tile, s*tile)`.
fn tile_block_diagonal(maps: &Tensor, tile: usize) -> Result<Tensor> {
    if tile <= 1 {
        return Ok(maps.clone());
    }
    let (b, c, s, _) = maps.dims4()?;
    let mut eye = vec![0f32; tile * tile];
    for i in 0..tile {
        eye[i * tile + i] = 1.0;
    }
    let eye = Tensor::from_vec(eye, (tile, tile), maps.device())?
        .to_dtype(maps.dtype())?
        .reshape((1, 1, 1, tile, 1, tile))?;
    maps.reshape((b, c, s, 1, s, 1))?
        .broadcast_mul(&eye)?
        .reshape((b, c, s * tile, s * tile))
}

/// The full BAT block: reduce, transform, expand, dropout, residual add.
pub struct BilinearAttentionTransform {
    reduce: ConvNormAct,
    transform: BaTransform,
    expand: ConvNormAct,
    dropout: f32,
    channels: usize,
}

impl BilinearAttentionTransform {
    pub fn new(
        channels: usize,
        reduction: usize,
        grid: usize,
        heads: usize,
        dropout: f32,
        scope: &ParamScope,
    ) -> Result<Self> {
        checks::expect_positive("bat.reduction", reduction)?;
        checks::expect_divisible("bat.channels", channels, reduction)?;
        if !(0.0..1.0).contains(&dropout) {
            return Err(candle_core::Error::Msg(format!(
                "bat.dropout must be in [0, 1), got {dropout}"
            )));
        }
        let inter = channels / reduction;
        Ok(Self {
            reduce: ConvNormAct::new(channels, inter, &scope.pp("conv1"))?,
            transform: BaTransform::new(inter, grid, heads, &scope.pp("transform"))?,
            expand: ConvNormAct::new(inter, channels, &scope.pp("conv2"))?,
            dropout,
            channels,
        })
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_channels("bat.input", xs, self.channels)?;
        let reduced = self.reduce.forward(xs, train)?;
        let transformed = self.transform.forward(&reduced, train)?;
        let expanded = self.expand.forward(&transformed, train)?;
        let refined = if train && self.dropout > 0.0 {
            dropout(&expanded, self.dropout)?
        } else {
            expanded
        };
        refined.add(xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use layers::{init, InitLedger};
    use std::sync::Mutex;

    fn build(
        channels: usize,
        reduction: usize,
        grid: usize,
        heads: usize,
    ) -> Result<(BilinearAttentionTransform, Mutex<InitLedger>)> {
        let map = VarMap::new();
        let ledger = Mutex::new(InitLedger::new());
        let scope = ParamScope::root(&map, &ledger, Device::Cpu, DType::F32);
        let block =
            BilinearAttentionTransform::new(channels, reduction, grid, heads, 0.2, &scope.pp("att"))?;
        init::apply_protocol(&ledger.lock().unwrap(), 5)?;
        Ok((block, ledger))
    }

    #[test]
    fn output_shape_matches_input() -> Result<()> {
        let (block, _) = build(16, 2, 4, 4)?;
        let xs = Tensor::randn(0f32, 1.0, (2, 16, 8, 8), &Device::Cpu)?;
        let out = block.forward(&xs, false)?;
        assert_eq!(out.dims(), xs.dims());
        Ok(())
    }

    #[test]
    fn attention_maps_are_row_and_column_stochastic() -> Result<()> {
        let (block, _) = build(16, 2, 4, 4)?;
        let xs = Tensor::randn(0f32, 1.0, (2, 8, 8, 8), &Device::Cpu)?;
        let (p, q) = block.transform.attention_maps(&xs, false)?;

        let row_sums = p.sum(3)?.flatten_all()?.to_vec1::<f32>()?;
        for sum in row_sums {
            assert!((sum - 1.0).abs() < 1e-5, "row map sum {sum} != 1");
        }
        let col_sums = q.sum(2)?.flatten_all()?.to_vec1::<f32>()?;
        for sum in col_sums {
            assert!((sum - 1.0).abs() < 1e-5, "column map sum {sum} != 1");
        }
        Ok(())
    }

    #[test]
    fn tiling_builds_block_diagonal_structure() -> Result<()> {
        let maps = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], (1, 1, 2, 2), &Device::Cpu)?;
        let tiled = tile_block_diagonal(&maps, 2)?;
        assert_eq!(tiled.dims(), &[1, 1, 4, 4]);
        let values = tiled.flatten_all()?.to_vec1::<f32>()?;
        // Each source entry becomes a scaled 2x2 identity block.
        #[rustfmt::skip]
        let expected = [
            1.0, 0.0, 2.0, 0.0,
            0.0, 1.0, 0.0, 2.0,
            3.0, 0.0, 4.0, 0.0,
            0.0, 3.0, 0.0, 4.0,
        ];
        assert_eq!(values, expected);
        Ok(())
    }

    #[test]
    fn zeroed_norms_make_block_identity() -> Result<()> {
        let (block, ledger) = build(16, 2, 4, 4)?;
        init::zero_norms_under(&ledger.lock().unwrap(), "att")?;
        let xs = Tensor::randn(0f32, 1.0, (1, 16, 4, 4), &Device::Cpu)?;
        let out = block.forward(&xs, false)?;
        let diff = out.sub(&xs)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-6, "attention branch leaked {diff} at init");
        Ok(())
    }

    #[test]
    fn non_divisible_spatial_size_fails_fast() -> Result<()> {
        let (block, _) = build(16, 2, 4, 4)?;
        let xs = Tensor::randn(0f32, 1.0, (1, 16, 6, 6), &Device::Cpu)?;
        assert!(block.forward(&xs, false).is_err());
        Ok(())
    }

    #[test]
    fn heads_must_divide_reduced_channels() {
        let map = VarMap::new();
        let ledger = Mutex::new(InitLedger::new());
        let scope = ParamScope::root(&map, &ledger, Device::Cpu, DType::F32);
        assert!(BilinearAttentionTransform::new(16, 2, 4, 3, 0.2, &scope).is_err());
    }
}
