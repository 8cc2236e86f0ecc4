//! Pooling helpers.
//!
//! candle's pooling primitives take no padding argument, so the stem's padded
//! max-pool zero-pads explicitly first; its inputs are post-ReLU and
//! non-negative, which keeps zero padding equivalent to ignore-padding.

use candle_core::{Result, Tensor, D};

use crate::checks;

/// Global average pooling: `(B, C, H, W)` -> `(B, C)`.
pub fn global_avg_pool(xs: &Tensor) -> Result<Tensor> {
    checks::expect_feature_map("avg_pool.input", xs)?;
    xs.mean(D::Minus1)?.mean(D::Minus1)
}

/// 3x3 stride-2 max pool with padding 1, as used after the stem convolution.
pub fn stem_max_pool(xs: &Tensor) -> Result<Tensor> {
    checks::expect_feature_map("max_pool.input", xs)?;
    xs.pad_with_zeros(2, 1, 1)?
        .pad_with_zeros(3, 1, 1)?
        .max_pool2d_with_stride(3, 2)
}

/// Adaptive max pooling down to `(rows, 1)`: every row descriptor is the max
/// over an `H/rows`-tall horizontal band. Requires `H % rows == 0`.
pub fn row_max_pool(xs: &Tensor, rows: usize) -> Result<Tensor> {
    let (_, _, h, w) = checks::expect_feature_map("row_pool.input", xs)?;
    checks::expect_divisible("row_pool.height", h, rows)?;
    xs.max_pool2d_with_stride((h / rows, w), (h / rows, w))
}

/// Adaptive max pooling down to `(1, cols)`. Requires `W % cols == 0`.
pub fn col_max_pool(xs: &Tensor, cols: usize) -> Result<Tensor> {
    let (_, _, h, w) = checks::expect_feature_map("col_pool.input", xs)?;
    checks::expect_divisible("col_pool.width", w, cols)?;
    xs.max_pool2d_with_stride((h, w / cols), (h, w / cols))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn row_and_col_pools_reduce_to_descriptors() -> Result<()> {
        let xs = Tensor::from_vec(
            (0..32).map(|i| i as f32).collect::<Vec<_>>(),
            (1, 2, 4, 4),
            &Device::Cpu,
        )?;
        let rows = row_max_pool(&xs, 2)?;
        assert_eq!(rows.dims(), &[1, 2, 2, 1]);
        let cols = col_max_pool(&xs, 2)?;
        assert_eq!(cols.dims(), &[1, 2, 1, 2]);
        // The first row descriptor is the max over the top two rows.
        let values = rows.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(values[0], 7.0);
        Ok(())
    }

    #[test]
    fn row_pool_rejects_non_divisible_height() {
        let xs = Tensor::zeros((1, 1, 5, 5), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(row_max_pool(&xs, 2).is_err());
    }

    #[test]
    fn global_pool_shape() -> Result<()> {
        let xs = Tensor::zeros((2, 3, 7, 7), candle_core::DType::F32, &Device::Cpu)?;
        assert_eq!(global_avg_pool(&xs)?.dims(), &[2, 3]);
        Ok(())
    }
}
