//! Lightweight validation helpers shared across layer components.
//!
//! These routines provide concise shape assertions that can be wired into
//! constructors or forward paths. They return `candle_core::Result<()>` so
//! call sites can propagate errors without panicking. Construction-time
//! validation is expected to make the forward-time variants unreachable for
//! correctly configured networks.

use candle_core::{Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(label: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected shape {expected:?}, got {actual:?}"
        )))
    }
}

/// Validates the `(batch, channels, height, width)` convention and returns
/// the unpacked dimensions.
pub fn expect_feature_map(label: &str, tensor: &Tensor) -> Result<(usize, usize, usize, usize)> {
    match tensor.dims() {
        [b, c, h, w] => Ok((*b, *c, *h, *w)),
        dims => Err(Error::Msg(format!(
            "{label}: expected (batch, channels, height, width) layout, got {dims:?}"
        ))),
    }
}

/// Validates a feature map with a known channel count.
pub fn expect_channels(
    label: &str,
    tensor: &Tensor,
    channels: usize,
) -> Result<(usize, usize, usize, usize)> {
    let (b, c, h, w) = expect_feature_map(label, tensor)?;
    if c != channels {
        return Err(Error::Msg(format!(
            "{label}: expected {channels} channels, got {c} (shape {:?})",
            tensor.dims()
        )));
    }
    Ok((b, c, h, w))
}

/// Configuration-time divisibility requirement.
pub fn expect_divisible(label: &str, value: usize, by: usize) -> Result<()> {
    if by == 0 || value % by != 0 {
        Err(Error::Msg(format!(
            "{label}: {value} must be divisible by {by}"
        )))
    } else {
        Ok(())
    }
}

/// Configuration-time positivity requirement.
pub fn expect_positive(label: &str, value: usize) -> Result<()> {
    if value == 0 {
        Err(Error::Msg(format!("{label} must be greater than zero")))
    } else {
        Ok(())
    }
}
