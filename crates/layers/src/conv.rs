//! Convolution wrappers with named parameters and shape validation.

use candle_core::{Result, Tensor};

use crate::checks;
use crate::vars::{ParamRole, ParamScope};

/// Static configuration of a 2D convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dConfig {
    pub stride: usize,
    pub padding: usize,
    pub dilation: usize,
    pub groups: usize,
    pub bias: bool,
}

impl Default for Conv2dConfig {
    fn default() -> Self {
        Self {
            stride: 1,
            padding: 0,
            dilation: 1,
            groups: 1,
            bias: false,
        }
    }
}

/// 2D convolution over `(batch, channels, height, width)` feature maps.
#[derive(Clone)]
pub struct Conv2d {
    weight: Tensor,
    bias: Option<Tensor>,
    in_channels: usize,
    out_channels: usize,
    config: Conv2dConfig,
}

impl Conv2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        config: Conv2dConfig,
        scope: &ParamScope,
    ) -> Result<Self> {
        checks::expect_positive("conv2d.in_channels", in_channels)?;
        checks::expect_positive("conv2d.out_channels", out_channels)?;
        checks::expect_divisible("conv2d.in_channels", in_channels, config.groups)?;
        checks::expect_divisible("conv2d.out_channels", out_channels, config.groups)?;
        let (kh, kw) = kernel;
        let fan_in = in_channels / config.groups * kh * kw;
        let weight = scope.var(
            "weight",
            (out_channels, in_channels / config.groups, kh, kw),
            ParamRole::ConvWeight { fan_in },
        )?;
        let bias = if config.bias {
            Some(scope.var("bias", out_channels, ParamRole::Bias)?)
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            in_channels,
            out_channels,
            config,
        })
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        checks::expect_channels("conv2d.input", xs, self.in_channels)?;
        let out = xs.conv2d(
            &self.weight,
            self.config.padding,
            self.config.stride,
            self.config.dilation,
            self.config.groups,
        )?;
        match &self.bias {
            Some(bias) => out.broadcast_add(&bias.reshape((1, self.out_channels, 1, 1))?),
            None => Ok(out),
        }
    }
}

/// 3x3 convolution with padding, no bias.
pub fn conv3x3(
    in_channels: usize,
    out_channels: usize,
    stride: usize,
    groups: usize,
    dilation: usize,
    scope: &ParamScope,
) -> Result<Conv2d> {
    Conv2d::new(
        in_channels,
        out_channels,
        (3, 3),
        Conv2dConfig {
            stride,
            padding: dilation,
            dilation,
            groups,
            bias: false,
        },
        scope,
    )
}

/// 1x1 convolution, no bias.
pub fn conv1x1(
    in_channels: usize,
    out_channels: usize,
    stride: usize,
    scope: &ParamScope,
) -> Result<Conv2d> {
    Conv2d::new(
        in_channels,
        out_channels,
        (1, 1),
        Conv2dConfig {
            stride,
            ..Default::default()
        },
        scope,
    )
}

/// 1x1 convolution with bias, the projection flavor attention blocks use.
pub fn conv1x1_biased(
    in_channels: usize,
    out_channels: usize,
    scope: &ParamScope,
) -> Result<Conv2d> {
    Conv2d::new(
        in_channels,
        out_channels,
        (1, 1),
        Conv2dConfig {
            bias: true,
            ..Default::default()
        },
        scope,
    )
}
