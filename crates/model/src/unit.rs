//! Residual units.
//!
//! Both flavors consume `(B, Cin, H, W)` and return `(B, Cout, H', W')`. The
//! projection path is instantiated whenever the spatial stride is not 1 or
//! the channel count changes between input and output.

use candle_core::{Error, Result, Tensor};

use layers::{checks, conv1x1, conv3x3, BatchNorm2d, ChannelGate, Conv2d, ParamScope};

use crate::config::UnitKind;

/// Reduction ratio of the squeeze-excitation gate, as in the original runs.
const GATE_REDUCTION: usize = 16;

/// 1x1 projection + norm on the skip path.
pub struct Downsample {
    conv: Conv2d,
    norm: BatchNorm2d,
}

impl Downsample {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        scope: &ParamScope,
    ) -> Result<Self> {
        Ok(Self {
            conv: conv1x1(in_channels, out_channels, stride, &scope.pp("0"))?,
            norm: BatchNorm2d::new(out_channels, &scope.pp("1"))?,
        })
    }

    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.norm.forward(&self.conv.forward(xs)?, train)
    }
}

/// Two 3x3 convolutions with an identity-or-projected skip.
pub struct BasicUnit {
    conv1: Conv2d,
    bn1: BatchNorm2d,
    conv2: Conv2d,
    bn2: BatchNorm2d,
    downsample: Option<Downsample>,
    in_channels: usize,
    out_channels: usize,
}

impl BasicUnit {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        planes: usize,
        stride: usize,
        downsample: Option<Downsample>,
        groups: usize,
        base_width: usize,
        dilation: usize,
        scope: &ParamScope,
    ) -> Result<Self> {
        if groups != 1 || base_width != 64 {
            return Err(Error::Msg(
                "basic units only support groups=1 and width_per_group=64".into(),
            ));
        }
        if dilation > 1 {
            return Err(Error::Msg("basic units do not support dilation > 1".into()));
        }
        Ok(Self {
            conv1: conv3x3(in_channels, planes, stride, 1, 1, &scope.pp("conv1"))?,
            bn1: BatchNorm2d::new(planes, &scope.pp("bn1"))?,
            conv2: conv3x3(planes, planes, 1, 1, 1, &scope.pp("conv2"))?,
            bn2: BatchNorm2d::new(planes, &scope.pp("bn2"))?,
            downsample,
            in_channels,
            out_channels: planes,
        })
    }

    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_channels("basic_unit.input", xs, self.in_channels)?;
        let mut out = self.bn1.forward(&self.conv1.forward(xs)?, train)?.relu()?;
        out = self.bn2.forward(&self.conv2.forward(&out)?, train)?;
        let identity = match &self.downsample {
            Some(projection) => projection.forward(xs, train)?,
            None => xs.clone(),
        };
        out.add(&identity)?.relu()
    }
}

/// 1x1 -> 3x3 -> 1x1 with expansion factor 4; stride, groups and dilation
/// apply only to the middle convolution. Channel gating, when enabled, runs
/// before the skip addition.
pub struct BottleneckUnit {
    conv1: Conv2d,
    bn1: BatchNorm2d,
    conv2: Conv2d,
    bn2: BatchNorm2d,
    conv3: Conv2d,
    bn3: BatchNorm2d,
    gate: Option<ChannelGate>,
    downsample: Option<Downsample>,
    in_channels: usize,
    out_channels: usize,
}

impl BottleneckUnit {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        planes: usize,
        stride: usize,
        downsample: Option<Downsample>,
        groups: usize,
        base_width: usize,
        dilation: usize,
        use_gate: bool,
        scope: &ParamScope,
    ) -> Result<Self> {
        checks::expect_divisible("bottleneck.width", planes * base_width, 64)?;
        let width = planes * base_width / 64 * groups;
        let out_channels = planes * UnitKind::Bottleneck.expansion();
        let gate = if use_gate {
            Some(ChannelGate::new(out_channels, GATE_REDUCTION, &scope.pp("se"))?)
        } else {
            None
        };
        Ok(Self {
            conv1: conv1x1(in_channels, width, 1, &scope.pp("conv1"))?,
            bn1: BatchNorm2d::new(width, &scope.pp("bn1"))?,
            conv2: conv3x3(width, width, stride, groups, dilation, &scope.pp("conv2"))?,
            bn2: BatchNorm2d::new(width, &scope.pp("bn2"))?,
            conv3: conv1x1(width, out_channels, 1, &scope.pp("conv3"))?,
            bn3: BatchNorm2d::new(out_channels, &scope.pp("bn3"))?,
            gate,
            downsample,
            in_channels,
            out_channels,
        })
    }

    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_channels("bottleneck_unit.input", xs, self.in_channels)?;
        let mut out = self.bn1.forward(&self.conv1.forward(xs)?, train)?.relu()?;
        out = self.bn2.forward(&self.conv2.forward(&out)?, train)?.relu()?;
        out = self.bn3.forward(&self.conv3.forward(&out)?, train)?;
        if let Some(gate) = &self.gate {
            out = gate.forward(&out)?;
        }
        let identity = match &self.downsample {
            Some(projection) => projection.forward(xs, train)?,
            None => xs.clone(),
        };
        out.add(&identity)?.relu()
    }
}

/// A residual unit of either flavor.
pub enum ResidualUnit {
    Basic(BasicUnit),
    Bottleneck(BottleneckUnit),
}

impl ResidualUnit {
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        kind: UnitKind,
        in_channels: usize,
        planes: usize,
        stride: usize,
        downsample: Option<Downsample>,
        groups: usize,
        base_width: usize,
        dilation: usize,
        use_gate: bool,
        scope: &ParamScope,
    ) -> Result<Self> {
        match kind {
            UnitKind::Basic => Ok(Self::Basic(BasicUnit::new(
                in_channels,
                planes,
                stride,
                downsample,
                groups,
                base_width,
                dilation,
                scope,
            )?)),
            UnitKind::Bottleneck => Ok(Self::Bottleneck(BottleneckUnit::new(
                in_channels,
                planes,
                stride,
                downsample,
                groups,
                base_width,
                dilation,
                use_gate,
                scope,
            )?)),
        }
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            ResidualUnit::Basic(unit) => unit.forward(xs, train),
            ResidualUnit::Bottleneck(unit) => unit.forward(xs, train),
        }
    }

    pub fn out_channels(&self) -> usize {
        match self {
            ResidualUnit::Basic(unit) => unit.out_channels,
            ResidualUnit::Bottleneck(unit) => unit.out_channels,
        }
    }

    /// Name of the unit's final normalization, the one the
    /// zero-init-residual treatment targets.
    pub fn final_norm_name(&self) -> &'static str {
        match self {
            ResidualUnit::Basic(_) => "bn2",
            ResidualUnit::Bottleneck(_) => "bn3",
        }
    }
}
