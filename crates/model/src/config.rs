//! Network configuration.
//!
//! All structural choices are made here, validated before any parameter is
//! allocated, and never mutated afterwards. There is no process-wide
//! configuration state: callers hand a value to [`crate::NonLocalNet::new`].

use attention::AttentionKind;
use candle_core::{DType, Device, Error, Result};

/// Residual unit flavor used throughout a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Basic,
    Bottleneck,
}

impl UnitKind {
    /// Channel expansion factor the unit applies to its stage width.
    pub fn expansion(&self) -> usize {
        match self {
            UnitKind::Basic => 1,
            UnitKind::Bottleneck => 4,
        }
    }
}

/// Configuration of one of the four stages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageSpec {
    /// Number of residual units in the stage.
    pub unit_count: usize,
    /// Stage width before the unit expansion factor.
    pub channels: usize,
    /// Spatial stride of the stage's first unit.
    pub stride: usize,
    /// Replace the stride with dilation instead of downsampling.
    pub dilate: bool,
    /// Attention mechanism interleaved into the stage.
    pub attention: AttentionKind,
    /// After unit `i`, an attention block is appended when
    /// `i % attention_period == attention_period - 1`. A period larger than
    /// the unit count therefore disables insertion.
    pub attention_period: usize,
}

impl StageSpec {
    fn plain(unit_count: usize, channels: usize, stride: usize) -> Self {
        Self {
            unit_count,
            channels,
            stride,
            dilate: false,
            attention: AttentionKind::None,
            attention_period: 1,
        }
    }
}

/// Full structural description of a network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub num_classes: usize,
    pub unit_kind: UnitKind,
    pub stages: [StageSpec; 4],
    pub groups: usize,
    pub width_per_group: usize,
    /// Allocate and apply squeeze-excitation gating in bottleneck units.
    pub use_channel_gate: bool,
    /// Zero the final norm scale of every residual unit after construction.
    pub zero_init_last_norm: bool,
    /// Seed for the weight-initialization protocol.
    pub seed: u64,
    pub dtype: DType,
    pub device: Device,
}

impl NetworkConfig {
    /// A backbone without attention: stage widths 64/128/256/512, stride 2
    /// from the second stage on.
    pub fn new(unit_kind: UnitKind, unit_counts: [usize; 4], num_classes: usize) -> Self {
        Self {
            num_classes,
            unit_kind,
            stages: [
                StageSpec::plain(unit_counts[0], 64, 1),
                StageSpec::plain(unit_counts[1], 128, 2),
                StageSpec::plain(unit_counts[2], 256, 2),
                StageSpec::plain(unit_counts[3], 512, 2),
            ],
            groups: 1,
            width_per_group: 64,
            use_channel_gate: false,
            zero_init_last_norm: false,
            seed: 0,
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }

    /// Interleaves `kind` into stages 2..4 with the given insertion periods.
    /// The first stage never carries attention in the stock variants.
    pub fn with_attention(mut self, kind: AttentionKind, periods: [usize; 3]) -> Self {
        for (stage, period) in self.stages[1..].iter_mut().zip(periods) {
            stage.attention = kind;
            stage.attention_period = period;
        }
        self
    }

    pub fn with_groups(mut self, groups: usize, width_per_group: usize) -> Self {
        self.groups = groups;
        self.width_per_group = width_per_group;
        self
    }

    pub fn with_channel_gate(mut self, enabled: bool) -> Self {
        self.use_channel_gate = enabled;
        self
    }

    pub fn with_zero_init_last_norm(mut self, enabled: bool) -> Self {
        self.zero_init_last_norm = enabled;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Validates structural invariants before construction; attention-payload
    /// arithmetic is checked again with stage context while building.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.num_classes == 0 {
            errors.push("num_classes must be greater than zero".to_string());
        }
        if self.groups == 0 {
            errors.push("groups must be greater than zero".to_string());
        }
        if self.width_per_group == 0 {
            errors.push("width_per_group must be greater than zero".to_string());
        }
        if self.unit_kind == UnitKind::Basic && (self.groups != 1 || self.width_per_group != 64) {
            errors.push("basic units only support groups=1 and width_per_group=64".to_string());
        }

        for (idx, stage) in self.stages.iter().enumerate() {
            let stage_no = idx + 1;
            if stage.unit_count == 0 {
                errors.push(format!("stage {stage_no}: unit_count must be positive"));
            }
            if stage.channels == 0 {
                errors.push(format!("stage {stage_no}: channels must be positive"));
            }
            if !matches!(stage.stride, 1 | 2) {
                errors.push(format!(
                    "stage {stage_no}: stride must be 1 or 2, got {}",
                    stage.stride
                ));
            }
            if stage.attention != AttentionKind::None && stage.attention_period == 0 {
                errors.push(format!(
                    "stage {stage_no}: attention_period must be positive"
                ));
            }
            if stage.dilate && self.unit_kind == UnitKind::Basic {
                errors.push(format!(
                    "stage {stage_no}: dilation is not supported by basic units"
                ));
            }
            if let AttentionKind::Bat { dropout, .. } = stage.attention {
                if !(0.0..1.0).contains(&dropout) {
                    errors.push(format!(
                        "stage {stage_no}: bat dropout must be in [0, 1), got {dropout}"
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Msg(format!(
                "invalid network configuration: {}",
                errors.join("; ")
            )))
        }
    }
}

/// 18-unit basic-block variant.
pub fn nlnet18(num_classes: usize) -> NetworkConfig {
    NetworkConfig::new(UnitKind::Basic, [2, 2, 2, 2], num_classes)
}

/// 34-unit basic-block variant.
pub fn nlnet34(num_classes: usize) -> NetworkConfig {
    NetworkConfig::new(UnitKind::Basic, [3, 4, 6, 3], num_classes)
}

/// 50-unit bottleneck variant.
pub fn nlnet50(num_classes: usize) -> NetworkConfig {
    NetworkConfig::new(UnitKind::Bottleneck, [3, 4, 6, 3], num_classes)
}

/// 101-unit bottleneck variant.
pub fn nlnet101(num_classes: usize) -> NetworkConfig {
    NetworkConfig::new(UnitKind::Bottleneck, [3, 4, 23, 3], num_classes)
}

/// 152-unit bottleneck variant.
pub fn nlnet152(num_classes: usize) -> NetworkConfig {
    NetworkConfig::new(UnitKind::Bottleneck, [3, 8, 36, 3], num_classes)
}

/// Grouped 50-unit variant (32 groups, width 4).
pub fn nlnext50_32x4d(num_classes: usize) -> NetworkConfig {
    nlnet50(num_classes).with_groups(32, 4)
}

/// Grouped 101-unit variant (32 groups, width 8).
pub fn nlnext101_32x8d(num_classes: usize) -> NetworkConfig {
    nlnet101(num_classes).with_groups(32, 8)
}

/// Insertion periods the original radar HAR experiments ran with: attention
/// after every 2nd unit in stages 2 and 3, effectively never in stage 4.
pub const DEFAULT_ATTENTION_PERIODS: [usize; 3] = [2, 2, 1000];
