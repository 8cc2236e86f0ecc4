//! Network assembly.
//!
//! Builds the stem, four stages of residual units with attention blocks
//! interleaved at configured positions, and the classifier head, then runs
//! the weight-initialization protocol over the finished graph. The stage
//! pipelines are ordered and fixed at construction; forward execution walks
//! them in insertion order.

use std::sync::Mutex;

use candle_core::{Error, Result, Tensor, Var};
use candle_nn::VarMap;

use attention::{AttentionBlock, AttentionKind};
use layers::{
    checks, init, pooling, BatchNorm2d, Conv2d, Conv2dConfig, InitLedger, Linear, ParamScope,
};

use crate::config::{NetworkConfig, StageSpec};
use crate::unit::{Downsample, ResidualUnit};

const STEM_CHANNELS: usize = 64;

/// One entry of a stage pipeline; insertion order defines execution order.
pub enum StageEntry {
    Unit(ResidualUnit),
    Attention(AttentionBlock),
}

impl StageEntry {
    pub fn is_attention(&self) -> bool {
        matches!(self, StageEntry::Attention(_))
    }

    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            StageEntry::Unit(unit) => unit.forward(xs, train),
            StageEntry::Attention(block) => block.forward(xs, train),
        }
    }
}

/// The assembled classifier.
pub struct NonLocalNet {
    config: NetworkConfig,
    varmap: VarMap,
    stem_conv: Conv2d,
    stem_norm: BatchNorm2d,
    stages: [Vec<StageEntry>; 4],
    fc: Linear,
}

impl NonLocalNet {
    pub fn new(config: NetworkConfig) -> Result<Self> {
        config.validate()?;

        let varmap = VarMap::new();
        let ledger = Mutex::new(InitLedger::new());
        let root = ParamScope::root(&varmap, &ledger, config.device.clone(), config.dtype);

        let stem_conv = Conv2d::new(
            3,
            STEM_CHANNELS,
            (7, 7),
            Conv2dConfig {
                stride: 2,
                padding: 3,
                ..Default::default()
            },
            &root.pp("conv1"),
        )?;
        let stem_norm = BatchNorm2d::new(STEM_CHANNELS, &root.pp("bn1"))?;

        let mut in_channels = STEM_CHANNELS;
        let mut dilation = 1;
        let mut stages = Vec::with_capacity(4);
        let mut attention_prefixes = Vec::new();
        let mut unit_prefixes = Vec::new();
        for (idx, spec) in config.stages.iter().enumerate() {
            let stage = build_stage(
                &config,
                spec,
                idx,
                &root.pp(format!("layer{}", idx + 1)),
                &mut in_channels,
                &mut dilation,
                &mut attention_prefixes,
                &mut unit_prefixes,
            )?;
            stages.push(stage);
        }
        let stages: [Vec<StageEntry>; 4] = stages
            .try_into()
            .map_err(|_| Error::Msg("expected exactly four stages".into()))?;

        let fc = Linear::new(in_channels, config.num_classes, &root.pp("fc"))?;

        // Initialization protocol: defaults over the whole graph first, then
        // each attention block's policy, then the optional zero-init of every
        // unit's final norm (independent of the attention policy).
        {
            let ledger = ledger.lock().unwrap();
            init::apply_protocol(&ledger, config.seed)?;
            let mut prefixes = attention_prefixes.iter();
            for stage in &stages {
                for entry in stage {
                    if let StageEntry::Attention(block) = entry {
                        let prefix: &String = prefixes.next().ok_or_else(|| {
                            Error::Msg("attention block without a recorded prefix".into())
                        })?;
                        block.init_parameters(&ledger, prefix)?;
                    }
                }
            }
            if config.zero_init_last_norm {
                for prefix in &unit_prefixes {
                    init::zero_scale_under(&ledger, prefix)?;
                }
            }
        }

        Ok(Self {
            config,
            varmap,
            stem_conv,
            stem_norm,
            stages,
            fc,
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// The entries of stage `idx` (0-based) in execution order.
    pub fn stage(&self, idx: usize) -> &[StageEntry] {
        &self.stages[idx]
    }

    /// Named parameter registry backing the network, for checkpoint I/O.
    pub fn var_map(&self) -> &VarMap {
        &self.varmap
    }

    /// All parameters sorted by name; the naming scheme is stable per stage.
    pub fn parameters(&self) -> Vec<(String, Var)> {
        let data = self.varmap.data().lock().unwrap();
        let mut params: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        params
    }

    /// Produces `(batch, num_classes)` logits for a `(batch, 3, H, W)` input.
    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_channels("network.input", xs, 3)?;
        let mut hidden = self.stem_norm.forward(&self.stem_conv.forward(xs)?, train)?.relu()?;
        hidden = pooling::stem_max_pool(&hidden)?;
        for stage in &self.stages {
            for entry in stage {
                hidden = entry.forward(&hidden, train)?;
            }
        }
        let pooled = pooling::global_avg_pool(&hidden)?;
        self.fc.forward(&pooled)
    }
}

#[allow(clippy::too_many_arguments)]
fn build_stage(
    config: &NetworkConfig,
    spec: &StageSpec,
    stage_idx: usize,
    scope: &ParamScope,
    in_channels: &mut usize,
    dilation: &mut usize,
    attention_prefixes: &mut Vec<String>,
    unit_prefixes: &mut Vec<String>,
) -> Result<Vec<StageEntry>> {
    let mut stride = spec.stride;
    let previous_dilation = *dilation;
    if spec.dilate {
        *dilation *= stride;
        stride = 1;
    }
    let out_channels = spec.channels * config.unit_kind.expansion();

    let mut entries = Vec::new();
    for i in 0..spec.unit_count {
        let unit_scope = scope.pp(i.to_string());
        let unit = if i == 0 {
            let downsample = if stride != 1 || *in_channels != out_channels {
                Some(Downsample::new(
                    *in_channels,
                    out_channels,
                    stride,
                    &unit_scope.pp("downsample"),
                )?)
            } else {
                None
            };
            ResidualUnit::build(
                config.unit_kind,
                *in_channels,
                spec.channels,
                stride,
                downsample,
                config.groups,
                config.width_per_group,
                previous_dilation,
                config.use_channel_gate,
                &unit_scope,
            )
        } else {
            ResidualUnit::build(
                config.unit_kind,
                *in_channels,
                spec.channels,
                1,
                None,
                config.groups,
                config.width_per_group,
                *dilation,
                config.use_channel_gate,
                &unit_scope,
            )
        }
        .map_err(|err| Error::Msg(format!("stage {} unit {i}: {err}", stage_idx + 1)))?;
        if i == 0 {
            *in_channels = out_channels;
        }
        unit_prefixes.push(format!("{}.{}", unit_scope.prefix(), unit.final_norm_name()));
        entries.push(StageEntry::Unit(unit));

        if spec.attention != AttentionKind::None && i % spec.attention_period == spec.attention_period - 1 {
            let att_scope = scope.pp(format!("att{i}"));
            let block = AttentionBlock::build(spec.attention, *in_channels, &att_scope)
                .map_err(|err| {
                    Error::Msg(format!("stage {} attention after unit {i}: {err}", stage_idx + 1))
                })?;
            if let Some(block) = block {
                attention_prefixes.push(att_scope.prefix().to_string());
                entries.push(StageEntry::Attention(block));
            }
        }
    }
    Ok(entries)
}

