//! Long-range attention blocks.
//!
//! Three interchangeable mechanisms share one contract: consume a
//! `(batch, channels, height, width)` feature map, return a residual-refined
//! map of identical shape. The assembler selects a mechanism through the
//! closed [`AttentionKind`] sum type; there is no string-keyed registry.
//!
//! All three variants carry the same initialization policy: after the
//! default protocol has run, every normalization scale and shift inside the
//! block is re-zeroed, which makes the attention branch an exact no-op until
//! training moves it away from zero.

pub mod bat;
pub mod context;
pub mod nonlocal;

use candle_core::{Result, Tensor};
use layers::{init, InitLedger, ParamScope};

pub use bat::BilinearAttentionTransform;
pub use context::GlobalContextAttention;
pub use nonlocal::NonLocalAttention;

/// Which attention mechanism a stage interleaves, with its configuration
/// payload. `None` disables interleaving entirely.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttentionKind {
    None,
    NonLocal {
        scaled: bool,
    },
    Bat {
        reduction: usize,
        grid: usize,
        heads: usize,
        dropout: f32,
    },
    GlobalContext {
        reduction: usize,
    },
}

impl AttentionKind {
    /// Plain non-local attention with the stabilizing `1/sqrt(C/2)` scale.
    pub fn non_local() -> Self {
        AttentionKind::NonLocal { scaled: true }
    }

    /// Bilinear attention transform with the ratios and 7x7 grid the radar
    /// HAR experiments ran with.
    pub fn bat() -> Self {
        AttentionKind::Bat {
            reduction: 2,
            grid: 7,
            heads: 4,
            dropout: 0.2,
        }
    }

    /// Global-context attention with a 16x channel bottleneck.
    pub fn global_context() -> Self {
        AttentionKind::GlobalContext { reduction: 16 }
    }

    /// Short tag used in logs and parameter-name prefixes.
    pub fn label(&self) -> &'static str {
        match self {
            AttentionKind::None => "none",
            AttentionKind::NonLocal { .. } => "nl",
            AttentionKind::Bat { .. } => "bat",
            AttentionKind::GlobalContext { .. } => "gc",
        }
    }
}

/// A constructed attention block of one of the three kinds.
pub enum AttentionBlock {
    NonLocal(NonLocalAttention),
    Bat(BilinearAttentionTransform),
    GlobalContext(GlobalContextAttention),
}

impl AttentionBlock {
    /// Builds a block for `kind` over `channels`-wide feature maps.
    /// Returns `Ok(None)` when the kind is [`AttentionKind::None`].
    pub fn build(
        kind: AttentionKind,
        channels: usize,
        scope: &ParamScope,
    ) -> Result<Option<Self>> {
        match kind {
            AttentionKind::None => Ok(None),
            AttentionKind::NonLocal { scaled } => Ok(Some(Self::NonLocal(
                NonLocalAttention::new(channels, scaled, scope)?,
            ))),
            AttentionKind::Bat {
                reduction,
                grid,
                heads,
                dropout,
            } => Ok(Some(Self::Bat(BilinearAttentionTransform::new(
                channels, reduction, grid, heads, dropout, scope,
            )?))),
            AttentionKind::GlobalContext { reduction } => Ok(Some(Self::GlobalContext(
                GlobalContextAttention::new(channels, reduction, scope)?,
            ))),
        }
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            AttentionBlock::NonLocal(block) => block.forward(xs, train),
            AttentionBlock::Bat(block) => block.forward(xs, train),
            AttentionBlock::GlobalContext(block) => block.forward(xs),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AttentionBlock::NonLocal(_) => "nl",
            AttentionBlock::Bat(_) => "bat",
            AttentionBlock::GlobalContext(_) => "gc",
        }
    }

    /// The block's own initialization policy, invoked by the assembler after
    /// the default protocol: re-zero every norm so the branch starts dead.
    pub fn init_parameters(&self, ledger: &InitLedger, prefix: &str) -> Result<()> {
        init::zero_norms_under(ledger, prefix)
    }
}
