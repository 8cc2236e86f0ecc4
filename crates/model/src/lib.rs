//! Attention-augmented residual network for radar-derived human-activity
//! imagery.
//!
//! The assembler consumes an explicit [`NetworkConfig`], builds the stem,
//! four residual stages with attention blocks interleaved at configured
//! positions, and the classifier head, then applies the seed-driven weight
//! initialization protocol once over the finished graph.

pub mod config;
pub mod network;
pub mod unit;

pub use config::{
    nlnet101, nlnet152, nlnet18, nlnet34, nlnet50, nlnext101_32x8d, nlnext50_32x4d,
    NetworkConfig, StageSpec, UnitKind, DEFAULT_ATTENTION_PERIODS,
};
pub use network::{NonLocalNet, StageEntry};
pub use unit::{BasicUnit, BottleneckUnit, Downsample, ResidualUnit};
