//! Run configuration, checkpoint I/O and evaluation glue around the
//! non-local classifier. Training-loop scheduling and optimizer mechanics
//! live outside this workspace.

pub mod checkpoint;
pub mod config;
pub mod logging;
pub mod metrics;

pub use checkpoint::{
    fingerprint_config, load_checkpoint, save_checkpoint, CheckpointDescriptor,
    CheckpointManifest, CHECKPOINT_VERSION,
};
pub use config::{RunConfig, TrainingError};
pub use logging::{Logger, LoggingSettings};
pub use metrics::{evaluate, EvaluationSummary};
