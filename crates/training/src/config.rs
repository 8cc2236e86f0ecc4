//! Run configuration.
//!
//! A run is described by a TOML or JSON file; every structural option of the
//! network plus the dataset layout lives here, and `validate` collects all
//! violations into a single error instead of stopping at the first.

use std::{fmt, fs, path::Path, path::PathBuf};

use attention::AttentionKind;
use model::{
    nlnet101, nlnet152, nlnet18, nlnet34, nlnet50, nlnext101_32x8d, nlnext50_32x4d, NetworkConfig,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub model: ModelSection,
    pub data: DataSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    /// One of nlnet18/34/50/101/152, nlnext50_32x4d, nlnext101_32x8d.
    pub variant: String,
    pub num_classes: usize,
    /// Attention mechanism for stages 2..4: none, nl, bat or gc.
    #[serde(default = "defaults::attention")]
    pub attention: String,
    #[serde(default = "defaults::attention_periods")]
    pub attention_periods: [usize; 3],
    #[serde(default = "defaults::bat_reduction")]
    pub bat_reduction: usize,
    #[serde(default = "defaults::bat_grid")]
    pub bat_grid: usize,
    #[serde(default = "defaults::bat_heads")]
    pub bat_heads: usize,
    #[serde(default = "defaults::gc_reduction")]
    pub gc_reduction: usize,
    #[serde(default = "defaults::dropout")]
    pub dropout: f32,
    #[serde(default)]
    pub use_channel_gate: bool,
    #[serde(default)]
    pub zero_init_last_norm: bool,
    #[serde(default)]
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSection {
    /// Directory with one sub-directory of spectrogram exports per class.
    pub root: PathBuf,
    /// Every Nth file per class is held out for validation.
    #[serde(default = "defaults::holdout_every")]
    pub holdout_every: usize,
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "defaults::enabled")]
    pub stdout: bool,
    pub metrics_file: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            stdout: true,
            metrics_file: None,
        }
    }
}

mod defaults {
    pub fn attention() -> String {
        "nl".to_string()
    }
    pub fn attention_periods() -> [usize; 3] {
        model::DEFAULT_ATTENTION_PERIODS
    }
    pub fn bat_reduction() -> usize {
        2
    }
    pub fn bat_grid() -> usize {
        7
    }
    pub fn bat_heads() -> usize {
        4
    }
    pub fn gc_reduction() -> usize {
        16
    }
    pub fn dropout() -> f32 {
        0.2
    }
    pub fn holdout_every() -> usize {
        5
    }
    pub fn batch_size() -> usize {
        32
    }
    pub fn enabled() -> bool {
        true
    }
}

const VARIANTS: [&str; 7] = [
    "nlnet18",
    "nlnet34",
    "nlnet50",
    "nlnet101",
    "nlnet152",
    "nlnext50_32x4d",
    "nlnext101_32x8d",
];

impl RunConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: RunConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if !VARIANTS.contains(&self.model.variant.as_str()) {
            errors.push(format!(
                "model.variant '{}' is not one of {VARIANTS:?}",
                self.model.variant
            ));
        }
        if self.model.num_classes == 0 {
            errors.push("model.num_classes must be greater than 0".to_string());
        }
        if !matches!(self.model.attention.as_str(), "none" | "nl" | "bat" | "gc") {
            errors.push(format!(
                "model.attention '{}' is not one of none/nl/bat/gc",
                self.model.attention
            ));
        }
        if self.model.attention != "none" && self.model.attention_periods.contains(&0) {
            errors.push("model.attention_periods entries must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            errors.push("model.dropout must be in [0, 1)".to_string());
        }
        if self.model.attention == "bat" {
            if self.model.bat_reduction == 0 {
                errors.push("model.bat_reduction must be greater than 0".to_string());
            }
            if self.model.bat_grid == 0 {
                errors.push("model.bat_grid must be greater than 0".to_string());
            }
            if self.model.bat_heads == 0 {
                errors.push("model.bat_heads must be greater than 0".to_string());
            }
        }
        if self.model.attention == "gc" && self.model.gc_reduction == 0 {
            errors.push("model.gc_reduction must be greater than 0".to_string());
        }
        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TrainingError::Validation(errors))
        }
    }

    /// Resolves the declarative sections into the structural network config.
    pub fn network_config(&self) -> Result<NetworkConfig, TrainingError> {
        let base = match self.model.variant.as_str() {
            "nlnet18" => nlnet18(self.model.num_classes),
            "nlnet34" => nlnet34(self.model.num_classes),
            "nlnet50" => nlnet50(self.model.num_classes),
            "nlnet101" => nlnet101(self.model.num_classes),
            "nlnet152" => nlnet152(self.model.num_classes),
            "nlnext50_32x4d" => nlnext50_32x4d(self.model.num_classes),
            "nlnext101_32x8d" => nlnext101_32x8d(self.model.num_classes),
            other => {
                return Err(TrainingError::initialization(format!(
                    "unknown model variant '{other}'"
                )))
            }
        };

        let kind = match self.model.attention.as_str() {
            "none" => AttentionKind::None,
            "nl" => AttentionKind::non_local(),
            "bat" => AttentionKind::Bat {
                reduction: self.model.bat_reduction,
                grid: self.model.bat_grid,
                heads: self.model.bat_heads,
                dropout: self.model.dropout,
            },
            "gc" => AttentionKind::GlobalContext {
                reduction: self.model.gc_reduction,
            },
            other => {
                return Err(TrainingError::initialization(format!(
                    "unknown attention kind '{other}'"
                )))
            }
        };

        let mut config = base;
        if kind != AttentionKind::None {
            config = config.with_attention(kind, self.model.attention_periods);
        }
        Ok(config
            .with_channel_gate(self.model.use_channel_gate)
            .with_zero_init_last_norm(self.model.zero_init_last_norm)
            .with_seed(self.model.seed))
    }
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "failed to read config: {err}"),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {err}"),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "initialization failed: {msg}")
            }
            TrainingError::Runtime(msg) => write!(f, "run failed: {msg}"),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(err: serde_json::Error) -> Self {
        Self::ConfigFormat(err.to_string())
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(err: toml::de::Error) -> Self {
        Self::ConfigFormat(err.to_string())
    }
}

impl From<candle_core::Error> for TrainingError {
    fn from(err: candle_core::Error) -> Self {
        Self::Runtime(err.to_string())
    }
}

impl From<dataset::DatasetError> for TrainingError {
    fn from(err: dataset::DatasetError) -> Self {
        Self::Runtime(err.to_string())
    }
}
