//! Named-parameter registration.
//!
//! Every learnable tensor in the network is created through a [`ParamScope`],
//! which inserts the backing [`Var`] into a shared [`VarMap`] under a dotted
//! path (`layer2.0.conv1.weight`) and records the parameter's role in an
//! [`InitLedger`]. The map gives checkpoints a stable, deterministic naming
//! scheme; the ledger gives the initialization protocol a creation-ordered
//! view of every parameter so that re-initialization is reproducible.

use std::sync::Mutex;

use candle_core::{DType, Device, Error, Result, Shape, Tensor, Var};
use candle_nn::VarMap;

/// What a parameter is, for the purposes of the initialization protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRole {
    /// Convolution kernel; carries the fan-in used for variance scaling.
    ConvWeight { fan_in: usize },
    /// Dense projection weight.
    LinearWeight { fan_in: usize, fan_out: usize },
    /// Convolution or linear bias.
    Bias,
    /// Normalization scale (gamma).
    NormScale,
    /// Normalization shift (beta).
    NormShift,
    /// Batch-norm running mean (not trained, still checkpointed).
    RunningMean,
    /// Batch-norm running variance.
    RunningVar,
}

/// A registered parameter: full dotted name, live variable, role.
pub struct ParamEntry {
    pub name: String,
    pub var: Var,
    pub role: ParamRole,
}

/// Creation-ordered record of every parameter in a network.
#[derive(Default)]
pub struct InitLedger {
    entries: Vec<ParamEntry>,
}

impl InitLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ParamEntry] {
        &self.entries
    }

    /// Entries whose name sits under `prefix` (dotted-path boundary).
    pub fn entries_under<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a ParamEntry> {
        self.entries.iter().filter(move |entry| {
            entry.name == prefix
                || (entry.name.len() > prefix.len()
                    && entry.name.starts_with(prefix)
                    && entry.name.as_bytes()[prefix.len()] == b'.')
        })
    }

    fn push(&mut self, entry: ParamEntry) {
        self.entries.push(entry);
    }
}

/// Path-scoped factory for named parameters, in the spirit of a builder path:
/// `scope.pp("layer2").pp("0").pp("conv1")` yields the prefix for one layer.
pub struct ParamScope<'a> {
    map: &'a VarMap,
    ledger: &'a Mutex<InitLedger>,
    path: String,
    device: Device,
    dtype: DType,
}

impl<'a> ParamScope<'a> {
    pub fn root(
        map: &'a VarMap,
        ledger: &'a Mutex<InitLedger>,
        device: Device,
        dtype: DType,
    ) -> Self {
        Self {
            map,
            ledger,
            path: String::new(),
            device,
            dtype,
        }
    }

    /// Returns a child scope for the given path segment.
    pub fn pp(&self, segment: impl AsRef<str>) -> ParamScope<'a> {
        let segment = segment.as_ref();
        let path = if self.path.is_empty() {
            segment.to_string()
        } else {
            format!("{}.{}", self.path, segment)
        };
        ParamScope {
            map: self.map,
            ledger: self.ledger,
            path,
            device: self.device.clone(),
            dtype: self.dtype,
        }
    }

    /// Dotted prefix of this scope ("" at the root).
    pub fn prefix(&self) -> &str {
        &self.path
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Registers a zero-filled parameter and returns a tensor view of it.
    ///
    /// Values are filled in afterwards by the initialization protocol; the
    /// returned tensor shares storage with the registered [`Var`], so those
    /// updates (and optimizer steps) are visible to the layer holding it.
    pub fn var<S: Into<Shape>>(&self, name: &str, shape: S, role: ParamRole) -> Result<Tensor> {
        Ok(self.var_handle(name, shape, role)?.as_tensor().clone())
    }

    /// Same as [`ParamScope::var`] but hands back the `Var` itself, for
    /// parameters the layer must mutate during forward (running statistics).
    pub fn var_handle<S: Into<Shape>>(&self, name: &str, shape: S, role: ParamRole) -> Result<Var> {
        let full = if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.path, name)
        };
        let tensor = Tensor::zeros(shape, self.dtype, &self.device)?;
        let var = Var::from_tensor(&tensor)?;
        {
            let mut data = self.map.data().lock().unwrap();
            if data.contains_key(&full) {
                return Err(Error::Msg(format!("duplicate parameter name {full}")));
            }
            data.insert(full.clone(), var.clone());
        }
        self.ledger.lock().unwrap().push(ParamEntry {
            name: full,
            var: var.clone(),
            role,
        });
        Ok(var)
    }
}
