//! Dense projection used by the classifier head and the channel gate.

use candle_core::{Error, Result, Tensor};

use crate::vars::{ParamRole, ParamScope};

#[derive(Clone)]
pub struct Linear {
    weight: Tensor,
    bias: Tensor,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize, scope: &ParamScope) -> Result<Self> {
        let weight = scope.var(
            "weight",
            (out_features, in_features),
            ParamRole::LinearWeight {
                fan_in: in_features,
                fan_out: out_features,
            },
        )?;
        let bias = scope.var("bias", out_features, ParamRole::Bias)?;
        Ok(Self {
            weight,
            bias,
            in_features,
            out_features,
        })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match xs.dims() {
            [_, features] if *features == self.in_features => {}
            dims => {
                return Err(Error::Msg(format!(
                    "linear.input: expected (batch, {}) layout, got {dims:?}",
                    self.in_features
                )))
            }
        }
        xs.matmul(&self.weight.t()?)?.broadcast_add(&self.bias)
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }
}
