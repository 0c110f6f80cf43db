use candle_core::{Result, Tensor};
use candle_nn::{Module, VarBuilder};

use crate::rms_norm::{RmsNormalization, RMS_NORM_EPS};

/// Pre-norm residual: `x + sub_layer(norm(x))`. Each connection owns its own
/// normalization scale.
pub struct ResidualConnection {
    norm: RmsNormalization,
}

impl ResidualConnection {
    pub fn new(features: usize, vb: VarBuilder) -> Result<Self> {
        let norm = RmsNormalization::new(features, RMS_NORM_EPS, vb.pp("norm"))?;
        Ok(Self { norm })
    }

    pub fn forward(
        &self,
        xs: &Tensor,
        sub_layer: &dyn Fn(&Tensor) -> Result<Tensor>,
    ) -> Result<Tensor> {
        xs + sub_layer(&self.norm.forward(xs)?)?
    }
}
