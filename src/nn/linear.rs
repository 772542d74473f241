//! Fully-connected layer.

use crate::error::{QuantError, Result};
use candle_core::Tensor;

#[derive(Debug, Clone)]
pub struct Linear {
    /// `(out_features, in_features)`
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

impl Linear {
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let (out_f, _) = weight.dims2()?;
        if let Some(b) = &bias {
            if b.dims() != [out_f] {
                return Err(QuantError::Shape(format!(
                    "linear bias {:?} does not match {out_f} outputs",
                    b.dims()
                )));
            }
        }
        Ok(Self {
            weight: weight.contiguous()?,
            bias: bias.map(|b| b.contiguous()).transpose()?,
        })
    }

    pub fn in_features(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = xs.matmul(&self.weight.t()?)?;
        match &self.bias {
            Some(b) => Ok(ys.broadcast_add(b)?),
            None => Ok(ys),
        }
    }
}
