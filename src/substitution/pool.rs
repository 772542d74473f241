//! Pooling on integer activations. Max is exact; averages round half up.

use super::{input_integers, FixedPointLayer};
use crate::error::Result;
use crate::fixed_point::QuantParams;
use crate::nn::Pool2d;
use crate::solver::LayerQuantParams;
use candle_core::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    Max,
    Avg,
}

#[derive(Debug)]
pub struct FixedPool2d {
    pool: Pool2d,
    mode: PoolMode,
    params: LayerQuantParams,
}

impl FixedPool2d {
    pub fn new(pool: Pool2d, mode: PoolMode, format: QuantParams) -> Self {
        let kind = match mode {
            PoolMode::Max => "maxpool2d",
            PoolMode::Avg => "avgpool2d",
        };
        Self {
            pool,
            mode,
            params: LayerQuantParams::passthrough(kind, format),
        }
    }
}

impl FixedPointLayer for FixedPool2d {
    fn name(&self) -> &'static str {
        match self.mode {
            PoolMode::Max => "fixed_maxpool2d",
            PoolMode::Avg => "fixed_avgpool2d",
        }
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs = input_integers(xs, &self.params.input)?;
        let out = match self.mode {
            PoolMode::Max => self.pool.max(&xs)?,
            PoolMode::Avg => self.pool.avg(&xs)?.affine(1.0, 0.5)?.floor()?,
        };
        Ok(out.to_dtype(dtype)?)
    }

    fn params(&self) -> &LayerQuantParams {
        &self.params
    }
}

/// Mean over the whole spatial map, keeping a `1x1` map.
#[derive(Debug)]
pub struct FixedGlobalAvgPool {
    params: LayerQuantParams,
}

impl FixedGlobalAvgPool {
    pub fn new(format: QuantParams) -> Self {
        Self {
            params: LayerQuantParams::passthrough("adaptive_avgpool", format),
        }
    }
}

impl FixedPointLayer for FixedGlobalAvgPool {
    fn name(&self) -> &'static str {
        "fixed_adaptive_avgpool"
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs = input_integers(xs, &self.params.input)?;
        let (_, _, h, w) = xs.dims4()?;
        let area = Tensor::new((h * w) as f64, xs.device())?;
        let mean = xs
            .sum_keepdim(3)?
            .sum_keepdim(2)?
            .broadcast_div(&area)?
            .affine(1.0, 0.5)?
            .floor()?;
        Ok(mean.to_dtype(dtype)?)
    }

    fn params(&self) -> &LayerQuantParams {
        &self.params
    }
}
