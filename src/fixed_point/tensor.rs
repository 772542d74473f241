//! Tensor-wide fixed-point operations.
//!
//! Quantized tensors keep their floating dtype and carry integer values; the
//! arithmetic runs in f64 so that every integer below 2^53 stays exact.

use super::QuantParams;
use crate::error::Result;
use candle_core::{DType, Tensor};

/// Map real values onto the integer grid of `params`, saturating.
pub fn quantize_tensor(xs: &Tensor, params: &QuantParams) -> Result<Tensor> {
    let q = xs
        .to_dtype(DType::F64)?
        .affine(params.scale(), 0.0)?
        .round()?
        .clamp(params.qmin() as f64, params.qmax() as f64)?;
    Ok(q.to_dtype(xs.dtype())?)
}

pub fn dequantize_tensor(q: &Tensor, params: &QuantParams) -> Result<Tensor> {
    let xs = q.to_dtype(DType::F64)?.affine(params.step(), 0.0)?;
    Ok(xs.to_dtype(q.dtype())?)
}

/// Replace every value with the nearest representable one.
pub fn snap_tensor(xs: &Tensor, params: &QuantParams) -> Result<Tensor> {
    dequantize_tensor(&quantize_tensor(xs, params)?, params)
}

/// Shift an f64 accumulator tensor right by `shift` bits with round-half-up.
pub fn roundnorm_tensor(acc: &Tensor, shift: i32) -> Result<Tensor> {
    Ok(match shift {
        0 => acc.clone(),
        s if s > 0 => acc.affine((-(s as f64)).exp2(), 0.5)?.floor()?,
        s => acc.affine((-(s as f64)).exp2(), 0.0)?,
    })
}

/// Move integer values from one fraction-bit grid to another, saturating to `to`.
pub fn requantize_tensor(q: &Tensor, from_frac: u32, to: &QuantParams) -> Result<Tensor> {
    let shift = from_frac as i32 - to.fraction_bits as i32;
    let shifted = roundnorm_tensor(&q.to_dtype(DType::F64)?, shift)?
        .clamp(to.qmin() as f64, to.qmax() as f64)?;
    Ok(shifted.to_dtype(q.dtype())?)
}
