//! Tensor conversion operations.

use crate::error::{QuantError, Result};
use candle_core::{DType, Tensor};
use half::{bf16, f16};
use safetensors::tensor::Dtype;

pub fn tensor_to_f32(bytes: &[u8], dtype: Dtype) -> Result<Vec<f32>> {
    Ok(match dtype {
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
        Dtype::F64 => bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                f64::from_le_bytes(raw) as f32
            })
            .collect(),
        Dtype::F16 => bytes
            .chunks_exact(2)
            .map(|chunk| {
                let bits = u16::from_le_bytes([chunk[0], chunk[1]]);
                f16::from_bits(bits).to_f32()
            })
            .collect(),
        Dtype::BF16 => bytes
            .chunks_exact(2)
            .map(|chunk| {
                let bits = u16::from_le_bytes([chunk[0], chunk[1]]);
                bf16::from_bits(bits).to_f32()
            })
            .collect(),
        other => {
            return Err(QuantError::StateDict(format!("unsupported dtype {other:?}")));
        }
    })
}

/// Flattened f32 copy of any tensor.
pub fn to_f32_vec(xs: &Tensor) -> Result<Vec<f32>> {
    Ok(xs.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?)
}

/// Minimum and maximum over finite values; `None` when there are none.
pub fn finite_min_max(xs: &Tensor) -> Result<Option<(f32, f32)>> {
    let values = to_f32_vec(xs)?;
    let mut bounds: Option<(f32, f32)> = None;
    for v in values.into_iter().filter(|v| v.is_finite()) {
        bounds = Some(match bounds {
            Some((lo, hi)) => (lo.min(v), hi.max(v)),
            None => (v, v),
        });
    }
    Ok(bounds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn decodes_half_precision() -> Result<()> {
        let raw: Vec<u8> = [f16::from_f32(1.5), f16::from_f32(-2.0)]
            .iter()
            .flat_map(|v| v.to_bits().to_le_bytes())
            .collect();
        assert_eq!(tensor_to_f32(&raw, Dtype::F16)?, vec![1.5, -2.0]);
        assert!(tensor_to_f32(&raw, Dtype::I32).is_err());
        Ok(())
    }

    #[test]
    fn min_max_skips_non_finite() -> Result<()> {
        let xs = Tensor::new(&[f32::NEG_INFINITY, -1.0, 3.5, f32::NAN], &Device::Cpu)?;
        assert_eq!(finite_min_max(&xs)?, Some((-1.0, 3.5)));
        let empty = Tensor::new(&[f32::NAN], &Device::Cpu)?;
        assert_eq!(finite_min_max(&empty)?, None);
        Ok(())
    }
}
