//! Accuracy of the fixed-point emulation against a float reference.

use crate::error::{QuantError, Result};
use crate::utils::to_f32_vec;
use candle_core::Tensor;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmulationError {
    pub mse: f64,
    pub max_abs: f64,
    /// Largest deviation in units of the output grid spacing.
    pub max_lsb: f64,
}

/// Descale `emulated` by `2^out_frac_bits` and compare it with `reference`.
pub fn compare_with_reference(
    reference: &Tensor,
    emulated: &Tensor,
    out_frac_bits: u32,
) -> Result<EmulationError> {
    if reference.dims() != emulated.dims() {
        return Err(QuantError::Shape(format!(
            "reference {:?} vs emulated {:?}",
            reference.dims(),
            emulated.dims()
        )));
    }
    let scale = (out_frac_bits as f64).exp2();
    let expected = to_f32_vec(reference)?;
    let actual = to_f32_vec(emulated)?;

    let mut mse = 0f64;
    let mut max_abs = 0f64;
    for (e, a) in expected.iter().zip(actual.iter()) {
        let diff = (f64::from(*a) / scale - f64::from(*e)).abs();
        mse += diff * diff;
        max_abs = max_abs.max(diff);
    }
    mse /= expected.len().max(1) as f64;

    Ok(EmulationError {
        mse,
        max_abs,
        max_lsb: max_abs * scale,
    })
}
