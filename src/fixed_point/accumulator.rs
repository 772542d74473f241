//! Accumulator width emulation.

use crate::error::{QuantError, Result};

/// Saturating accumulator of a fixed bit width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accumulator {
    bits: u32,
}

impl Accumulator {
    pub fn new(bits: u32) -> Result<Self> {
        if !(2..=62).contains(&bits) {
            return Err(QuantError::config(
                "accum_bits",
                format!("accumulator width {bits} outside 2..=62"),
            ));
        }
        Ok(Self { bits })
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn min(&self) -> i64 {
        -(1i64 << (self.bits - 1))
    }

    pub fn max(&self) -> i64 {
        (1i64 << (self.bits - 1)) - 1
    }

    pub fn saturate(&self, acc: i64) -> i64 {
        acc.clamp(self.min(), self.max())
    }

    /// One multiply-accumulate step, saturated to the accumulator width.
    #[inline]
    pub fn mac(&self, acc: i64, a: i64, b: i64) -> i64 {
        self.saturate(acc.saturating_add(a.saturating_mul(b)))
    }
}

/// Arithmetic shift by `shift` bits with round-half-up, as the accelerator's
/// normalization does. Negative shifts scale up.
pub fn roundnorm(acc: i64, shift: i32) -> i64 {
    match shift {
        0 => acc,
        s if s > 0 => {
            let s = s.min(62) as u32;
            acc.saturating_add(1i64 << (s - 1)) >> s
        }
        s => {
            let s = (-s).min(62) as u32;
            acc.saturating_mul(1i64 << s)
        }
    }
}
