//! Q-format fixed-point representation.
//!
//! A [`QuantParams`] splits a total bit width into a sign bit (when signed),
//! `integer_bits` and `fraction_bits`. Real values are mapped onto the grid of
//! spacing `2^-fraction_bits` and saturated to the integer range of the width.

pub mod accumulator;
pub mod tensor;

pub use accumulator::{roundnorm, Accumulator};
pub use tensor::{dequantize_tensor, quantize_tensor, requantize_tensor, roundnorm_tensor, snap_tensor};

use crate::error::{QuantError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuantParams {
    pub integer_bits: u32,
    pub fraction_bits: u32,
    pub bit_width: u32,
    pub signed: bool,
}

/// Outcome of fitting a value range into a bit width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeFit {
    pub params: QuantParams,
    /// Integer bits the range needs before clamping.
    pub required_integer_bits: u32,
    /// Some part of the range saturates: too few integer bits, or negative
    /// values in an unsigned format.
    pub clamped: bool,
    /// Negative values that an unsigned format maps to zero.
    pub negative_clipped: bool,
}

impl QuantParams {
    /// Bits left for the magnitude once the sign bit is taken.
    pub fn magnitude_bits(bit_width: u32, signed: bool) -> Result<u32> {
        let sign = u32::from(signed);
        if bit_width <= sign {
            return Err(QuantError::config(
                "bits",
                format!("bit width {bit_width} leaves no magnitude bits (signed: {signed})"),
            ));
        }
        Ok(bit_width - sign)
    }

    /// Build a format with an explicit integer/fraction split.
    pub fn with_integer_bits(integer_bits: u32, bit_width: u32, signed: bool) -> Result<Self> {
        let available = Self::magnitude_bits(bit_width, signed)?;
        if integer_bits > available {
            return Err(QuantError::config(
                "integer_bits",
                format!("{integer_bits} integer bits do not fit into {available} magnitude bits"),
            ));
        }
        Ok(Self {
            integer_bits,
            fraction_bits: available - integer_bits,
            bit_width,
            signed,
        })
    }

    /// Minimal integer bits covering `[min, max]`, remaining bits to the fraction.
    pub fn from_range(min: f32, max: f32, bit_width: u32, signed: bool) -> Result<RangeFit> {
        let available = Self::magnitude_bits(bit_width, signed)?;
        let max_abs = f64::from(min.abs().max(max.abs()));

        let required = if !max_abs.is_finite() {
            available + 1
        } else if max_abs > 0.0 {
            (max_abs.log2().floor() as i64 + 1).max(0) as u32
        } else {
            0
        };

        let negative_clipped = !signed && min < 0.0;
        let clamped = required > available || negative_clipped;
        let integer_bits = required.min(available);
        Ok(RangeFit {
            params: Self {
                integer_bits,
                fraction_bits: available - integer_bits,
                bit_width,
                signed,
            },
            required_integer_bits: required,
            clamped,
            negative_clipped,
        })
    }

    /// Format of raw integer data such as unnormalized pixels.
    pub fn integer(bit_width: u32, signed: bool) -> Result<Self> {
        let available = Self::magnitude_bits(bit_width, signed)?;
        Self::with_integer_bits(available, bit_width, signed)
    }

    pub fn scale(&self) -> f64 {
        (self.fraction_bits as f64).exp2()
    }

    pub fn step(&self) -> f64 {
        1.0 / self.scale()
    }

    pub fn qmin(&self) -> i64 {
        if self.signed {
            -(1i64 << (self.bit_width - 1))
        } else {
            0
        }
    }

    pub fn qmax(&self) -> i64 {
        if self.signed {
            (1i64 << (self.bit_width - 1)) - 1
        } else {
            (1i64 << self.bit_width) - 1
        }
    }

    pub fn saturate(&self, q: i64) -> i64 {
        q.clamp(self.qmin(), self.qmax())
    }

    pub fn quantize(&self, value: f64) -> i64 {
        let q = (value * self.scale()).round();
        if q.is_nan() {
            return 0;
        }
        // float-to-int casts saturate, so infinities land on the bounds
        self.saturate(q as i64)
    }

    pub fn dequantize(&self, q: i64) -> f64 {
        q as f64 / self.scale()
    }

    /// Nearest representable real value.
    pub fn snap(&self, value: f64) -> f64 {
        self.dequantize(self.quantize(value))
    }

    /// Largest representable real value.
    pub fn max_real(&self) -> f64 {
        self.dequantize(self.qmax())
    }

    pub fn min_real(&self) -> f64 {
        self.dequantize(self.qmin())
    }

    pub fn is_consistent(&self) -> bool {
        self.integer_bits + self.fraction_bits + u32::from(self.signed) == self.bit_width
    }
}

impl std::fmt::Display for QuantParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = if self.signed { "Q" } else { "UQ" };
        write!(f, "{prefix}{}.{}", self.integer_bits, self.fraction_bits)
    }
}
