//! Core quantization types and functionality.

pub mod header;
pub mod io;
pub mod validation;

pub use header::{DumpHeader, DTYPE_F32, FLOAT_DOMAIN, MAGIC_DUMP, VERSION};
pub use io::{load_concat_params, load_dump, load_params, write_dump, write_params, DumpFile};
pub use validation::{compare_with_reference, EmulationError};

use crate::error::{QuantError, Result};
use crate::solver::OverflowWarning;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Widest activation that still travels through f32 tensors as an exact integer.
pub const MAX_BITS: u32 = 24;

/// Configuration of one quantization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantConfig {
    /// Bits used to store weights and activations.
    pub bits: u32,
    /// Bits of the intermediate convolution accumulator.
    pub accum_bits: u32,
    pub signed: bool,
    pub save_folder: PathBuf,
    /// Folder with calibration images.
    pub data_source: PathBuf,
    pub use_gpu: bool,
    pub batch_size: usize,
    /// Data loading threads; 0 loads on the calling thread.
    pub num_workers: usize,
    pub verbose: bool,
    pub save_params: bool,
    /// Replace convolutions, pooling and linear layers with fixed-point ones.
    pub quantize_forward: bool,
    pub num_input_channels: usize,
    /// Network input is raw integer pixels rather than normalized values.
    pub raw_input: bool,
    /// Emulate the accumulator with f64 tensor ops instead of the integer kernel.
    pub double_precision: bool,
    /// Fold batch norms into their preceding convolutions before calibration.
    pub convbn: bool,
    /// Magnitude assumed for tensors that never produced a usable range.
    pub default_range: f32,
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            bits: 16,
            accum_bits: 32,
            signed: true,
            save_folder: PathBuf::from("results"),
            data_source: PathBuf::from("tests/data"),
            use_gpu: false,
            batch_size: 1,
            num_workers: 0,
            verbose: false,
            save_params: true,
            quantize_forward: true,
            num_input_channels: 3,
            raw_input: false,
            double_precision: false,
            convbn: false,
            default_range: 1.0,
        }
    }
}

impl QuantConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(2..=MAX_BITS).contains(&self.bits) {
            return Err(QuantError::config(
                "bits",
                format!("{} outside 2..={MAX_BITS}", self.bits),
            ));
        }
        let accum_limit = if self.double_precision { 53 } else { 62 };
        if self.accum_bits < self.bits || self.accum_bits > accum_limit {
            return Err(QuantError::config(
                "accum_bits",
                format!(
                    "{} outside {}..={accum_limit} (double_precision: {})",
                    self.accum_bits, self.bits, self.double_precision
                ),
            ));
        }
        if self.batch_size == 0 {
            return Err(QuantError::config("batch_size", "must be at least 1"));
        }
        if self.num_input_channels == 0 {
            return Err(QuantError::config("num_input_channels", "must be at least 1"));
        }
        if !(self.default_range.is_finite() && self.default_range > 0.0) {
            return Err(QuantError::config(
                "default_range",
                format!("{} is not a positive finite value", self.default_range),
            ));
        }
        Ok(())
    }

    pub fn activations_dump_dir(&self) -> PathBuf {
        self.save_folder.join("activations_dump")
    }
}

/// Summary of a finished quantization run.
#[derive(Debug, Clone, Default)]
pub struct QuantizationReport {
    pub quantized_layers: usize,
    pub substituted_layers: usize,
    pub fused_layers: usize,
    pub calibration_samples: usize,
    pub param_files: usize,
    pub warnings: Vec<OverflowWarning>,
    pub total_time_seconds: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        QuantConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_impossible_widths() {
        let bad = |f: fn(&mut QuantConfig)| {
            let mut cfg = QuantConfig::default();
            f(&mut cfg);
            cfg.validate().unwrap_err()
        };
        assert!(matches!(
            bad(|c| c.bits = 0),
            QuantError::Configuration { parameter, .. } if parameter == "bits"
        ));
        assert!(matches!(
            bad(|c| c.accum_bits = 8),
            QuantError::Configuration { parameter, .. } if parameter == "accum_bits"
        ));
        bad(|c| {
            c.double_precision = true;
            c.accum_bits = 60;
        });
        bad(|c| c.batch_size = 0);
        bad(|c| c.default_range = f32::NAN);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: QuantConfig =
            serde_json::from_str(r#"{"bits": 8, "accum_bits": 16, "raw_input": true}"#).unwrap();
        assert_eq!(cfg.bits, 8);
        assert!(cfg.raw_input);
        assert_eq!(cfg.batch_size, 1);
        cfg.validate().unwrap();
    }
}
