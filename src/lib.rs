//! Post-training fixed-point quantization for convolutional networks
//! targeting GAP8-class accelerators.

pub mod calibration;
pub mod core;
pub mod error;
pub mod fixed_point;
pub mod nn;
pub mod quantizer;
pub mod solver;
pub mod substitution;
pub mod transforms;
pub mod utils;

// Re-export commonly used types
pub use crate::core::{QuantConfig, QuantizationReport, MAX_BITS};
pub use calibration::{CalibrationStats, DataLoader, Dataset, ImageFolder, LayerStats, TensorDataset, ValueRange};
pub use error::{QuantError, Result};
pub use fixed_point::{Accumulator, QuantParams};
pub use nn::{ForwardObserver, Layer, Network};
pub use quantizer::{ModelQuantizer, QuantizerState};
pub use solver::{ConcatParams, LayerQuantParams, OverflowWarning, ParamSolver, Solution};
pub use substitution::{Emulation, FixedPointLayer};
pub use transforms::{Compose, Transform};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Quantize `model` in place with the images under `config.data_source`.
pub fn quantize_model(
    model: &mut Network,
    config: QuantConfig,
    transform: Arc<Compose>,
) -> Result<QuantizationReport> {
    ModelQuantizer::new(model, config, transform)?.quantize_model()
}

/// Load the per-layer parameter files a previous run wrote to `dir`.
pub fn load_quantization_params(dir: &Path) -> Result<BTreeMap<String, LayerQuantParams>> {
    crate::core::load_params(dir)
}
