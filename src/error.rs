//! Error taxonomy for the quantization pipeline.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuantError {
    #[error("invalid configuration `{parameter}`: {reason}")]
    Configuration { parameter: String, reason: String },

    #[error("calibration data source {}: {reason}", path.display())]
    DataSource { path: PathBuf, reason: String },

    #[error("layer `{layer}` ({kind}) has no fixed-point equivalent")]
    UnsupportedLayer { layer: String, kind: String },

    #[error("`{operation}` requires state {expected}, quantizer is {actual}")]
    State {
        operation: &'static str,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("no {what} for layer `{layer}`")]
    Missing { layer: String, what: &'static str },

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("state dict mismatch: {0}")]
    StateDict(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    SafeTensors(#[from] safetensors::SafeTensorError),
}

impl QuantError {
    pub fn config(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    pub fn missing(layer: impl Into<String>, what: &'static str) -> Self {
        Self::Missing {
            layer: layer.into(),
            what,
        }
    }

    pub fn data_source(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::DataSource {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, QuantError>;
