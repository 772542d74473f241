//! Utility functions shared by the pipeline stages.

pub mod tensor_ops;

pub use tensor_ops::{finite_min_max, tensor_to_f32, to_f32_vec};

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

static IMAGE_EXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\.(png|jpe?g|bmp|pgm|ppm|pnm|tiff?)$").unwrap());

/// Whether `path` names an image format the calibration loader decodes.
pub fn is_image_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| IMAGE_EXT_RE.is_match(n))
}
