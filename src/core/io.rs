//! Persistence of quantization parameters and activation dumps.

use super::header::{DumpHeader, DTYPE_F32, MAGIC_DUMP, VERSION};
use crate::error::{QuantError, Result};
use crate::solver::{ConcatParams, LayerQuantParams, Solution};
use crate::utils::to_f32_vec;
use candle_core::Tensor;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::mem;
use std::path::{Path, PathBuf};
use tracing::debug;

static CAT_FILE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.+)\.cat\.json$").unwrap());
static PARAM_FILE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.+)\.json$").unwrap());

pub fn layer_params_path(dir: &Path, layer: &str) -> PathBuf {
    dir.join(format!("{layer}.json"))
}

pub fn concat_params_path(dir: &Path, concat: &str) -> PathBuf {
    dir.join(format!("{concat}.cat.json"))
}

pub fn write_layer_params(dir: &Path, layer: &str, params: &LayerQuantParams) -> Result<PathBuf> {
    let path = layer_params_path(dir, layer);
    write_json(&path, params)?;
    Ok(path)
}

pub fn write_concat_params(dir: &Path, concat: &str, params: &ConcatParams) -> Result<PathBuf> {
    let path = concat_params_path(dir, concat);
    write_json(&path, params)?;
    Ok(path)
}

/// Write one file per layer and per concat point; returns the file count.
pub fn write_params(dir: &Path, solution: &Solution) -> Result<usize> {
    fs::create_dir_all(dir)?;
    for (name, params) in &solution.layers {
        write_layer_params(dir, name, params)?;
    }
    for (name, params) in &solution.concats {
        write_concat_params(dir, name, params)?;
    }
    let written = solution.layers.len() + solution.concats.len();
    debug!("wrote {written} parameter files to {}", dir.display());
    Ok(written)
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut w = BufWriter::new(fs::File::create(path)?);
    serde_json::to_writer_pretty(&mut w, value)?;
    w.write_all(b"\n")?;
    w.flush()?;
    Ok(())
}

pub fn load_layer_params(path: &Path) -> Result<LayerQuantParams> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Read every per-layer parameter file in `dir`, keyed by layer name.
/// Concat records and subdirectories are skipped.
pub fn load_params(dir: &Path) -> Result<BTreeMap<String, LayerQuantParams>> {
    let mut params = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(file) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if CAT_FILE_RE.is_match(file) {
            continue;
        }
        if let Some(caps) = PARAM_FILE_RE.captures(file) {
            params.insert(caps[1].to_string(), load_layer_params(&path)?);
        }
    }
    Ok(params)
}

pub fn load_concat_params(dir: &Path) -> Result<BTreeMap<String, ConcatParams>> {
    let mut params = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(file) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(caps) = CAT_FILE_RE.captures(file) {
            let text = fs::read_to_string(&path)?;
            params.insert(caps[1].to_string(), serde_json::from_str(&text)?);
        }
    }
    Ok(params)
}

pub fn write_dump(path: &Path, tensor: &Tensor, frac_bits: i32) -> Result<()> {
    let shape = tensor.dims();
    if shape.len() > 4 {
        return Err(QuantError::Shape(format!(
            "cannot dump rank-{} tensor {}",
            shape.len(),
            path.display()
        )));
    }
    let mut dims = [1u32; 4];
    for (d, &s) in dims.iter_mut().zip(shape) {
        *d = s as u32;
    }
    let header = DumpHeader {
        magic: MAGIC_DUMP,
        version: VERSION,
        dtype: DTYPE_F32,
        rank: shape.len() as u32,
        dims,
        frac_bits,
        reserved: 0,
    };
    let values = to_f32_vec(tensor)?;
    let mut w = BufWriter::new(fs::File::create(path)?);
    w.write_all(bytemuck::bytes_of(&header))?;
    for v in &values {
        w.write_all(&v.to_le_bytes())?;
    }
    w.flush()?;
    Ok(())
}

/// A dump read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct DumpFile {
    pub header: DumpHeader,
    pub values: Vec<f32>,
}

impl DumpFile {
    pub fn shape(&self) -> &[u32] {
        &self.header.dims[..self.header.rank as usize]
    }
}

pub fn load_dump(path: &Path) -> Result<DumpFile> {
    let data = fs::read(path)?;
    let header_len = mem::size_of::<DumpHeader>();
    if data.len() < header_len {
        return Err(QuantError::Shape(format!("file too small: {}", path.display())));
    }

    let header: DumpHeader = bytemuck::pod_read_unaligned(&data[..header_len]);
    if header.magic != MAGIC_DUMP {
        return Err(QuantError::Shape(format!("bad magic in {}", path.display())));
    }
    if header.dtype != DTYPE_F32 || header.rank > 4 {
        return Err(QuantError::Shape(format!("unexpected layout in {}", path.display())));
    }

    let count: usize = header.dims.iter().map(|&d| d as usize).product();
    let expected = header_len + count * mem::size_of::<f32>();
    if data.len() != expected {
        return Err(QuantError::Shape(format!(
            "size mismatch in {} (got {}, expect {expected})",
            path.display(),
            data.len()
        )));
    }

    let values = data[header_len..]
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(DumpFile { header, values })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::header::FLOAT_DOMAIN;
    use candle_core::Device;
    use tempfile::TempDir;

    #[test]
    fn dump_round_trip() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("output.bin");
        let xs = Tensor::new(&[[1f32, -2.0, 3.5], [0.0, 4.0, -8.25]], &Device::Cpu)?;
        write_dump(&path, &xs, 7)?;

        let dump = load_dump(&path)?;
        assert_eq!(dump.shape(), &[2, 3]);
        assert_eq!(dump.header.frac_bits, 7);
        assert_eq!(dump.values, vec![1.0, -2.0, 3.5, 0.0, 4.0, -8.25]);
        Ok(())
    }

    #[test]
    fn truncated_dump_is_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("input.bin");
        write_dump(&path, &Tensor::ones((2, 2), candle_core::DType::F32, &Device::Cpu)?, FLOAT_DOMAIN)?;
        let mut bytes = fs::read(&path)?;
        bytes.truncate(bytes.len() - 4);
        fs::write(&path, bytes)?;
        assert!(matches!(load_dump(&path), Err(QuantError::Shape(_))));
        Ok(())
    }
}
