//! Calibration data sources and the worker-pool batch loader.

use crate::error::{QuantError, Result};
use crate::transforms::Compose;
use crate::utils::is_image_file;
use candle_core::Tensor;
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Indexable calibration samples, each a `(C, H, W)` tensor.
pub trait Dataset: Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Result<Tensor>;

    /// Where the samples come from, for error messages.
    fn source(&self) -> PathBuf;
}

/// Images found directly inside a folder, decoded and transformed on demand.
#[derive(Debug, Clone)]
pub struct ImageFolder {
    root: PathBuf,
    files: Vec<PathBuf>,
    transform: Arc<Compose>,
}

impl ImageFolder {
    pub fn open(root: &Path, transform: Arc<Compose>) -> Result<Self> {
        let entries = fs::read_dir(root)
            .map_err(|e| QuantError::data_source(root, format!("cannot list directory: {e}")))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| QuantError::data_source(root, e.to_string()))?
                .path();
            if path.is_file() && is_image_file(&path) {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(QuantError::data_source(root, "no calibration images found"));
        }
        files.sort();
        debug!("found {} calibration images in {}", files.len(), root.display());
        Ok(Self {
            root: root.to_path_buf(),
            files,
            transform,
        })
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

/// Decode one image and run it through `transform`.
pub fn load_image(path: &Path, transform: &Compose) -> Result<Tensor> {
    let img = image::open(path).map_err(|e| QuantError::data_source(path, e.to_string()))?;
    transform.call(img)
}

impl Dataset for ImageFolder {
    fn len(&self) -> usize {
        self.files.len()
    }

    fn get(&self, index: usize) -> Result<Tensor> {
        load_image(&self.files[index], &self.transform)
    }

    fn source(&self) -> PathBuf {
        self.root.clone()
    }
}

/// Samples already held in memory.
#[derive(Debug, Clone, Default)]
pub struct TensorDataset {
    samples: Vec<Tensor>,
}

impl TensorDataset {
    pub fn new(samples: Vec<Tensor>) -> Self {
        Self { samples }
    }
}

impl Dataset for TensorDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<Tensor> {
        Ok(self.samples[index].clone())
    }

    fn source(&self) -> PathBuf {
        PathBuf::from("<memory>")
    }
}

/// Splits a dataset into batches, loading each batch on a bounded pool.
pub struct DataLoader<'d, D: Dataset> {
    dataset: &'d D,
    batch_size: usize,
    pool: Option<rayon::ThreadPool>,
}

impl<'d, D: Dataset> DataLoader<'d, D> {
    pub fn new(dataset: &'d D, batch_size: usize, num_workers: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(QuantError::config("batch_size", "must be at least 1"));
        }
        if dataset.is_empty() {
            return Err(QuantError::data_source(dataset.source(), "dataset is empty"));
        }
        let pool = if num_workers > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(num_workers)
                .thread_name(|idx| format!("calib-loader-{idx}"))
                .build()
                .map_err(|e| QuantError::config("num_workers", e.to_string()))?;
            Some(pool)
        } else {
            None
        };
        Ok(Self {
            dataset,
            batch_size,
            pool,
        })
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Batch `index` stacked into `(N, C, H, W)`.
    pub fn batch(&self, index: usize) -> Result<Tensor> {
        let start = index * self.batch_size;
        let end = (start + self.batch_size).min(self.dataset.len());
        let samples = match &self.pool {
            Some(pool) => pool.install(|| {
                (start..end)
                    .into_par_iter()
                    .map(|i| self.dataset.get(i))
                    .collect::<Result<Vec<_>>>()
            })?,
            None => (start..end)
                .map(|i| self.dataset.get(i))
                .collect::<Result<Vec<_>>>()?,
        };
        let first = samples[0].dims().to_vec();
        if let Some(odd) = samples.iter().find(|s| s.dims() != first.as_slice()) {
            return Err(QuantError::data_source(
                self.dataset.source(),
                format!("sample shapes differ within a batch: {first:?} vs {:?}", odd.dims()),
            ));
        }
        Ok(Tensor::stack(&samples, 0)?)
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<Tensor>> + '_ {
        (0..self.num_batches()).map(|i| self.batch(i))
    }
}
