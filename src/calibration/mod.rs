//! Calibration: observe per-layer value ranges over representative data.
//!
//! Weight and bias ranges are read once when the collector is built; input and
//! output activation ranges accumulate over every batch. Concatenation points
//! record the range of their joined output.

pub mod data;

pub use data::{load_image, DataLoader, Dataset, ImageFolder, TensorDataset};

use crate::error::{QuantError, Result};
use crate::nn::{ForwardObserver, Layer, Network};
use crate::utils::finite_min_max;
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Running min/max over every value observed so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f32,
    pub max: f32,
    /// Number of observations that contributed finite values.
    pub observations: u64,
}

impl ValueRange {
    pub fn of(xs: &Tensor) -> Result<Self> {
        let mut range = Self::default();
        range.observe(xs)?;
        Ok(range)
    }

    pub fn observe(&mut self, xs: &Tensor) -> Result<()> {
        if let Some((lo, hi)) = finite_min_max(xs)? {
            self.merge(lo, hi);
        }
        Ok(())
    }

    pub fn merge(&mut self, lo: f32, hi: f32) {
        if self.observations == 0 {
            self.min = lo;
            self.max = hi;
        } else {
            self.min = self.min.min(lo);
            self.max = self.max.max(hi);
        }
        self.observations += 1;
    }

    pub fn max_abs(&self) -> f32 {
        self.min.abs().max(self.max.abs())
    }

    /// Observed bounds, or `[-default, default]` when nothing non-zero was seen.
    pub fn bounds_or(&self, default: f32) -> (f32, f32) {
        if self.observations == 0 || self.max_abs() == 0.0 {
            (-default, default)
        } else {
            (self.min, self.max)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerStats {
    pub kind: String,
    pub weight: ValueRange,
    pub bias: Option<ValueRange>,
    pub input: ValueRange,
    pub output: ValueRange,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStats {
    pub layers: BTreeMap<String, LayerStats>,
    pub concats: BTreeMap<String, ValueRange>,
    pub network_input: ValueRange,
    pub batches: usize,
    pub samples: usize,
}

/// Forward observer accumulating [`CalibrationStats`].
#[derive(Debug, Default)]
pub struct StatsCollector {
    stats: CalibrationStats,
}

impl StatsCollector {
    /// Record the static weight and bias ranges of every quantizable layer.
    pub fn new(model: &Network) -> Result<Self> {
        let mut layers = BTreeMap::new();
        let mut err = None;
        model.walk(&mut |name, layer| {
            let Some((weight, bias)) = layer.weight_and_bias() else {
                return;
            };
            let entry = (|| -> Result<LayerStats> {
                Ok(LayerStats {
                    kind: layer.kind().to_string(),
                    weight: ValueRange::of(weight)?,
                    bias: bias.map(ValueRange::of).transpose()?,
                    input: ValueRange::default(),
                    output: ValueRange::default(),
                })
            })();
            match entry {
                Ok(stats) => {
                    layers.insert(name.to_string(), stats);
                }
                Err(e) => {
                    err.get_or_insert(e);
                }
            }
        });
        if let Some(e) = err {
            return Err(e);
        }

        let mut concats = BTreeMap::new();
        model.walk(&mut |name, layer| {
            if matches!(layer, Layer::Concat(_)) {
                concats.insert(name.to_string(), ValueRange::default());
            }
        });

        Ok(Self {
            stats: CalibrationStats {
                layers,
                concats,
                ..Default::default()
            },
        })
    }

    pub fn observe_batch(&mut self, model: &Network, batch: &Tensor) -> Result<Tensor> {
        self.stats.network_input.observe(batch)?;
        let out = model.forward_with(batch, self)?;
        self.stats.batches += 1;
        self.stats.samples += batch.dim(0)?;
        Ok(out)
    }

    pub fn finish(self) -> CalibrationStats {
        self.stats
    }
}

impl ForwardObserver for StatsCollector {
    fn observe(&mut self, name: &str, layer: &Layer, input: &Tensor, output: &Tensor) -> Result<()> {
        if layer.is_quantizable() {
            if let Some(stats) = self.stats.layers.get_mut(name) {
                stats.input.observe(input)?;
                stats.output.observe(output)?;
            }
        } else if let Layer::Concat(_) = layer {
            if let Some(range) = self.stats.concats.get_mut(name) {
                range.observe(output)?;
            }
        }
        Ok(())
    }
}

/// Run every calibration batch through `model` in evaluation mode.
pub fn collect_statistics<D: Dataset>(
    model: &Network,
    loader: &DataLoader<'_, D>,
    device: &Device,
    verbose: bool,
) -> Result<CalibrationStats> {
    let mut collector = StatsCollector::new(model)?;
    let total = loader.num_batches();
    for (i, batch) in loader.iter().enumerate() {
        let batch = batch?.to_device(device)?;
        collector.observe_batch(model, &batch)?;
        if verbose {
            info!("calibration batch {}/{total}", i + 1);
        } else {
            debug!("calibration batch {}/{total}", i + 1);
        }
    }

    let stats = collector.finish();
    if stats.samples == 0 {
        return Err(QuantError::data_source("<calibration>", "no samples were processed"));
    }
    for (name, layer) in &stats.layers {
        if layer.output.observations == 0 {
            debug!("{name} was never reached during calibration");
        }
    }
    Ok(stats)
}
