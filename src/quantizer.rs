//! The quantization pipeline over one borrowed network.
//!
//! ```text
//! Configured -> StatisticsCollected -> ParametersSolved -> WeightsQuantized
//!            -> [LayersSubstituted] -> Ready
//! ```
//!
//! A quantizer runs once. Calibration statistics are never reset, so calling
//! [`ModelQuantizer::quantize_model`] a second time is a state error rather
//! than a silent double quantization.

use crate::calibration::{collect_statistics, load_image, CalibrationStats, DataLoader, Dataset, ImageFolder};
use crate::core::{
    compare_with_reference, write_dump, write_params, EmulationError, QuantConfig, QuantizationReport,
    FLOAT_DOMAIN,
};
use crate::error::{QuantError, Result};
use crate::fixed_point::{snap_tensor, QuantParams};
use crate::nn::{ForwardObserver, Layer, Network};
use crate::solver::{LayerQuantParams, ParamSolver, Solution};
use crate::substitution::{check_substitutable, fuse_conv_bn, substitute_layers, ConvBnFusion, Emulation};
use crate::transforms::Compose;
use candle_core::{Device, Tensor};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantizerState {
    Configured,
    StatisticsCollected,
    ParametersSolved,
    WeightsQuantized,
    LayersSubstituted,
    Ready,
}

impl QuantizerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuantizerState::Configured => "configured",
            QuantizerState::StatisticsCollected => "statistics-collected",
            QuantizerState::ParametersSolved => "parameters-solved",
            QuantizerState::WeightsQuantized => "weights-quantized",
            QuantizerState::LayersSubstituted => "layers-substituted",
            QuantizerState::Ready => "ready",
        }
    }
}

impl std::fmt::Display for QuantizerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quantizes a network in place. Holds exclusive access to the network for
/// its whole lifetime; callers must not share one `save_folder` between
/// concurrently running quantizers.
pub struct ModelQuantizer<'m> {
    model: &'m mut Network,
    config: QuantConfig,
    transform: Arc<Compose>,
    state: QuantizerState,
    device: Device,
    stats: Option<CalibrationStats>,
    solution: Option<Solution>,
}

impl<'m> ModelQuantizer<'m> {
    pub fn new(model: &'m mut Network, config: QuantConfig, transform: Arc<Compose>) -> Result<Self> {
        config.validate()?;
        if let Some(channels) = model.input_channels() {
            if channels != config.num_input_channels {
                return Err(QuantError::config(
                    "num_input_channels",
                    format!(
                        "configured {} but the first convolution takes {channels}",
                        config.num_input_channels
                    ),
                ));
            }
        }
        Ok(Self {
            model,
            config,
            transform,
            state: QuantizerState::Configured,
            device: Device::Cpu,
            stats: None,
            solution: None,
        })
    }

    pub fn state(&self) -> QuantizerState {
        self.state
    }

    pub fn config(&self) -> &QuantConfig {
        &self.config
    }

    pub fn model(&self) -> &Network {
        self.model
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn stats(&self) -> Option<&CalibrationStats> {
        self.stats.as_ref()
    }

    pub fn solution(&self) -> Option<&Solution> {
        self.solution.as_ref()
    }

    /// Solved per-layer parameters, keyed by layer name.
    pub fn params(&self) -> Option<&BTreeMap<String, LayerQuantParams>> {
        self.solution.as_ref().map(|s| &s.layers)
    }

    /// Format the network input must be quantized to, e.g. by `QuantizeInput`.
    pub fn input_params(&self) -> Option<QuantParams> {
        self.solution.as_ref().and_then(|s| s.input)
    }

    /// Fraction bits of the network output when layers were substituted.
    pub fn out_frac_bits(&self) -> Option<u32> {
        self.model.out_frac_bits()
    }

    fn require(&self, operation: &'static str, expected: QuantizerState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(QuantError::State {
                operation,
                expected: expected.as_str(),
                actual: self.state.as_str(),
            })
        }
    }

    /// Calibrate on the images under `data_source` and quantize the network.
    pub fn quantize_model(&mut self) -> Result<QuantizationReport> {
        self.require("quantize_model", QuantizerState::Configured)?;
        let dataset = ImageFolder::open(&self.config.data_source, Arc::clone(&self.transform))?;
        self.quantize_with_dataset(&dataset)
    }

    /// Same as [`quantize_model`](Self::quantize_model) over any dataset.
    pub fn quantize_with_dataset<D: Dataset>(&mut self, dataset: &D) -> Result<QuantizationReport> {
        self.require("quantize_model", QuantizerState::Configured)?;
        let start = Instant::now();
        let config = self.config.clone();

        // everything that can be rejected up front, before the model changes
        if config.quantize_forward {
            check_substitutable(self.model, config.convbn)?;
        }
        let solver = ParamSolver::from_config(&config)?;
        let emulation = Emulation::from_config(&config)?;
        let loader = DataLoader::new(dataset, config.batch_size, config.num_workers)?;

        self.device = if config.use_gpu {
            Device::cuda_if_available(0)?
        } else {
            Device::Cpu
        };
        self.model.to_device(&self.device)?;

        let fusion = if config.convbn {
            let fusion = fuse_conv_bn(self.model)?;
            info!("folded {} batch norms into convolutions", fusion.count());
            Some(fusion)
        } else {
            None
        };
        let fused = fusion.as_ref().map_or(0, ConvBnFusion::count);

        // a failure before the weights are snapped undoes the fusion
        let (calibration_samples, solution, param_files) =
            match self.calibrate_and_solve(dataset, &loader, &solver, &config) {
                Ok(staged) => staged,
                Err(err) => {
                    if let Some(fusion) = fusion {
                        if let Err(undo) = fusion.undo(self.model) {
                            warn!("could not restore batch norms after a failed run: {undo}");
                        }
                    }
                    self.stats = None;
                    self.state = QuantizerState::Configured;
                    return Err(err);
                }
            };

        let quantized_layers = snap_weights(self.model, &solution)?;
        self.state = QuantizerState::WeightsQuantized;

        let substituted_layers = if config.quantize_forward {
            let replaced = substitute_layers(self.model, &solution, emulation)?;
            self.state = QuantizerState::LayersSubstituted;
            info!("substituted {replaced} layers with fixed-point equivalents");
            replaced
        } else {
            0
        };

        let report = QuantizationReport {
            quantized_layers,
            substituted_layers,
            fused_layers: fused,
            calibration_samples,
            param_files,
            warnings: solution.warnings.clone(),
            total_time_seconds: start.elapsed().as_secs_f32(),
        };
        self.solution = Some(solution);
        self.state = QuantizerState::Ready;
        info!(
            "quantized {} layers in {:.2}s ({} overflow warnings)",
            report.quantized_layers,
            report.total_time_seconds,
            report.warnings.len()
        );
        Ok(report)
    }

    /// Calibrate, solve and persist. Returns the sample count, the solution
    /// and the number of parameter files written.
    fn calibrate_and_solve<D: Dataset>(
        &mut self,
        dataset: &D,
        loader: &DataLoader<'_, D>,
        solver: &ParamSolver,
        config: &QuantConfig,
    ) -> Result<(usize, Solution, usize)> {
        info!(
            "calibrating on {} samples from {} in {} batches",
            dataset.len(),
            dataset.source().display(),
            loader.num_batches()
        );
        let stats = collect_statistics(self.model, loader, &self.device, config.verbose)?;
        let calibration_samples = stats.samples;
        self.state = QuantizerState::StatisticsCollected;

        let solution = solver.solve(self.model, &stats)?;
        self.stats = Some(stats);
        self.state = QuantizerState::ParametersSolved;
        for (name, p) in &solution.layers {
            if config.verbose {
                info!("{name}: in {} w {:?} out {} norm {}", p.input, p.weight, p.output, p.shift());
            } else {
                debug!("{name}: in {} w {:?} out {} norm {}", p.input, p.weight, p.output, p.shift());
            }
        }

        let param_files = if config.save_params {
            let written = write_params(&config.save_folder, &solution)?;
            info!("wrote {written} parameter files to {}", config.save_folder.display());
            written
        } else {
            0
        };
        Ok((calibration_samples, solution, param_files))
    }

    /// Run `sample` through the quantized network and write every node's
    /// tensors under `save_folder/activations_dump/<layer>/`.
    pub fn dump_activations(&self, sample: &Path, transform: &Compose) -> Result<PathBuf> {
        self.require("dump_activations", QuantizerState::Ready)?;
        let solution = self
            .solution
            .as_ref()
            .ok_or_else(|| QuantError::missing("<network>", "solution"))?;

        let xs = load_image(sample, transform)?.unsqueeze(0)?.to_device(&self.device)?;
        let root = self.config.activations_dump_dir();
        fs::create_dir_all(&root)?;

        let mut observer = DumpObserver {
            root: root.clone(),
            solution,
            integer_domain: self.config.quantize_forward,
            written: 0,
        };
        write_dump(&root.join("input.bin"), &xs, observer.input_frac(solution.input))?;
        self.model.forward_with(&xs, &mut observer)?;
        info!("wrote {} activation dumps to {}", observer.written, root.display());
        Ok(root)
    }

    /// Compare the network output on `input` with a float `reference` output.
    pub fn emulation_error(&self, reference: &Tensor, input: &Tensor) -> Result<EmulationError> {
        self.require("emulation_error", QuantizerState::Ready)?;
        let out = self.model.forward(&input.to_device(&self.device)?)?;
        compare_with_reference(reference, &out, self.out_frac_bits().unwrap_or(0))
    }
}

/// Overwrite weights and biases with their nearest representable values.
fn snap_weights(model: &mut Network, solution: &Solution) -> Result<usize> {
    let mut snapped = 0;
    model.walk_mut(&mut |name, layer| {
        let Some(params) = solution.layer(name) else {
            return Ok(());
        };
        if let Some((weight, bias)) = layer.weight_and_bias_mut() {
            if let Some(w_fmt) = params.weight {
                *weight = snap_tensor(weight, &w_fmt)?;
            }
            if let (Some(bias), Some(b_fmt)) = (bias, params.bias) {
                *bias = snap_tensor(bias, &b_fmt)?;
            }
            snapped += 1;
        }
        Ok(())
    })?;
    Ok(snapped)
}

struct DumpObserver<'s> {
    root: PathBuf,
    solution: &'s Solution,
    integer_domain: bool,
    written: usize,
}

impl DumpObserver<'_> {
    fn input_frac(&self, format: Option<QuantParams>) -> i32 {
        match format {
            Some(f) if self.integer_domain => f.fraction_bits as i32,
            _ => FLOAT_DOMAIN,
        }
    }
}

impl ForwardObserver for DumpObserver<'_> {
    fn observe(&mut self, name: &str, layer: &Layer, input: &Tensor, output: &Tensor) -> Result<()> {
        let dir = self.root.join(name);
        fs::create_dir_all(&dir)?;
        let format = self.solution.activation(name);
        write_dump(&dir.join("input.bin"), input, self.input_frac(format.map(|f| f.input)))?;
        write_dump(&dir.join("output.bin"), output, self.input_frac(format.map(|f| f.output)))?;
        self.written += 2;

        if let Layer::Fixed(fixed) = layer {
            for dump in fixed.dump_tensors()? {
                write_dump(&dir.join(format!("{}.bin", dump.name)), &dump.tensor, dump.frac_bits as i32)?;
                self.written += 1;
            }
        }
        Ok(())
    }
}
