//! Turn calibrated ranges into per-layer Q-formats.
//!
//! Every tensor is fitted on its own with [`QuantParams::from_range`]. The
//! network is then walked in forward order carrying the current activation
//! format, so each layer's input format is exactly the format its producer
//! emits. Concatenation points force the last quantizable layer of every
//! branch onto one shared output grid.

use crate::calibration::{CalibrationStats, ValueRange};
use crate::core::QuantConfig;
use crate::error::{QuantError, Result};
use crate::fixed_point::QuantParams;
use crate::nn::{join_name, Layer, Network};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

/// Quantization record of one layer, as persisted to `<layer>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerQuantParams {
    pub kind: String,
    pub input: QuantParams,
    pub output: QuantParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<QuantParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bias: Option<QuantParams>,
    /// Right shift applied to the accumulator, stored as a one-element list.
    pub norm: Vec<i32>,
}

impl LayerQuantParams {
    /// Record for a weightless layer that keeps its input format.
    pub fn passthrough(kind: impl Into<String>, format: QuantParams) -> Self {
        Self {
            kind: kind.into(),
            input: format,
            output: format,
            weight: None,
            bias: None,
            norm: vec![0],
        }
    }

    pub fn shift(&self) -> i32 {
        self.norm.first().copied().unwrap_or(0)
    }

    /// Fraction bits of the accumulator: input plus weight fraction bits.
    pub fn accumulator_frac_bits(&self) -> u32 {
        self.input.fraction_bits + self.weight.map_or(0, |w| w.fraction_bits)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcatBranch {
    pub name: String,
    /// Last quantizable layer of the branch, forced onto the concat grid.
    pub layer: Option<String>,
    /// Output format that layer would have had on its own.
    pub calibrated: Option<QuantParams>,
    /// Format the branch actually emits. Branches without a quantizable
    /// layer keep their input format and are moved onto the concat grid.
    pub produced: QuantParams,
}

/// Record of one concatenation point, as persisted to `<concat>.cat.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcatParams {
    pub branches: Vec<ConcatBranch>,
    pub output: QuantParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorRole {
    Input,
    Output,
    Weight,
    Bias,
}

impl fmt::Display for TensorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TensorRole::Input => "input",
            TensorRole::Output => "output",
            TensorRole::Weight => "weight",
            TensorRole::Bias => "bias",
        })
    }
}

/// A range that did not fit the configured width and will saturate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverflowWarning {
    pub layer: String,
    pub tensor: TensorRole,
    pub required_integer_bits: u32,
    pub available_integer_bits: u32,
    /// Negative values met an unsigned format and will read as zero.
    #[serde(default)]
    pub negative_clipped: bool,
}

impl fmt::Display for OverflowWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.required_integer_bits > self.available_integer_bits {
            write!(
                f,
                "{} {} needs {} integer bits, only {} available; values will saturate",
                self.layer, self.tensor, self.required_integer_bits, self.available_integer_bits
            )?;
            if self.negative_clipped {
                f.write_str(", negative values clip to zero")?;
            }
            Ok(())
        } else {
            write!(
                f,
                "{} {} has negative values in an unsigned format; they clip to zero",
                self.layer, self.tensor
            )
        }
    }
}

/// Formats flowing into and out of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationFormat {
    pub input: QuantParams,
    pub output: QuantParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Solution {
    /// Quantizable layers keyed by qualified name.
    pub layers: BTreeMap<String, LayerQuantParams>,
    pub concats: BTreeMap<String, ConcatParams>,
    /// Format of the network input.
    pub input: Option<QuantParams>,
    /// Formats of every node, containers included.
    pub activations: BTreeMap<String, ActivationFormat>,
    pub warnings: Vec<OverflowWarning>,
}

impl Solution {
    pub fn layer(&self, name: &str) -> Option<&LayerQuantParams> {
        self.layers.get(name)
    }

    pub fn activation(&self, name: &str) -> Option<&ActivationFormat> {
        self.activations.get(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSolver {
    bits: u32,
    signed: bool,
    raw_input: bool,
    default_range: f32,
}

impl ParamSolver {
    pub fn new(bits: u32, signed: bool, raw_input: bool, default_range: f32) -> Result<Self> {
        QuantParams::magnitude_bits(bits, signed)?;
        if !(default_range.is_finite() && default_range > 0.0) {
            return Err(QuantError::config(
                "default_range",
                format!("{default_range} is not a positive finite value"),
            ));
        }
        Ok(Self {
            bits,
            signed,
            raw_input,
            default_range,
        })
    }

    pub fn from_config(config: &QuantConfig) -> Result<Self> {
        Self::new(config.bits, config.signed, config.raw_input, config.default_range)
    }

    pub fn solve(&self, model: &Network, stats: &CalibrationStats) -> Result<Solution> {
        let mut pass = SolvePass {
            solver: self,
            stats,
            forced: BTreeMap::new(),
            solution: Solution::default(),
        };

        let input = if self.raw_input {
            QuantParams::integer(self.bits, self.signed)?
        } else {
            pass.fit("input", TensorRole::Input, &stats.network_input)?
        };
        pass.solution.input = Some(input);

        let mut format = input;
        for (name, child) in &model.root().children {
            format = pass.propagate(child, "", name, format)?;
        }

        debug!(
            "solved {} layers, {} concat points, {} overflow warnings",
            pass.solution.layers.len(),
            pass.solution.concats.len(),
            pass.solution.warnings.len()
        );
        Ok(pass.solution)
    }
}

struct SolvePass<'a> {
    solver: &'a ParamSolver,
    stats: &'a CalibrationStats,
    /// Output formats imposed by enclosing concat points.
    forced: BTreeMap<String, QuantParams>,
    solution: Solution,
}

impl SolvePass<'_> {
    fn fit(&mut self, layer: &str, role: TensorRole, range: &ValueRange) -> Result<QuantParams> {
        let (lo, hi) = range.bounds_or(self.solver.default_range);
        let fit = QuantParams::from_range(lo, hi, self.solver.bits, self.solver.signed)?;
        if fit.clamped {
            let warning = OverflowWarning {
                layer: layer.to_string(),
                tensor: role,
                required_integer_bits: fit.required_integer_bits,
                available_integer_bits: fit.params.integer_bits,
                negative_clipped: fit.negative_clipped,
            };
            warn!("{warning}");
            self.solution.warnings.push(warning);
        }
        Ok(fit.params)
    }

    fn propagate(&mut self, layer: &Layer, parent: &str, name: &str, input: QuantParams) -> Result<QuantParams> {
        let path = join_name(parent, name);
        let output = match layer {
            Layer::Sequential(seq) => {
                let mut format = input;
                for (child_name, child) in &seq.children {
                    format = self.propagate(child, &path, child_name, format)?;
                }
                format
            }
            Layer::Concat(cat) => {
                let range = self.stats.concats.get(&path).copied().unwrap_or_default();
                let output = self.fit(&path, TensorRole::Output, &range)?;
                let mut lasts = Vec::with_capacity(cat.branches.len());
                for (branch_name, branch) in &cat.branches {
                    let last = last_quantizable(branch, parent, branch_name);
                    let calibrated = match &last {
                        Some(l) => self.calibrated_output(l)?,
                        None => None,
                    };
                    if let Some(l) = &last {
                        self.forced.insert(l.clone(), output);
                    }
                    lasts.push((last, calibrated));
                }
                let mut branches = Vec::with_capacity(cat.branches.len());
                for ((branch_name, branch), (layer, calibrated)) in cat.branches.iter().zip(lasts) {
                    let name = join_name(parent, branch_name);
                    let produced = self.propagate(branch, parent, branch_name, input)?;
                    if produced != output {
                        debug!("{path}: branch {name} emits {produced}, requantized to {output}");
                    }
                    branches.push(ConcatBranch {
                        name,
                        layer,
                        calibrated,
                        produced,
                    });
                }
                self.solution
                    .concats
                    .insert(path.clone(), ConcatParams { branches, output });
                output
            }
            Layer::Conv2d(_) | Layer::Linear(_) => {
                let params = self.solve_layer(&path, layer, input)?;
                let output = params.output;
                self.solution.layers.insert(path.clone(), params);
                output
            }
            Layer::Fixed(f) => f.params().output,
            Layer::BatchNorm2d(_) => {
                debug!("{path}: batch norm is not requantized, keeping {input}");
                input
            }
            _ => input,
        };
        self.solution
            .activations
            .insert(path, ActivationFormat { input, output });
        Ok(output)
    }

    fn calibrated_output(&mut self, layer: &str) -> Result<Option<QuantParams>> {
        let Some(range) = self.stats.layers.get(layer).map(|s| s.output) else {
            return Ok(None);
        };
        let (lo, hi) = range.bounds_or(self.solver.default_range);
        let fit = QuantParams::from_range(lo, hi, self.solver.bits, self.solver.signed)?;
        Ok(Some(fit.params))
    }

    fn solve_layer(&mut self, path: &str, layer: &Layer, input: QuantParams) -> Result<LayerQuantParams> {
        let stats = self
            .stats
            .layers
            .get(path)
            .cloned()
            .ok_or_else(|| QuantError::missing(path, "calibration statistics"))?;

        let calibrated_in = self.fit(path, TensorRole::Input, &stats.input)?;
        if calibrated_in != input {
            debug!("{path}: calibrated input {calibrated_in}, producer emits {input}");
        }

        let weight = self.fit(path, TensorRole::Weight, &stats.weight)?;
        let bias = match &stats.bias {
            Some(range) => Some(self.fit(path, TensorRole::Bias, range)?),
            None => None,
        };
        let output = match self.forced.get(path) {
            Some(forced) => *forced,
            None => self.fit(path, TensorRole::Output, &stats.output)?,
        };

        let norm = input.fraction_bits as i32 + weight.fraction_bits as i32 - output.fraction_bits as i32;
        debug!("{path}: in {input} w {weight} out {output} norm {norm}");
        Ok(LayerQuantParams {
            kind: layer.kind().to_string(),
            input,
            output,
            weight: Some(weight),
            bias,
            norm: vec![norm],
        })
    }
}

/// Name of the last quantizable layer reached in forward order through `layer`.
fn last_quantizable(layer: &Layer, parent: &str, name: &str) -> Option<String> {
    let path = join_name(parent, name);
    match layer {
        Layer::Sequential(seq) => seq
            .children
            .iter()
            .rev()
            .find_map(|(child_name, child)| last_quantizable(child, &path, child_name)),
        // the inner concat owns its branches' formats
        Layer::Concat(_) => None,
        l if l.is_quantizable() => Some(path),
        _ => None,
    }
}
