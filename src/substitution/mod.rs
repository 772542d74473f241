//! Fixed-point drop-in replacements for float layers.
//!
//! A substituted layer consumes integer-valued tensors on its input grid and
//! produces integer-valued tensors scaled by `2^out_frac_bits`, keeping the
//! shape contract of the layer it replaces.

pub mod conv;
pub mod kernels;
pub mod linear;
pub mod pool;

pub use conv::FixedConv2d;
pub use linear::FixedLinear;
pub use pool::{FixedGlobalAvgPool, FixedPool2d, PoolMode};

use crate::core::QuantConfig;
use crate::error::{QuantError, Result};
use crate::fixed_point::{quantize_tensor, roundnorm, roundnorm_tensor, Accumulator, QuantParams};
use crate::nn::{join_name, ConcatGrid, Layer, Network};
use crate::solver::{LayerQuantParams, Solution};
use candle_core::{DType, Tensor};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// A tensor a fixed layer exposes for bring-up dumps.
#[derive(Debug, Clone)]
pub struct DumpTensor {
    pub name: &'static str,
    pub tensor: Tensor,
    pub frac_bits: u32,
}

/// Layer emulating the accelerator's fixed-point arithmetic.
pub trait FixedPointLayer: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn forward(&self, xs: &Tensor) -> Result<Tensor>;

    fn params(&self) -> &LayerQuantParams;

    /// Fraction bits of every output value; divide by `2^out_frac_bits` to descale.
    fn out_frac_bits(&self) -> u32 {
        self.params().output.fraction_bits
    }

    /// Integer weight and bias as the accelerator would store them.
    fn dump_tensors(&self) -> Result<Vec<DumpTensor>> {
        Ok(Vec::new())
    }
}

/// How the accumulator is emulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Emulation {
    pub accumulator: Accumulator,
    /// f64 tensor ops with a single saturation instead of the per-MAC integer kernel.
    pub double_precision: bool,
}

impl Emulation {
    pub fn new(accum_bits: u32, double_precision: bool) -> Result<Self> {
        let accumulator = Accumulator::new(accum_bits)?;
        if double_precision && accum_bits > 53 {
            return Err(QuantError::config(
                "accum_bits",
                format!("{accum_bits} bits are not exact in double precision"),
            ));
        }
        Ok(Self {
            accumulator,
            double_precision,
        })
    }

    pub fn from_config(config: &QuantConfig) -> Result<Self> {
        Self::new(config.accum_bits, config.double_precision)
    }
}

/// Weights and bias on their integer grids, bias already moved to the accumulator grid.
#[derive(Debug, Clone)]
pub(crate) struct QuantizedWeights {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    pub weight_int: Vec<i64>,
    pub bias_int: Option<Vec<i64>>,
}

impl QuantizedWeights {
    pub fn new(layer: &str, weight: &Tensor, bias: Option<&Tensor>, params: &LayerQuantParams) -> Result<Self> {
        let w_fmt = params
            .weight
            .ok_or_else(|| QuantError::missing(layer, "weight format"))?;
        let weight = quantize_tensor(&weight.to_dtype(DType::F64)?, &w_fmt)?;

        let bias = match bias {
            Some(b) => {
                let b_fmt = params
                    .bias
                    .ok_or_else(|| QuantError::missing(layer, "bias format"))?;
                let b_q = quantize_tensor(&b.to_dtype(DType::F64)?, &b_fmt)?;
                let shift = b_fmt.fraction_bits as i32 - params.accumulator_frac_bits() as i32;
                Some(roundnorm_tensor(&b_q, shift)?)
            }
            None => None,
        };

        Ok(Self {
            weight_int: to_i64_vec(&weight)?,
            bias_int: bias.as_ref().map(to_i64_vec).transpose()?,
            weight,
            bias,
        })
    }

    pub fn dump(&self, params: &LayerQuantParams) -> Result<Vec<DumpTensor>> {
        let mut out = vec![DumpTensor {
            name: "weight",
            tensor: self.weight.to_dtype(DType::F32)?,
            frac_bits: params.weight.map_or(0, |w| w.fraction_bits),
        }];
        if let Some(b) = &self.bias {
            out.push(DumpTensor {
                name: "bias",
                tensor: b.to_dtype(DType::F32)?,
                frac_bits: params.accumulator_frac_bits(),
            });
        }
        Ok(out)
    }
}

/// Round and saturate an incoming activation onto `format`, in f64.
pub(crate) fn input_integers(xs: &Tensor, format: &QuantParams) -> Result<Tensor> {
    Ok(xs
        .to_dtype(DType::F64)?
        .round()?
        .clamp(format.qmin() as f64, format.qmax() as f64)?)
}

pub(crate) fn to_i64_vec(xs: &Tensor) -> Result<Vec<i64>> {
    Ok(xs
        .flatten_all()?
        .to_dtype(DType::F64)?
        .to_vec1::<f64>()?
        .into_iter()
        .map(|v| v as i64)
        .collect())
}

/// Saturate an f64 accumulator once, normalize and saturate to the output width.
pub(crate) fn finish_tensor(acc: &Tensor, params: &LayerQuantParams, accumulator: &Accumulator) -> Result<Tensor> {
    let acc = acc.clamp(accumulator.min() as f64, accumulator.max() as f64)?;
    let out = roundnorm_tensor(&acc, params.shift())?;
    Ok(out.clamp(params.output.qmin() as f64, params.output.qmax() as f64)?)
}

pub(crate) fn finish_integers(acc: Vec<i64>, params: &LayerQuantParams) -> Vec<f64> {
    let shift = params.shift();
    acc.into_iter()
        .map(|a| params.output.saturate(roundnorm(a, shift)) as f64)
        .collect()
}

/// Fail with the first layer that has no fixed-point equivalent. Never mutates.
///
/// With `fuse_bn`, a batch norm directly after a convolution is accepted since
/// fusion will remove it.
pub fn check_substitutable(model: &Network, fuse_bn: bool) -> Result<()> {
    check_children(&model.root().children, "", fuse_bn)
}

fn check_children(children: &[(String, Layer)], path: &str, fuse_bn: bool) -> Result<()> {
    let mut after_conv = false;
    for (name, child) in children {
        check_node(child, path, name, after_conv, fuse_bn)?;
        after_conv = matches!(child, Layer::Conv2d(_));
    }
    Ok(())
}

fn check_node(layer: &Layer, parent: &str, name: &str, after_conv: bool, fuse_bn: bool) -> Result<()> {
    let path = join_name(parent, name);
    match layer {
        Layer::Sequential(seq) => check_children(&seq.children, &path, fuse_bn),
        Layer::Concat(cat) => {
            for (branch_name, branch) in &cat.branches {
                check_node(branch, parent, branch_name, false, fuse_bn)?;
            }
            Ok(())
        }
        Layer::BatchNorm2d(_) if fuse_bn && after_conv => Ok(()),
        Layer::BatchNorm2d(_) => Err(QuantError::UnsupportedLayer {
            layer: path,
            kind: layer.kind().to_string(),
        }),
        Layer::AvgPool2d(pool) if pool.ceil_mode => Err(QuantError::UnsupportedLayer {
            layer: path,
            kind: "avgpool2d(ceil_mode)".to_string(),
        }),
        _ => Ok(()),
    }
}

/// Build the fixed-point replacement of `layer`, or `None` for layers that
/// are transparent to the fixed-point format.
pub fn create_fixed_layer(
    name: &str,
    layer: &Layer,
    solution: &Solution,
    emulation: Emulation,
) -> Result<Option<Box<dyn FixedPointLayer>>> {
    let layer_params = || {
        solution
            .layer(name)
            .cloned()
            .ok_or_else(|| QuantError::missing(name, "quantization parameters"))
    };
    let activation = || {
        solution
            .activation(name)
            .copied()
            .ok_or_else(|| QuantError::missing(name, "activation format"))
    };

    let fixed: Box<dyn FixedPointLayer> = match layer {
        Layer::Conv2d(conv) => Box::new(FixedConv2d::new(name, conv, layer_params()?, emulation)?),
        Layer::Linear(fc) => Box::new(FixedLinear::new(name, fc, layer_params()?, emulation)?),
        Layer::MaxPool2d(pool) => Box::new(FixedPool2d::new(*pool, PoolMode::Max, activation()?.input)),
        Layer::AvgPool2d(pool) => Box::new(FixedPool2d::new(*pool, PoolMode::Avg, activation()?.input)),
        Layer::AdaptiveAvgPool => Box::new(FixedGlobalAvgPool::new(activation()?.input)),
        Layer::BatchNorm2d(_) => {
            return Err(QuantError::UnsupportedLayer {
                layer: name.to_string(),
                kind: layer.kind().to_string(),
            })
        }
        Layer::Relu
        | Layer::Flatten
        | Layer::Dropout
        | Layer::Identity
        | Layer::Sequential(_)
        | Layer::Concat(_)
        | Layer::Fixed(_) => return Ok(None),
    };
    Ok(Some(fixed))
}

/// Replace every substitutable layer in place; returns how many were replaced.
///
/// Concat points stay in place and get their integer grid, so branches that
/// emit another format are requantized before joining.
pub fn substitute_layers(model: &mut Network, solution: &Solution, emulation: Emulation) -> Result<usize> {
    let mut replaced = 0;
    model.walk_mut(&mut |name, layer| {
        if let Layer::Concat(cat) = layer {
            let params = solution
                .concats
                .get(name)
                .ok_or_else(|| QuantError::missing(name, "concat parameters"))?;
            let grid = ConcatGrid {
                branches: params.branches.iter().map(|b| b.produced).collect(),
                output: params.output,
            };
            for (branch, from) in params.branches.iter().zip(&grid.branches) {
                if *from != grid.output {
                    debug!("{name}: {} moves from {from} to {}", branch.name, grid.output);
                }
            }
            cat.grid = Some(grid);
            return Ok(());
        }
        if let Some(fixed) = create_fixed_layer(name, layer, solution, emulation)? {
            debug!("{name}: {} -> {}", layer.kind(), fixed.name());
            *layer = Layer::Fixed(fixed);
            replaced += 1;
        }
        Ok(())
    })?;
    Ok(replaced)
}

/// Layers rewritten by [`fuse_conv_bn`], kept so the fold can be undone.
#[derive(Debug, Default)]
pub struct ConvBnFusion {
    originals: Vec<(String, Layer)>,
    folded: usize,
}

impl ConvBnFusion {
    /// Number of batch norms folded.
    pub fn count(&self) -> usize {
        self.folded
    }

    /// Put the convolutions and batch norms back the way they were.
    pub fn undo(self, model: &mut Network) -> Result<()> {
        let mut originals: BTreeMap<String, Layer> = self.originals.into_iter().collect();
        model.walk_mut(&mut |name, layer| {
            if let Some(original) = originals.remove(name) {
                *layer = original;
            }
            Ok(())
        })?;
        debug!("restored {} batch norms", self.folded);
        Ok(())
    }
}

/// Fold every batch norm that directly follows a convolution into it.
/// The batch norm node becomes [`Layer::Identity`].
pub fn fuse_conv_bn(model: &mut Network) -> Result<ConvBnFusion> {
    let mut fusion = ConvBnFusion::default();
    fuse_sequence(&mut model.root_mut().children, "", &mut fusion)?;
    Ok(fusion)
}

fn fuse_sequence(children: &mut [(String, Layer)], path: &str, fusion: &mut ConvBnFusion) -> Result<()> {
    for i in 1..children.len() {
        let (head, tail) = children.split_at_mut(i);
        let (conv_name, conv_layer) = &mut head[i - 1];
        let (bn_name, bn_layer) = &mut tail[0];
        let folded = match (conv_layer, &*bn_layer) {
            (Layer::Conv2d(conv), Layer::BatchNorm2d(bn)) => {
                let original = conv.clone();
                conv.fuse_batch_norm(bn)?;
                fusion
                    .originals
                    .push((join_name(path, conv_name), Layer::Conv2d(original)));
                fusion
                    .originals
                    .push((join_name(path, bn_name), Layer::BatchNorm2d(bn.clone())));
                debug!("folded {bn_name} into {conv_name}");
                true
            }
            _ => false,
        };
        if folded {
            *bn_layer = Layer::Identity;
            fusion.folded += 1;
        }
    }
    for (name, child) in children.iter_mut() {
        fuse_nested(child, path, name, fusion)?;
    }
    Ok(())
}

fn fuse_nested(layer: &mut Layer, parent: &str, name: &str, fusion: &mut ConvBnFusion) -> Result<()> {
    match layer {
        Layer::Sequential(seq) => fuse_sequence(&mut seq.children, &join_name(parent, name), fusion),
        Layer::Concat(cat) => {
            for (branch_name, branch) in &mut cat.branches {
                fuse_nested(branch, parent, branch_name, fusion)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
