//! Host network model: a tree of named layers with a float forward pass.
//!
//! Names are dotted paths. Sequential children extend the path of their
//! container; concat branches are addressed relative to the module that
//! encloses the concat, so a fire module `features.3` holding a concat `cat`
//! with a branch `expand1x1` exposes `features.3.cat` and
//! `features.3.expand1x1`.

pub mod conv;
pub mod linear;
pub mod pool;
pub mod state;

pub use conv::{BatchNorm2d, Conv2d, Conv2dConfig};
pub use linear::Linear;
pub use pool::Pool2d;
pub use state::LoadReport;

use crate::error::{QuantError, Result};
use crate::fixed_point::{requantize_tensor, QuantParams};
use crate::substitution::FixedPointLayer;
use candle_core::{Device, Tensor};

#[derive(Debug)]
pub enum Layer {
    Conv2d(Conv2d),
    BatchNorm2d(BatchNorm2d),
    Linear(Linear),
    MaxPool2d(Pool2d),
    AvgPool2d(Pool2d),
    /// Global average pooling to a 1x1 map.
    AdaptiveAvgPool,
    Relu,
    Flatten,
    Dropout,
    Identity,
    Sequential(Sequential),
    Concat(Concat),
    Fixed(Box<dyn FixedPointLayer>),
}

impl Layer {
    pub fn kind(&self) -> &'static str {
        match self {
            Layer::Conv2d(c) if c.fused_bn => "convbn",
            Layer::Conv2d(_) => "conv2d",
            Layer::BatchNorm2d(_) => "batchnorm2d",
            Layer::Linear(_) => "linear",
            Layer::MaxPool2d(_) => "maxpool2d",
            Layer::AvgPool2d(_) => "avgpool2d",
            Layer::AdaptiveAvgPool => "adaptive_avgpool",
            Layer::Relu => "relu",
            Layer::Flatten => "flatten",
            Layer::Dropout => "dropout",
            Layer::Identity => "identity",
            Layer::Sequential(_) => "sequential",
            Layer::Concat(_) => "concat",
            Layer::Fixed(f) => f.name(),
        }
    }

    /// Layers carrying weights that get their own quantization parameters.
    pub fn is_quantizable(&self) -> bool {
        matches!(self, Layer::Conv2d(_) | Layer::Linear(_))
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Layer::Sequential(_) | Layer::Concat(_))
    }

    /// Weight and bias of a quantizable layer.
    pub fn weight_and_bias(&self) -> Option<(&Tensor, Option<&Tensor>)> {
        match self {
            Layer::Conv2d(c) => Some((&c.weight, c.bias.as_ref())),
            Layer::Linear(l) => Some((&l.weight, l.bias.as_ref())),
            _ => None,
        }
    }

    pub fn weight_and_bias_mut(&mut self) -> Option<(&mut Tensor, Option<&mut Tensor>)> {
        match self {
            Layer::Conv2d(c) => Some((&mut c.weight, c.bias.as_mut())),
            Layer::Linear(l) => Some((&mut l.weight, l.bias.as_mut())),
            _ => None,
        }
    }

    /// Named parameters in state-dict order.
    pub fn parameters(&self) -> Vec<(&'static str, &Tensor)> {
        match self {
            Layer::BatchNorm2d(bn) => vec![
                ("weight", &bn.weight),
                ("bias", &bn.bias),
                ("running_mean", &bn.running_mean),
                ("running_var", &bn.running_var),
            ],
            _ => match self.weight_and_bias() {
                Some((w, Some(b))) => vec![("weight", w), ("bias", b)],
                Some((w, None)) => vec![("weight", w)],
                None => Vec::new(),
            },
        }
    }

    pub fn parameters_mut(&mut self) -> Vec<(&'static str, &mut Tensor)> {
        match self {
            Layer::BatchNorm2d(bn) => vec![
                ("weight", &mut bn.weight),
                ("bias", &mut bn.bias),
                ("running_mean", &mut bn.running_mean),
                ("running_var", &mut bn.running_var),
            ],
            _ => match self.weight_and_bias_mut() {
                Some((w, Some(b))) => vec![("weight", w), ("bias", b)],
                Some((w, None)) => vec![("weight", w)],
                None => Vec::new(),
            },
        }
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Layer::Conv2d(c) => c.forward(xs),
            Layer::BatchNorm2d(bn) => bn.forward(xs),
            Layer::Linear(l) => l.forward(xs),
            Layer::MaxPool2d(p) => p.max(xs),
            Layer::AvgPool2d(p) => p.avg(xs),
            Layer::AdaptiveAvgPool => Ok(xs.mean_keepdim(3)?.mean_keepdim(2)?),
            Layer::Relu => Ok(xs.relu()?),
            Layer::Flatten => Ok(xs.flatten_from(1)?),
            Layer::Dropout | Layer::Identity => Ok(xs.clone()),
            Layer::Sequential(seq) => {
                let mut xs = xs.clone();
                for (_, child) in &seq.children {
                    xs = child.forward(&xs)?;
                }
                Ok(xs)
            }
            Layer::Concat(cat) => {
                let outs = cat
                    .branches
                    .iter()
                    .map(|(_, branch)| branch.forward(xs))
                    .collect::<Result<Vec<_>>>()?;
                cat.join(outs)
            }
            Layer::Fixed(f) => f.forward(xs),
        }
    }
}

impl From<Sequential> for Layer {
    fn from(seq: Sequential) -> Self {
        Layer::Sequential(seq)
    }
}

impl From<Concat> for Layer {
    fn from(cat: Concat) -> Self {
        Layer::Concat(cat)
    }
}

#[derive(Debug, Default)]
pub struct Sequential {
    pub children: Vec<(String, Layer)>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, name: impl Into<String>, layer: impl Into<Layer>) -> Self {
        self.children.push((name.into(), layer.into()));
        self
    }
}

/// Integer grids of a substituted concat: the format each branch emits and
/// the shared output format every branch is moved onto before joining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcatGrid {
    pub branches: Vec<QuantParams>,
    pub output: QuantParams,
}

/// Parallel branches over the same input, concatenated along channels.
#[derive(Debug, Default)]
pub struct Concat {
    pub branches: Vec<(String, Layer)>,
    /// Set once the network runs on integers.
    pub grid: Option<ConcatGrid>,
}

impl Concat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, name: impl Into<String>, layer: impl Into<Layer>) -> Self {
        self.branches.push((name.into(), layer.into()));
        self
    }

    /// Concatenate branch outputs along channels, regridding them first when
    /// the concat runs on integers.
    pub fn join(&self, outs: Vec<Tensor>) -> Result<Tensor> {
        let Some(grid) = &self.grid else {
            return Ok(Tensor::cat(&outs, 1)?);
        };
        if grid.branches.len() != outs.len() {
            return Err(QuantError::Shape(format!(
                "concat grid covers {} branches, got {} outputs",
                grid.branches.len(),
                outs.len()
            )));
        }
        let outs = outs
            .iter()
            .zip(&grid.branches)
            .map(|(out, from)| {
                if *from == grid.output {
                    Ok(out.clone())
                } else {
                    requantize_tensor(out, from.fraction_bits, &grid.output)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&outs, 1)?)
    }
}

/// Hook invoked after every named node of a forward pass, containers included.
pub trait ForwardObserver {
    fn observe(&mut self, name: &str, layer: &Layer, input: &Tensor, output: &Tensor)
        -> Result<()>;
}

pub fn join_name(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}.{name}")
    }
}

#[derive(Debug, Default)]
pub struct Network {
    root: Sequential,
}

impl Network {
    pub fn new(root: Sequential) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Sequential {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Sequential {
        &mut self.root
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for (_, child) in &self.root.children {
            xs = child.forward(&xs)?;
        }
        Ok(xs)
    }

    /// Forward pass reporting every node's input and output to `observer`.
    pub fn forward_with(&self, xs: &Tensor, observer: &mut dyn ForwardObserver) -> Result<Tensor> {
        let mut xs = xs.clone();
        for (name, child) in &self.root.children {
            xs = observed_forward(child, "", name, &xs, observer)?;
        }
        Ok(xs)
    }

    /// Pre-order walk over every node with its qualified name.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&str, &'a Layer)) {
        for (name, child) in &self.root.children {
            walk_node(child, "", name, f);
        }
    }

    pub fn walk_mut(&mut self, f: &mut dyn FnMut(&str, &mut Layer) -> Result<()>) -> Result<()> {
        for (name, child) in &mut self.root.children {
            walk_node_mut(child, "", name, f)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Layer> {
        let mut found = None;
        self.walk(&mut |n, layer| {
            if found.is_none() && n == name {
                found = Some(layer);
            }
        });
        found
    }

    /// Qualified names of quantizable layers in forward order.
    pub fn quantizable_layers(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.walk(&mut |name, layer| {
            if layer.is_quantizable() {
                names.push(name.to_string());
            }
        });
        names
    }

    /// Fraction bits of the network output once layers were substituted,
    /// taken from the last node in forward order that fixes a format.
    pub fn out_frac_bits(&self) -> Option<u32> {
        sequence_frac_bits(&self.root.children)
    }

    /// Channels the first convolution expects.
    pub fn input_channels(&self) -> Option<usize> {
        let mut channels = None;
        self.walk(&mut |_, layer| {
            if channels.is_none() {
                if let Layer::Conv2d(c) = layer {
                    channels = Some(c.in_channels());
                }
            }
        });
        channels
    }

    pub fn to_device(&mut self, device: &Device) -> Result<()> {
        self.walk_mut(&mut |_, layer| {
            for (_, t) in layer.parameters_mut() {
                *t = t.to_device(device)?;
            }
            Ok(())
        })
    }
}

fn observed_forward(
    layer: &Layer,
    parent: &str,
    name: &str,
    xs: &Tensor,
    observer: &mut dyn ForwardObserver,
) -> Result<Tensor> {
    let path = join_name(parent, name);
    let out = match layer {
        Layer::Sequential(seq) => {
            let mut out = xs.clone();
            for (child_name, child) in &seq.children {
                out = observed_forward(child, &path, child_name, &out, observer)?;
            }
            out
        }
        Layer::Concat(cat) => {
            let outs = cat
                .branches
                .iter()
                .map(|(branch_name, branch)| {
                    observed_forward(branch, parent, branch_name, xs, observer)
                })
                .collect::<Result<Vec<_>>>()?;
            cat.join(outs)?
        }
        leaf => leaf.forward(xs)?,
    };
    observer.observe(&path, layer, xs, &out)?;
    Ok(out)
}

fn sequence_frac_bits(children: &[(String, Layer)]) -> Option<u32> {
    children.iter().rev().find_map(|(_, child)| node_frac_bits(child))
}

fn node_frac_bits(layer: &Layer) -> Option<u32> {
    match layer {
        Layer::Fixed(f) => Some(f.out_frac_bits()),
        Layer::Sequential(seq) => sequence_frac_bits(&seq.children),
        Layer::Concat(cat) => match &cat.grid {
            Some(grid) => Some(grid.output.fraction_bits),
            None => cat.branches.iter().rev().find_map(|(_, b)| node_frac_bits(b)),
        },
        _ => None,
    }
}

fn walk_node<'a>(layer: &'a Layer, parent: &str, name: &str, f: &mut dyn FnMut(&str, &'a Layer)) {
    let path = join_name(parent, name);
    f(&path, layer);
    match layer {
        Layer::Sequential(seq) => {
            for (child_name, child) in &seq.children {
                walk_node(child, &path, child_name, f);
            }
        }
        Layer::Concat(cat) => {
            for (branch_name, branch) in &cat.branches {
                walk_node(branch, parent, branch_name, f);
            }
        }
        _ => {}
    }
}

fn walk_node_mut(
    layer: &mut Layer,
    parent: &str,
    name: &str,
    f: &mut dyn FnMut(&str, &mut Layer) -> Result<()>,
) -> Result<()> {
    let path = join_name(parent, name);
    f(&path, layer)?;
    match layer {
        Layer::Sequential(seq) => {
            for (child_name, child) in &mut seq.children {
                walk_node_mut(child, &path, child_name, f)?;
            }
        }
        Layer::Concat(cat) => {
            for (branch_name, branch) in &mut cat.branches {
                walk_node_mut(branch, parent, branch_name, f)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use candle_core::DType;

    /// conv1 -> relu -> fire(squeeze, cat(expand1x1, expand3x3)) -> pool -> flatten
    pub(crate) fn fire_net() -> Result<Network> {
        let dev = Device::Cpu;
        let conv = |out: usize, inp: usize, k: usize, pad: usize| -> Result<Conv2d> {
            let n = out * inp * k * k;
            let w: Vec<f32> = (0..n).map(|i| ((i % 7) as f32 - 3.0) * 0.05).collect();
            let b: Vec<f32> = (0..out).map(|i| i as f32 * 0.01).collect();
            Conv2d::new(
                Tensor::from_vec(w, (out, inp, k, k), &dev)?,
                Some(Tensor::from_vec(b, out, &dev)?),
                Conv2dConfig { padding: pad, ..Default::default() },
            )
        };
        let fire = Sequential::new()
            .push("squeeze", Layer::Conv2d(conv(2, 4, 1, 0)?))
            .push("squeeze_activation", Layer::Relu)
            .push(
                "cat",
                Concat::new()
                    .push("expand1x1", Layer::Conv2d(conv(3, 2, 1, 0)?))
                    .push("expand3x3", Layer::Conv2d(conv(3, 2, 3, 1)?)),
            );
        Ok(Network::new(
            Sequential::new()
                .push("conv1", Layer::Conv2d(conv(4, 1, 3, 1)?))
                .push("relu", Layer::Relu)
                .push("features", Sequential::new().push("3", fire))
                .push("pool", Layer::AdaptiveAvgPool)
                .push("flatten", Layer::Flatten),
        ))
    }

    struct Recorder(Vec<String>);

    impl ForwardObserver for Recorder {
        fn observe(&mut self, name: &str, _: &Layer, _: &Tensor, _: &Tensor) -> Result<()> {
            self.0.push(name.to_string());
            Ok(())
        }
    }

    #[test]
    fn concat_branches_are_named_after_enclosing_module() -> Result<()> {
        let net = fire_net()?;
        let mut names = Vec::new();
        net.walk(&mut |name, _| names.push(name.to_string()));
        assert!(names.contains(&"features.3.cat".to_string()));
        assert!(names.contains(&"features.3.expand1x1".to_string()));
        assert!(names.contains(&"features.3.expand3x3".to_string()));
        assert_eq!(
            net.quantizable_layers(),
            vec![
                "conv1",
                "features.3.squeeze",
                "features.3.expand1x1",
                "features.3.expand3x3"
            ]
        );
        Ok(())
    }

    #[test]
    fn observed_forward_matches_plain_forward() -> Result<()> {
        let net = fire_net()?;
        let xs = Tensor::rand(0f32, 1.0, (2, 1, 6, 6), &Device::Cpu)?;
        let plain = net.forward(&xs)?;
        let mut rec = Recorder(Vec::new());
        let observed = net.forward_with(&xs, &mut rec)?;
        assert_eq!(plain.dims(), &[2, 6]);
        let diff = (plain - observed)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        // children are reported before their container
        let squeeze = rec.0.iter().position(|n| n == "features.3.squeeze").unwrap();
        let fire = rec.0.iter().position(|n| n == "features.3").unwrap();
        assert!(squeeze < fire);
        assert_eq!(rec.0.last().map(String::as_str), Some("flatten"));
        Ok(())
    }

    #[test]
    fn gridded_concat_regrids_branches_and_sets_output_bits() -> Result<()> {
        let q = |int_bits| QuantParams::with_integer_bits(int_bits, 16, true);
        let mut cat = Concat::new().push("a", Layer::Identity).push("b", Layer::Identity);
        cat.grid = Some(ConcatGrid {
            branches: vec![q(0)?, q(2)?],
            output: q(2)?,
        });
        let net = Network::new(Sequential::new().push("cat", cat).push("flatten", Layer::Flatten));

        let xs = Tensor::new(&[[[[1024f32]]]], &Device::Cpu)?;
        // Q0.15 -> Q2.13 drops two fraction bits, the second branch is already there
        let ys = net.forward(&xs)?;
        assert_eq!(ys.flatten_all()?.to_vec1::<f32>()?, vec![256.0, 1024.0]);
        let mut rec = Recorder(Vec::new());
        assert_eq!(net.forward_with(&xs, &mut rec)?.flatten_all()?.to_vec1::<f32>()?, vec![256.0, 1024.0]);
        assert_eq!(net.out_frac_bits(), Some(13));
        Ok(())
    }

    #[test]
    fn input_channels_come_from_first_conv() -> Result<()> {
        let net = fire_net()?;
        assert_eq!(net.input_channels(), Some(1));
        assert_eq!(net.out_frac_bits(), None);
        assert_eq!(net.get("features.3.squeeze").map(Layer::kind), Some("conv2d"));
        let w = net.get("conv1").and_then(Layer::weight_and_bias).unwrap().0;
        assert_eq!(w.dtype(), DType::F32);
        Ok(())
    }
}
