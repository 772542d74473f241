use super::kernels::conv2d_i64;
use super::{
    finish_integers, finish_tensor, input_integers, to_i64_vec, DumpTensor, Emulation, FixedPointLayer,
    QuantizedWeights,
};
use crate::error::Result;
use crate::nn::{Conv2d, Conv2dConfig};
use crate::solver::LayerQuantParams;
use candle_core::Tensor;

/// Fixed-point convolution, plain or with a folded batch norm.
#[derive(Debug)]
pub struct FixedConv2d {
    weights: QuantizedWeights,
    config: Conv2dConfig,
    params: LayerQuantParams,
    emulation: Emulation,
    fused_bn: bool,
}

impl FixedConv2d {
    pub fn new(name: &str, conv: &Conv2d, params: LayerQuantParams, emulation: Emulation) -> Result<Self> {
        let weights = QuantizedWeights::new(name, &conv.weight, conv.bias.as_ref(), &params)?;
        Ok(Self {
            weights,
            config: conv.config,
            params,
            emulation,
            fused_bn: conv.fused_bn,
        })
    }

    fn forward_double(&self, xs: &Tensor) -> Result<Tensor> {
        let Conv2dConfig {
            padding,
            stride,
            dilation,
            groups,
        } = self.config;
        let acc = xs.conv2d(&self.weights.weight, padding, stride, dilation, groups)?;
        let acc = match &self.weights.bias {
            Some(b) => acc.broadcast_add(&b.reshape((1, b.elem_count(), 1, 1))?)?,
            None => acc,
        };
        finish_tensor(&acc, &self.params, &self.emulation.accumulator)
    }

    fn forward_integer(&self, xs: &Tensor) -> Result<Tensor> {
        let (acc, shape) = conv2d_i64(
            &to_i64_vec(xs)?,
            xs.dims4()?,
            &self.weights.weight_int,
            self.weights.weight.dims4()?,
            self.weights.bias_int.as_deref(),
            &self.config,
            &self.emulation.accumulator,
        )?;
        let out = finish_integers(acc, &self.params);
        Ok(Tensor::from_vec(out, shape, xs.device())?)
    }
}

impl FixedPointLayer for FixedConv2d {
    fn name(&self) -> &'static str {
        if self.fused_bn {
            "fixed_convbn"
        } else {
            "fixed_conv2d"
        }
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs = input_integers(xs, &self.params.input)?;
        let out = if self.emulation.double_precision {
            self.forward_double(&xs)?
        } else {
            self.forward_integer(&xs)?
        };
        Ok(out.to_dtype(dtype)?)
    }

    fn params(&self) -> &LayerQuantParams {
        &self.params
    }

    fn dump_tensors(&self) -> Result<Vec<DumpTensor>> {
        self.weights.dump(&self.params)
    }
}
