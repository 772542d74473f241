use super::kernels::linear_i64;
use super::{
    finish_integers, finish_tensor, input_integers, to_i64_vec, DumpTensor, Emulation, FixedPointLayer,
    QuantizedWeights,
};
use crate::error::Result;
use crate::nn::Linear;
use crate::solver::LayerQuantParams;
use candle_core::Tensor;

#[derive(Debug)]
pub struct FixedLinear {
    weights: QuantizedWeights,
    params: LayerQuantParams,
    emulation: Emulation,
}

impl FixedLinear {
    pub fn new(name: &str, fc: &Linear, params: LayerQuantParams, emulation: Emulation) -> Result<Self> {
        Ok(Self {
            weights: QuantizedWeights::new(name, &fc.weight, fc.bias.as_ref(), &params)?,
            params,
            emulation,
        })
    }
}

impl FixedPointLayer for FixedLinear {
    fn name(&self) -> &'static str {
        "fixed_linear"
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs = input_integers(xs, &self.params.input)?;
        let out = if self.emulation.double_precision {
            let acc = xs.matmul(&self.weights.weight.t()?)?;
            let acc = match &self.weights.bias {
                Some(b) => acc.broadcast_add(b)?,
                None => acc,
            };
            finish_tensor(&acc, &self.params, &self.emulation.accumulator)?
        } else {
            let (n, features) = xs.dims2()?;
            let w_shape = self.weights.weight.dims2()?;
            let acc = linear_i64(
                &to_i64_vec(&xs)?,
                (n, features),
                &self.weights.weight_int,
                w_shape,
                self.weights.bias_int.as_deref(),
                &self.emulation.accumulator,
            )?;
            Tensor::from_vec(finish_integers(acc, &self.params), (n, w_shape.0), xs.device())?
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
