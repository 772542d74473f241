//! Max and average pooling with padding and ceil mode.

use crate::error::{QuantError, Result};
use candle_core::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pool2d {
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    pub ceil_mode: bool,
}

impl Pool2d {
    pub fn new(kernel: usize, stride: usize) -> Self {
        Self {
            kernel,
            stride,
            padding: 0,
            ceil_mode: false,
        }
    }

    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_ceil_mode(mut self, ceil_mode: bool) -> Self {
        self.ceil_mode = ceil_mode;
        self
    }

    pub fn output_size(&self, input: usize) -> Result<usize> {
        let padded = input + 2 * self.padding;
        if self.kernel == 0 || self.stride == 0 || padded < self.kernel {
            return Err(QuantError::Shape(format!(
                "pooling window {} (stride {}) does not fit input {input} with padding {}",
                self.kernel, self.stride, self.padding
            )));
        }
        let span = padded - self.kernel;
        let mut out = if self.ceil_mode {
            span.div_ceil(self.stride) + 1
        } else {
            span / self.stride + 1
        };
        // the last window has to start inside the input or the left padding
        if self.ceil_mode && (out - 1) * self.stride >= input + self.padding {
            out -= 1;
        }
        Ok(out)
    }

    /// Pad `xs` so a plain strided window produces the configured output size.
    fn pad(&self, xs: &Tensor, value: f64) -> Result<Tensor> {
        let (_, _, h, w) = xs.dims4()?;
        let (oh, ow) = (self.output_size(h)?, self.output_size(w)?);
        let bottom = ((oh - 1) * self.stride + self.kernel).saturating_sub(h + self.padding);
        let right = ((ow - 1) * self.stride + self.kernel).saturating_sub(w + self.padding);
        let xs = pad_with_value(xs, 2, self.padding, bottom, value)?;
        pad_with_value(&xs, 3, self.padding, right, value)
    }

    pub fn max(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.pad(xs, f64::NEG_INFINITY)?;
        Ok(xs.max_pool2d_with_stride(self.kernel, self.stride)?)
    }

    /// Average pooling; zero padding counts towards the window size.
    pub fn avg(&self, xs: &Tensor) -> Result<Tensor> {
        if self.ceil_mode {
            return Err(QuantError::config(
                "ceil_mode",
                "average pooling with ceil_mode is not supported",
            ));
        }
        let xs = self.pad(xs, 0.0)?;
        Ok(xs.avg_pool2d_with_stride(self.kernel, self.stride)?)
    }
}

fn pad_with_value(xs: &Tensor, dim: usize, before: usize, after: usize, value: f64) -> Result<Tensor> {
    if before == 0 && after == 0 {
        return Ok(xs.clone());
    }
    let mut parts = Vec::with_capacity(3);
    let block = |len: usize| -> Result<Tensor> {
        let mut dims = xs.dims().to_vec();
        dims[dim] = len;
        Ok(Tensor::full(value, dims, xs.device())?.to_dtype(xs.dtype())?)
    };
    if before > 0 {
        parts.push(block(before)?);
    }
    parts.push(xs.clone());
    if after > 0 {
        parts.push(block(after)?);
    }
    Ok(Tensor::cat(&parts, dim)?)
}
