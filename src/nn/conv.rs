//! 2D convolution and batch normalization.

use crate::error::{QuantError, Result};
use candle_core::{DType, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dConfig {
    pub padding: usize,
    pub stride: usize,
    pub dilation: usize,
    pub groups: usize,
}

impl Default for Conv2dConfig {
    fn default() -> Self {
        Self {
            padding: 0,
            stride: 1,
            dilation: 1,
            groups: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Conv2d {
    /// `(out_channels, in_channels / groups, kh, kw)`
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    pub config: Conv2dConfig,
    /// Set once a following batch norm has been folded in.
    pub fused_bn: bool,
}

impl Conv2d {
    pub fn new(weight: Tensor, bias: Option<Tensor>, config: Conv2dConfig) -> Result<Self> {
        let (out_c, _, _, _) = weight.dims4()?;
        if let Some(b) = &bias {
            if b.dims() != [out_c] {
                return Err(QuantError::Shape(format!(
                    "conv bias {:?} does not match {out_c} output channels",
                    b.dims()
                )));
            }
        }
        if config.groups == 0 || out_c % config.groups != 0 {
            return Err(QuantError::Shape(format!(
                "{out_c} output channels not divisible into {} groups",
                config.groups
            )));
        }
        // candle's conv kernels read the weight buffer as laid out
        Ok(Self {
            weight: weight.contiguous()?,
            bias: bias.map(|b| b.contiguous()).transpose()?,
            config,
            fused_bn: false,
        })
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn in_channels(&self) -> usize {
        self.weight.dims()[1] * self.config.groups
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let Conv2dConfig {
            padding,
            stride,
            dilation,
            groups,
        } = self.config;
        let ys = xs.conv2d(&self.weight, padding, stride, dilation, groups)?;
        match &self.bias {
            Some(b) => Ok(ys.broadcast_add(&b.reshape((1, b.elem_count(), 1, 1))?)?),
            None => Ok(ys),
        }
    }

    /// Fold `bn` into this convolution's weight and bias.
    pub fn fuse_batch_norm(&mut self, bn: &BatchNorm2d) -> Result<()> {
        let out_c = self.out_channels();
        if bn.num_features() != out_c {
            return Err(QuantError::Shape(format!(
                "batch norm over {} features cannot follow a conv with {out_c} outputs",
                bn.num_features()
            )));
        }
        let inv_std = (bn.running_var.affine(1.0, bn.eps)?).sqrt()?.recip()?;
        let factor = (&bn.weight * &inv_std)?;

        let weight = self
            .weight
            .broadcast_mul(&factor.reshape((out_c, 1, 1, 1))?)?;
        let bias = match &self.bias {
            Some(b) => b.clone(),
            None => Tensor::zeros(out_c, self.weight.dtype(), self.weight.device())?,
        };
        let bias = ((bias - &bn.running_mean)? * &factor)?.add(&bn.bias)?;

        self.weight = weight.contiguous()?;
        self.bias = Some(bias.contiguous()?);
        self.fused_bn = true;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    pub weight: Tensor,
    pub bias: Tensor,
    pub running_mean: Tensor,
    pub running_var: Tensor,
    pub eps: f64,
}

impl BatchNorm2d {
    pub fn new(
        weight: Tensor,
        bias: Tensor,
        running_mean: Tensor,
        running_var: Tensor,
        eps: f64,
    ) -> Result<Self> {
        let n = weight.elem_count();
        for (what, t) in [("bias", &bias), ("running_mean", &running_mean), ("running_var", &running_var)] {
            if t.dims() != [n] {
                return Err(QuantError::Shape(format!(
                    "batch norm {what} {:?} does not match {n} features",
                    t.dims()
                )));
            }
        }
        Ok(Self {
            weight,
            bias,
            running_mean,
            running_var,
            eps,
        })
    }

    /// Identity statistics over `n` features.
    pub fn identity(n: usize, eps: f64, device: &candle_core::Device) -> Result<Self> {
        Self::new(
            Tensor::ones(n, DType::F32, device)?,
            Tensor::zeros(n, DType::F32, device)?,
            Tensor::zeros(n, DType::F32, device)?,
            Tensor::ones(n, DType::F32, device)?,
            eps,
        )
    }

    pub fn num_features(&self) -> usize {
        self.weight.elem_count()
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let shape = (1, self.num_features(), 1, 1);
        let inv_std = self.running_var.affine(1.0, self.eps)?.sqrt()?.recip()?;
        let ys = xs
            .broadcast_sub(&self.running_mean.reshape(shape)?)?
            .broadcast_mul(&(&self.weight * &inv_std)?.reshape(shape)?)?
            .broadcast_add(&self.bias.reshape(shape)?)?;
        Ok(ys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    fn sample_bn(dev: &Device) -> Result<BatchNorm2d> {
        BatchNorm2d::new(
            Tensor::new(&[1.5f32, 0.5], dev)?,
            Tensor::new(&[0.1f32, -0.2], dev)?,
            Tensor::new(&[0.3f32, -0.4], dev)?,
            Tensor::new(&[2.0f32, 0.25], dev)?,
            1e-5,
        )
    }

    #[test]
    fn fused_conv_matches_conv_then_bn() -> Result<()> {
        let dev = Device::Cpu;
        let weight = Tensor::rand(-1f32, 1.0, (2, 3, 3, 3), &dev)?;
        let conv = Conv2d::new(weight, None, Conv2dConfig { padding: 1, ..Default::default() })?;
        let bn = sample_bn(&dev)?;
        let xs = Tensor::rand(-1f32, 1.0, (1, 3, 5, 5), &dev)?;

        let reference = bn.forward(&conv.forward(&xs)?)?;
        let mut fused = conv.clone();
        fused.fuse_batch_norm(&bn)?;
        assert!(fused.fused_bn);
        let got = fused.forward(&xs)?;

        let r = reference.flatten_all()?.to_vec1::<f32>()?;
        let g = got.flatten_all()?.to_vec1::<f32>()?;
        for (a, b) in r.iter().zip(&g) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
        }
        Ok(())
    }

    #[test]
    fn broadcast_weights_convolve_like_materialized_ones() -> Result<()> {
        let dev = Device::Cpu;
        let xs = Tensor::rand(-1f32, 1.0, (2, 4, 3, 3), &dev)?;
        let broadcast = Conv2d::new(Tensor::full(2.0f32, (3, 4, 1, 1), &dev)?, None, Default::default())?;
        let owned = Conv2d::new(Tensor::from_vec(vec![2.0f32; 12], (3, 4, 1, 1), &dev)?, None, Default::default())?;

        let got = broadcast.forward(&xs)?.flatten_all()?.to_vec1::<f32>()?;
        let want = owned.forward(&xs)?.flatten_all()?.to_vec1::<f32>()?;
        for (g, w) in got.iter().zip(&want) {
            assert_abs_diff_eq!(*g, *w, epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn fusion_rejects_mismatched_features() -> Result<()> {
        let dev = Device::Cpu;
        let mut conv = Conv2d::new(Tensor::zeros((3, 1, 1, 1), DType::F32, &dev)?, None, Default::default())?;
        assert!(matches!(conv.fuse_batch_norm(&sample_bn(&dev)?), Err(QuantError::Shape(_))));
        Ok(())
    }

    #[test]
    fn grouped_conv_reports_full_input_channels() -> Result<()> {
        let dev = Device::Cpu;
        let conv = Conv2d::new(
            Tensor::zeros((4, 1, 3, 3), DType::F32, &dev)?,
            None,
            Conv2dConfig { groups: 4, ..Default::default() },
        )?;
        assert_eq!(conv.in_channels(), 4);
        assert!(Conv2d::new(
            Tensor::zeros((4, 1, 3, 3), DType::F32, &dev)?,
            Some(Tensor::zeros(3, DType::F32, &dev)?),
            Default::default(),
        )
        .is_err());
        Ok(())
    }
}
