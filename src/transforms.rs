//! Composable input transforms: image in, `(C, H, W)` f32 tensor out.

use crate::error::{QuantError, Result};
use crate::fixed_point::{quantize_tensor, QuantParams};
use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::DynamicImage;
use std::fmt;

/// A value flowing through a [`Compose`] pipeline.
#[derive(Debug, Clone)]
pub enum Sample {
    Image(DynamicImage),
    Tensor(Tensor),
}

impl Sample {
    fn into_image(self, step: &str) -> Result<DynamicImage> {
        match self {
            Sample::Image(img) => Ok(img),
            Sample::Tensor(_) => Err(QuantError::Shape(format!("{step} expects an image, got a tensor"))),
        }
    }

    fn into_tensor(self, step: &str) -> Result<Tensor> {
        match self {
            Sample::Tensor(t) => Ok(t),
            Sample::Image(_) => Err(QuantError::Shape(format!(
                "{step} expects a tensor; add ToTensor or ToTensorNoNorm first"
            ))),
        }
    }
}

pub trait Transform: Send + Sync + fmt::Debug {
    fn apply(&self, sample: Sample) -> Result<Sample>;
}

#[derive(Debug, Default)]
pub struct Compose {
    steps: Vec<Box<dyn Transform>>,
}

impl Compose {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, step: impl Transform + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn call(&self, image: DynamicImage) -> Result<Tensor> {
        let mut sample = Sample::Image(image);
        for step in &self.steps {
            sample = step.apply(sample)?;
        }
        sample.into_tensor("Compose")
    }
}

/// Bilinear resize to exactly `(height, width)`.
#[derive(Debug, Clone, Copy)]
pub struct Resize {
    pub height: u32,
    pub width: u32,
}

impl Resize {
    pub fn new(height: u32, width: u32) -> Self {
        Self { height, width }
    }
}

impl Transform for Resize {
    fn apply(&self, sample: Sample) -> Result<Sample> {
        let img = sample.into_image("Resize")?;
        Ok(Sample::Image(img.resize_exact(self.width, self.height, FilterType::Triangle)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Grayscale;

impl Transform for Grayscale {
    fn apply(&self, sample: Sample) -> Result<Sample> {
        Ok(Sample::Image(sample.into_image("Grayscale")?.grayscale()))
    }
}

fn image_to_tensor(img: &DynamicImage, scale: f32) -> Result<Tensor> {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let (raw, channels) = if img.color().has_color() {
        (img.to_rgb8().into_raw(), 3)
    } else {
        (img.to_luma8().into_raw(), 1)
    };
    let data: Vec<f32> = raw.into_iter().map(|v| f32::from(v) * scale).collect();
    let hwc = Tensor::from_vec(data, (h, w, channels), &Device::Cpu)?;
    Ok(hwc.permute((2, 0, 1))?.contiguous()?)
}

/// Image to tensor scaled into `[0, 1]`.
#[derive(Debug, Clone, Copy)]
pub struct ToTensor;

impl Transform for ToTensor {
    fn apply(&self, sample: Sample) -> Result<Sample> {
        let img = sample.into_image("ToTensor")?;
        Ok(Sample::Tensor(image_to_tensor(&img, 1.0 / 255.0)?))
    }
}

/// Image to tensor keeping raw 0..=255 pixel values.
#[derive(Debug, Clone, Copy)]
pub struct ToTensorNoNorm;

impl Transform for ToTensorNoNorm {
    fn apply(&self, sample: Sample) -> Result<Sample> {
        let img = sample.into_image("ToTensorNoNorm")?;
        Ok(Sample::Tensor(image_to_tensor(&img, 1.0)?))
    }
}

/// Per-channel `(x - mean) / std`.
#[derive(Debug, Clone)]
pub struct Normalize {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl Normalize {
    pub fn new(mean: Vec<f32>, std: Vec<f32>) -> Result<Self> {
        if mean.len() != std.len() || mean.is_empty() {
            return Err(QuantError::config(
                "normalize",
                format!("{} means for {} deviations", mean.len(), std.len()),
            ));
        }
        if std.iter().any(|s| *s == 0.0) {
            return Err(QuantError::config("normalize", "zero standard deviation"));
        }
        Ok(Self { mean, std })
    }
}

impl Transform for Normalize {
    fn apply(&self, sample: Sample) -> Result<Sample> {
        let xs = sample.into_tensor("Normalize")?;
        let c = xs.dim(0)?;
        if c != self.mean.len() {
            return Err(QuantError::Shape(format!(
                "Normalize configured for {} channels, tensor has {c}",
                self.mean.len()
            )));
        }
        let mean = Tensor::from_slice(&self.mean, (c, 1, 1), xs.device())?.to_dtype(xs.dtype())?;
        let std = Tensor::from_slice(&self.std, (c, 1, 1), xs.device())?.to_dtype(xs.dtype())?;
        Ok(Sample::Tensor(xs.broadcast_sub(&mean)?.broadcast_div(&std)?))
    }
}

/// Map a real-valued tensor onto the integer grid the first layer expects.
#[derive(Debug, Clone, Copy)]
pub struct QuantizeInput {
    pub params: QuantParams,
}

impl QuantizeInput {
    pub fn new(params: QuantParams) -> Self {
        Self { params }
    }

    /// From the total width and the integer bits of the network input.
    pub fn from_bits(bits: u32, integer_bits: u32, signed: bool) -> Result<Self> {
        Ok(Self::new(QuantParams::with_integer_bits(integer_bits, bits, signed)?))
    }
}

impl Transform for QuantizeInput {
    fn apply(&self, sample: Sample) -> Result<Sample> {
        let xs = sample.into_tensor("QuantizeInput")?;
        let q = quantize_tensor(&xs.to_dtype(DType::F32)?, &self.params)?;
        Ok(Sample::Tensor(q))
    }
}
