#![allow(dead_code)]

use candle_core::{Device, Tensor};
use gap_quant::nn::{BatchNorm2d, Concat, Conv2d, Conv2dConfig, Layer, Network, Sequential};
use gap_quant::Result;
use image::{GrayImage, Luma};
use std::path::Path;

pub fn conv(out: usize, inp: usize, k: usize, pad: usize) -> Result<Conv2d> {
    let dev = Device::Cpu;
    let n = out * inp * k * k;
    let w: Vec<f32> = (0..n).map(|i| ((i % 7) as f32 - 3.0) * 0.05).collect();
    let b: Vec<f32> = (0..out).map(|i| i as f32 * 0.01).collect();
    Conv2d::new(
        Tensor::from_vec(w, (out, inp, k, k), &dev)?,
        Some(Tensor::from_vec(b, out, &dev)?),
        Conv2dConfig {
            padding: pad,
            ..Default::default()
        },
    )
}

/// A small SqueezeNet-style network over single-channel 6x6 inputs.
pub fn fire_net() -> Result<Network> {
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

/// 1x1 convolution followed by a batch norm whose folded form is exactly
/// representable: w' = [0.75, -0.5], b' = [0.125, 0.25].
pub fn conv_bn_net() -> Result<Network> {
    let dev = Device::Cpu;
    let conv = Conv2d::new(
        Tensor::new(&[1.0f32, -0.5], &dev)?.reshape((2, 1, 1, 1))?,
        Some(Tensor::new(&[0.25f32, 0.0], &dev)?),
        Conv2dConfig::default(),
    )?;
    let bn = BatchNorm2d::new(
        Tensor::new(&[1.5f32, 0.5], &dev)?,
        Tensor::new(&[0.125f32, -0.25], &dev)?,
        Tensor::new(&[0.25f32, -0.5], &dev)?,
        Tensor::new(&[4.0f32, 0.25], &dev)?,
        0.0,
    )?;
    Ok(Network::new(
        Sequential::new()
            .push("conv", Layer::Conv2d(conv))
            .push("bn", Layer::BatchNorm2d(bn)),
    ))
}

/// Write `count` deterministic 6x6 grayscale PNGs into `dir`.
pub fn write_images(dir: &Path, count: u32) {
    std::fs::create_dir_all(dir).unwrap();
    for i in 0..count {
        let img = GrayImage::from_fn(6, 6, |x, y| Luma([((x * 40 + y * 7 + i * 13) % 256) as u8]));
        img.save(dir.join(format!("img_{i:02}.png"))).unwrap();
    }
}

pub fn param_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}
