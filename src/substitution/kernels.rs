//! Integer reference kernels.
//!
//! These mirror the accelerator's inner loops: the accumulator starts from the
//! bias and saturates after every multiply-accumulate.

use crate::error::{QuantError, Result};
use crate::fixed_point::Accumulator;
use crate::nn::Conv2dConfig;

/// NCHW shape of a convolution operand.
pub type Shape4 = (usize, usize, usize, usize);

fn out_dim(input: usize, kernel: usize, cfg: &Conv2dConfig) -> Result<usize> {
    let span = cfg.dilation * (kernel - 1) + 1;
    let padded = input + 2 * cfg.padding;
    if padded < span || cfg.stride == 0 {
        return Err(QuantError::Shape(format!(
            "kernel span {span} does not fit input {input} with padding {}",
            cfg.padding
        )));
    }
    Ok((padded - span) / cfg.stride + 1)
}

/// Grouped, strided, dilated 2D convolution over integers.
pub fn conv2d_i64(
    input: &[i64],
    in_shape: Shape4,
    weight: &[i64],
    w_shape: Shape4,
    bias: Option<&[i64]>,
    cfg: &Conv2dConfig,
    acc: &Accumulator,
) -> Result<(Vec<i64>, Shape4)> {
    let (n, c, h, w) = in_shape;
    let (oc, icg, kh, kw) = w_shape;
    if icg * cfg.groups != c {
        return Err(QuantError::Shape(format!(
            "input has {c} channels, kernel expects {} in {} groups",
            icg * cfg.groups,
            cfg.groups
        )));
    }
    let (oh, ow) = (out_dim(h, kh, cfg)?, out_dim(w, kw, cfg)?);
    let ocg = oc / cfg.groups;
    let pad = cfg.padding as isize;

    let mut out = vec![0i64; n * oc * oh * ow];
    for b in 0..n {
        for o in 0..oc {
            let g = o / ocg;
            let start = bias.map_or(0, |bias| acc.saturate(bias[o]));
            for y in 0..oh {
                for x in 0..ow {
                    let mut sum = start;
                    for ci in 0..icg {
                        let ic = g * icg + ci;
                        for ky in 0..kh {
                            let iy = (y * cfg.stride + ky * cfg.dilation) as isize - pad;
                            if iy < 0 || iy >= h as isize {
                                continue;
                            }
                            for kx in 0..kw {
                                let ix = (x * cfg.stride + kx * cfg.dilation) as isize - pad;
                                if ix < 0 || ix >= w as isize {
                                    continue;
                                }
                                let a = input[((b * c + ic) * h + iy as usize) * w + ix as usize];
                                let k = weight[((o * icg + ci) * kh + ky) * kw + kx];
                                sum = acc.mac(sum, a, k);
                            }
                        }
                    }
                    out[((b * oc + o) * oh + y) * ow + x] = sum;
                }
            }
        }
    }
    Ok((out, (n, oc, oh, ow)))
}

/// `(n, in) x (out, in)^T` over integers.
pub fn linear_i64(
    input: &[i64],
    in_shape: (usize, usize),
    weight: &[i64],
    w_shape: (usize, usize),
    bias: Option<&[i64]>,
    acc: &Accumulator,
) -> Result<Vec<i64>> {
    let (n, features) = in_shape;
    let (outputs, w_features) = w_shape;
    if features != w_features {
        return Err(QuantError::Shape(format!(
            "linear expects {w_features} features, input has {features}"
        )));
    }
    let mut out = Vec::with_capacity(n * outputs);
    for row in input.chunks_exact(features).take(n) {
        for (o, w_row) in weight.chunks_exact(features).enumerate() {
            let start = bias.map_or(0, |bias| acc.saturate(bias[o]));
            out.push(row.iter().zip(w_row).fold(start, |sum, (&a, &k)| acc.mac(sum, a, k)));
        }
    }
    Ok(out)
}
