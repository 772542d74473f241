mod common;

use approx::assert_abs_diff_eq;
use candle_core::{Device, Tensor};
use common::{conv_bn_net, fire_net, param_files, write_images};
use gap_quant::calibration::load_image;
use gap_quant::core::{load_concat_params, load_dump};
use gap_quant::fixed_point::{dequantize_tensor, quantize_tensor};
use gap_quant::nn::{Layer, Network, Sequential};
use gap_quant::transforms::{QuantizeInput, ToTensor};
use gap_quant::utils::to_f32_vec;
use gap_quant::{
    load_quantization_params, quantize_model, Compose, ModelQuantizer, QuantConfig, QuantError, QuantParams,
    QuantizerState, Result, TensorDataset,
};
use std::sync::Arc;
use tempfile::TempDir;

fn config(dir: &TempDir) -> QuantConfig {
    QuantConfig {
        save_folder: dir.path().join("params"),
        data_source: dir.path().join("images"),
        num_input_channels: 1,
        ..Default::default()
    }
}

fn image_pipeline() -> Arc<Compose> {
    Arc::new(Compose::new().then(ToTensor))
}

#[test]
fn scenario_a_activation_range_split() {
    let fit = QuantParams::from_range(-2.3, 4.1, 16, true).unwrap();
    assert_eq!(fit.params.integer_bits, 3);
    assert_eq!(fit.params.fraction_bits, 12);
    assert!(!fit.clamped);
}

#[test]
fn scenario_b_fused_conv_matches_float_conv_bn() -> Result<()> {
    let dir = TempDir::new()?;
    let dev = Device::Cpu;
    let grid = [0.0f32, 0.25, 0.5, 0.75];
    let samples = (0..4)
        .map(|i| {
            let data: Vec<f32> = (0..4).map(|j| grid[(i + j) % 4]).collect();
            Tensor::from_vec(data, (1, 2, 2), &dev)
        })
        .collect::<candle_core::Result<Vec<_>>>()?;

    let reference_net = conv_bn_net()?;
    let real = Tensor::stack(&samples, 0)?;
    let reference = reference_net.forward(&real)?;

    let mut net = conv_bn_net()?;
    let cfg = QuantConfig {
        convbn: true,
        ..config(&dir)
    };
    let mut quantizer = ModelQuantizer::new(&mut net, cfg, Arc::new(Compose::new()))?;
    let report = quantizer.quantize_with_dataset(&TensorDataset::new(samples))?;
    assert_eq!(report.fused_layers, 1);
    assert_eq!(quantizer.params().unwrap()["conv"].kind, "convbn");
    assert!(!dir.path().join("params/bn.json").exists());

    let input = quantizer.input_params().unwrap();
    let out = quantizer.model().forward(&quantize_tensor(&real, &input)?)?;
    let out_frac = quantizer.out_frac_bits().unwrap();
    let out_fmt = quantizer.params().unwrap()["conv"].output;
    assert_eq!(out_frac, out_fmt.fraction_bits);

    let got = to_f32_vec(&dequantize_tensor(&out, &out_fmt)?)?;
    let want = to_f32_vec(&reference)?;
    for (g, w) in got.iter().zip(&want) {
        assert_abs_diff_eq!(f64::from(*g), f64::from(*w), epsilon = out_fmt.step());
    }
    Ok(())
}

#[test]
fn scenario_c_unsupported_layer_leaves_weights_untouched() -> Result<()> {
    let dir = TempDir::new()?;
    write_images(&dir.path().join("images"), 2);
    let mut net = conv_bn_net()?;
    let before = to_f32_vec(net.get("conv").and_then(Layer::weight_and_bias).unwrap().0)?;

    // without fusion the batch norm has no fixed-point equivalent
    let err = quantize_model(&mut net, config(&dir), image_pipeline()).unwrap_err();
    match err {
        QuantError::UnsupportedLayer { layer, kind } => {
            assert_eq!(layer, "bn");
            assert_eq!(kind, "batchnorm2d");
        }
        other => panic!("expected UnsupportedLayer, got {other:?}"),
    }
    let after = to_f32_vec(net.get("conv").and_then(Layer::weight_and_bias).unwrap().0)?;
    assert_eq!(before, after);
    assert!(matches!(net.get("bn"), Some(Layer::BatchNorm2d(_))));
    assert_eq!(param_files(&dir.path().join("params")), 0);
    Ok(())
}

#[test]
fn scenario_d_empty_data_source_fails_before_writing() -> Result<()> {
    let dir = TempDir::new()?;
    std::fs::create_dir_all(dir.path().join("images"))?;
    let mut net = fire_net()?;
    let mut quantizer = ModelQuantizer::new(&mut net, config(&dir), image_pipeline())?;
    match quantizer.quantize_model() {
        Err(QuantError::DataSource { path, .. }) => assert_eq!(path, dir.path().join("images")),
        other => panic!("expected DataSource error, got {other:?}"),
    }
    assert_eq!(quantizer.state(), QuantizerState::Configured);
    assert!(!dir.path().join("params").exists());
    Ok(())
}

#[test]
fn corrupt_image_leaves_batch_norm_unfused() -> Result<()> {
    let dir = TempDir::new()?;
    let images = dir.path().join("images");
    write_images(&images, 2);
    std::fs::write(images.join("img_99.png"), b"not a png")?;

    let mut net = conv_bn_net()?;
    let before = to_f32_vec(net.get("conv").and_then(Layer::weight_and_bias).unwrap().0)?;
    let cfg = QuantConfig {
        convbn: true,
        ..config(&dir)
    };
    let mut quantizer = ModelQuantizer::new(&mut net, cfg, image_pipeline())?;
    assert!(matches!(quantizer.quantize_model(), Err(QuantError::DataSource { .. })));
    assert_eq!(quantizer.state(), QuantizerState::Configured);
    assert!(quantizer.stats().is_none());
    drop(quantizer);

    assert!(matches!(net.get("bn"), Some(Layer::BatchNorm2d(_))));
    assert_eq!(net.get("conv").map(Layer::kind), Some("conv2d"));
    let after = to_f32_vec(net.get("conv").and_then(Layer::weight_and_bias).unwrap().0)?;
    assert_eq!(before, after);
    assert_eq!(param_files(&dir.path().join("params")), 0);
    Ok(())
}

#[test]
fn missing_data_source_is_a_data_source_error() -> Result<()> {
    let dir = TempDir::new()?;
    let mut net = fire_net()?;
    let err = quantize_model(&mut net, config(&dir), image_pipeline()).unwrap_err();
    assert!(matches!(err, QuantError::DataSource { .. }));
    Ok(())
}

#[test]
fn persisted_params_reproduce_the_input_format() -> Result<()> {
    let dir = TempDir::new()?;
    write_images(&dir.path().join("images"), 3);
    let mut net = fire_net()?;
    let mut quantizer = ModelQuantizer::new(&mut net, config(&dir), image_pipeline())?;
    quantizer.quantize_model()?;
    let input = quantizer.input_params().unwrap();

    let loaded = load_quantization_params(&dir.path().join("params"))?;
    assert_eq!(loaded.len(), 4);
    assert_eq!(loaded["conv1"].input.fraction_bits, input.fraction_bits);
    assert_eq!(&loaded, quantizer.params().unwrap());
    for params in loaded.values() {
        assert!(params.input.is_consistent());
        assert!(params.output.is_consistent());
        assert_eq!(params.norm.len(), 1);
    }

    let raw = std::fs::read_to_string(dir.path().join("params/conv1.json"))?;
    let json: serde_json::Value = serde_json::from_str(&raw)?;
    assert!(json["norm"].is_array());
    assert_eq!(json["input"]["fraction_bits"], input.fraction_bits);

    let concats = load_concat_params(&dir.path().join("params"))?;
    let cat = &concats["features.3.cat"];
    assert_eq!(loaded["features.3.expand1x1"].output, cat.output);
    assert_eq!(loaded["features.3.expand3x3"].output, cat.output);
    Ok(())
}

#[test]
fn end_to_end_emulation_and_activation_dump() -> Result<()> {
    let dir = TempDir::new()?;
    let images = dir.path().join("images");
    write_images(&images, 4);

    let reference_net = fire_net()?;
    let mut net = fire_net()?;
    let mut quantizer = ModelQuantizer::new(&mut net, config(&dir), image_pipeline())?;
    let report = quantizer.quantize_model()?;
    assert_eq!(report.calibration_samples, 4);
    assert_eq!(report.substituted_layers, 5);
    assert!(report.warnings.is_empty());

    let input = quantizer.input_params().unwrap();
    let sample = images.join("img_01.png");
    let real = load_image(&sample, &Compose::new().then(ToTensor))?.unsqueeze(0)?;
    let reference = reference_net.forward(&real)?;
    let err = quantizer.emulation_error(&reference, &quantize_tensor(&real, &input)?)?;
    assert!(err.max_abs < 1e-2, "emulation error {err:?}");

    let to_fixed = Compose::new().then(ToTensor).then(QuantizeInput::new(input));
    let root = quantizer.dump_activations(&sample, &to_fixed)?;
    assert_eq!(root, dir.path().join("params/activations_dump"));

    let conv1 = root.join("conv1");
    for file in ["input.bin", "output.bin", "weight.bin", "bias.bin"] {
        assert!(conv1.join(file).is_file(), "missing {file}");
    }
    let params = &quantizer.params().unwrap()["conv1"];
    let output = load_dump(&conv1.join("output.bin"))?;
    assert_eq!(output.shape(), &[1, 4, 6, 6]);
    assert_eq!(output.header.frac_bits, params.output.fraction_bits as i32);
    let weight = load_dump(&conv1.join("weight.bin"))?;
    assert_eq!(weight.header.frac_bits, params.weight.unwrap().fraction_bits as i32);
    assert!(root.join("features.3.cat/output.bin").is_file());
    assert!(root.join("pool/output.bin").is_file());
    Ok(())
}

#[test]
fn second_run_is_a_state_error() -> Result<()> {
    let dir = TempDir::new()?;
    write_images(&dir.path().join("images"), 2);
    let mut net = fire_net()?;
    let mut quantizer = ModelQuantizer::new(&mut net, config(&dir), image_pipeline())?;
    quantizer.quantize_model()?;
    let solved = quantizer.params().cloned();
    assert!(matches!(
        quantizer.quantize_model(),
        Err(QuantError::State {
            operation: "quantize_model",
            ..
        })
    ));
    assert_eq!(quantizer.params().cloned(), solved);
    Ok(())
}

#[test]
fn double_precision_and_integer_kernels_agree_end_to_end() -> Result<()> {
    let dir = TempDir::new()?;
    write_images(&dir.path().join("images"), 3);
    let run = |double_precision: bool| -> Result<(Network, QuantParams)> {
        let mut net = fire_net()?;
        let cfg = QuantConfig {
            double_precision,
            save_params: false,
            ..config(&dir)
        };
        let mut quantizer = ModelQuantizer::new(&mut net, cfg, image_pipeline())?;
        quantizer.quantize_model()?;
        let input = quantizer.input_params().unwrap();
        drop(quantizer);
        Ok((net, input))
    };
    let (integer, input) = run(false)?;
    let (double, _) = run(true)?;

    let real = Tensor::rand(0f32, 1.0, (2, 1, 6, 6), &Device::Cpu)?;
    let xs = quantize_tensor(&real, &input)?;
    assert_eq!(to_f32_vec(&integer.forward(&xs)?)?, to_f32_vec(&double.forward(&xs)?)?);
    Ok(())
}

#[test]
fn linear_head_is_substituted() -> Result<()> {
    use gap_quant::nn::Linear;
    let dir = TempDir::new()?;
    let dev = Device::Cpu;
    let mut net = fire_net()?;
    let fc = Linear::new(
        Tensor::rand(-0.5f32, 0.5, (3, 6), &dev)?,
        Some(Tensor::new(&[0.1f32, -0.1, 0.0], &dev)?),
    )?;
    let root: &mut Sequential = net.root_mut();
    root.children.push(("classifier".into(), Layer::Linear(fc)));

    let samples = (0..2)
        .map(|_| Tensor::rand(0f32, 1.0, (1, 6, 6), &dev))
        .collect::<candle_core::Result<Vec<_>>>()?;
    let mut quantizer = ModelQuantizer::new(&mut net, config(&dir), Arc::new(Compose::new()))?;
    let report = quantizer.quantize_with_dataset(&TensorDataset::new(samples))?;
    assert_eq!(report.quantized_layers, 5);
    assert_eq!(
        quantizer.model().get("classifier").map(Layer::kind),
        Some("fixed_linear")
    );
    let head = &quantizer.params().unwrap()["classifier"];
    assert_eq!(quantizer.out_frac_bits(), Some(head.output.fraction_bits));
    Ok(())
}

#[test]
fn weightless_concat_branch_is_moved_onto_the_concat_grid() -> Result<()> {
    use gap_quant::nn::{Concat, Conv2d, Pool2d};
    let dir = TempDir::new()?;
    let dev = Device::Cpu;
    let build = || -> Result<Network> {
        let conv1 = Conv2d::new(
            Tensor::new(&[0.5f32, -0.25], &dev)?.reshape((2, 1, 1, 1))?,
            None,
            Default::default(),
        )?;
        let expand = Conv2d::new(Tensor::full(8f32, (2, 2, 1, 1), &dev)?, None, Default::default())?;
        Ok(Network::new(
            Sequential::new().push("conv1", Layer::Conv2d(conv1)).push(
                "cat",
                Concat::new()
                    .push("expand", Layer::Conv2d(expand))
                    .push("pool", Layer::MaxPool2d(Pool2d::new(1, 1))),
            ),
        ))
    };

    let reference_net = build()?;
    let mut net = build()?;
    let samples = (0..3)
        .map(|_| Tensor::rand(0f32, 1.0, (1, 6, 6), &dev))
        .collect::<candle_core::Result<Vec<_>>>()?;
    let mut quantizer = ModelQuantizer::new(&mut net, config(&dir), Arc::new(Compose::new()))?;
    quantizer.quantize_with_dataset(&TensorDataset::new(samples))?;

    let cat = quantizer.solution().unwrap().concats["cat"].clone();
    assert_eq!(cat.branches[1].name, "pool");
    assert!(cat.branches[1].layer.is_none());
    assert_ne!(cat.branches[1].produced, cat.output);
    assert_eq!(quantizer.out_frac_bits(), Some(cat.output.fraction_bits));

    let real = Tensor::rand(0f32, 1.0, (2, 1, 6, 6), &dev)?;
    let input = quantizer.input_params().unwrap();
    let err = quantizer.emulation_error(&reference_net.forward(&real)?, &quantize_tensor(&real, &input)?)?;
    assert!(err.max_abs < 1e-2, "emulation error {err:?}");
    Ok(())
}
