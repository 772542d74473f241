//! Loading and saving named parameters in safetensors format.

use super::Network;
use crate::error::{QuantError, Result};
use crate::utils::{tensor_to_f32, to_f32_vec};
use candle_core::Tensor;
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Keys PyTorch exports that carry no inference state.
const IGNORED_SUFFIXES: &[&str] = &["num_batches_tracked"];

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

impl Network {
    /// Qualified state-dict keys of every parameter.
    pub fn state_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        self.walk(&mut |name, layer| {
            for (suffix, _) in layer.parameters() {
                keys.push(format!("{name}.{suffix}"));
            }
        });
        keys
    }

    /// Load trained parameters into matching named layers.
    ///
    /// With `strict`, any missing or unexpected key fails the load before a
    /// single tensor is touched. Shape mismatches always fail.
    pub fn load_safetensors(&mut self, path: &Path, strict: bool) -> Result<LoadReport> {
        info!("Loading weights from: {}", path.display());
        let bytes = fs::read(path)?;
        let st = SafeTensors::deserialize(&bytes)?;

        let expected: BTreeSet<String> = self.state_keys().into_iter().collect();
        let present: BTreeSet<String> = st
            .names()
            .into_iter()
            .filter(|k| !IGNORED_SUFFIXES.iter().any(|s| k.ends_with(s)))
            .cloned()
            .collect();
        let missing: Vec<String> = expected.difference(&present).cloned().collect();
        let unexpected: Vec<String> = present.difference(&expected).cloned().collect();

        if strict && (!missing.is_empty() || !unexpected.is_empty()) {
            return Err(QuantError::StateDict(format!(
                "missing keys {missing:?}, unexpected keys {unexpected:?}"
            )));
        }
        for key in &missing {
            warn!("no stored value for {key}, keeping current");
        }
        for key in &unexpected {
            warn!("ignoring unexpected key {key}");
        }

        let mut loaded = 0;
        self.walk_mut(&mut |name, layer| {
            for (suffix, slot) in layer.parameters_mut() {
                let key = format!("{name}.{suffix}");
                let Ok(view) = st.tensor(&key) else {
                    continue;
                };
                if view.shape() != slot.dims() {
                    return Err(QuantError::StateDict(format!(
                        "{key}: stored shape {:?}, layer expects {:?}",
                        view.shape(),
                        slot.dims()
                    )));
                }
                let data = tensor_to_f32(view.data(), view.dtype())?;
                *slot = Tensor::from_vec(data, view.shape(), slot.device())?;
                debug!("loaded {key} {:?}", view.shape());
                loaded += 1;
            }
            Ok(())
        })?;

        Ok(LoadReport {
            loaded,
            missing,
            unexpected,
        })
    }

    /// Write every parameter as little-endian f32.
    pub fn save_safetensors(&self, path: &Path) -> Result<()> {
        let mut tensors = Vec::new();
        let mut err = None;
        self.walk(&mut |name, layer| {
            for (suffix, t) in layer.parameters() {
                match to_f32_vec(t) {
                    Ok(values) => tensors.push((format!("{name}.{suffix}"), t.dims().to_vec(), values)),
                    Err(e) => {
                        err.get_or_insert(e);
                    }
                }
            }
        });
        if let Some(e) = err {
            return Err(e);
        }

        let views = tensors
            .iter()
            .map(|(key, shape, values)| {
                let view = TensorView::new(Dtype::F32, shape.clone(), bytemuck::cast_slice(values))?;
                Ok((key.as_str(), view))
            })
            .collect::<Result<Vec<_>>>()?;
        let bytes = safetensors::serialize(views, &None)?;
        fs::write(path, bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::tests::fire_net;
    use crate::nn::{BatchNorm2d, Layer, Sequential};
    use candle_core::Device;
    use tempfile::TempDir;

    #[test]
    fn round_trip_preserves_parameters() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("model.safetensors");
        let source = fire_net()?;
        source.save_safetensors(&path)?;

        let mut target = fire_net()?;
        target.walk_mut(&mut |_, layer| {
            for (_, t) in layer.parameters_mut() {
                *t = t.zeros_like()?;
            }
            Ok(())
        })?;
        let report = target.load_safetensors(&path, true)?;
        assert_eq!(report.loaded, source.state_keys().len());
        assert!(report.missing.is_empty() && report.unexpected.is_empty());

        let a = source.get("features.3.expand3x3").unwrap().parameters();
        let b = target.get("features.3.expand3x3").unwrap().parameters();
        assert_eq!(to_f32_vec(a[0].1)?, to_f32_vec(b[0].1)?);
        Ok(())
    }

    #[test]
    fn strict_load_rejects_key_mismatch_untouched() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("model.safetensors");
        fire_net()?.save_safetensors(&path)?;

        let dev = Device::Cpu;
        let mut extended = fire_net()?;
        extended
            .root_mut()
            .children
            .push(("bn".into(), Layer::BatchNorm2d(BatchNorm2d::identity(6, 1e-5, &dev)?)));
        let before = to_f32_vec(extended.get("conv1").unwrap().parameters()[0].1)?;

        let err = extended.load_safetensors(&path, true).unwrap_err();
        assert!(matches!(err, QuantError::StateDict(_)));
        assert_eq!(
            to_f32_vec(extended.get("conv1").unwrap().parameters()[0].1)?,
            before
        );

        let report = extended.load_safetensors(&path, false)?;
        assert_eq!(report.missing.len(), 4);
        assert!(report.unexpected.is_empty());
        Ok(())
    }

    #[test]
    fn shape_mismatch_always_fails() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("model.safetensors");
        let dev = Device::Cpu;
        let small = Network::new(
            Sequential::new().push("bn", Layer::BatchNorm2d(BatchNorm2d::identity(2, 1e-5, &dev)?)),
        );
        small.save_safetensors(&path)?;
        let mut big = Network::new(
            Sequential::new().push("bn", Layer::BatchNorm2d(BatchNorm2d::identity(3, 1e-5, &dev)?)),
        );
        assert!(big.load_safetensors(&path, false).is_err());
        Ok(())
    }
}
