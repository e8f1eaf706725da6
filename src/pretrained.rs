//! ImageNet weights for the backbone, read from a safetensors checkpoint that
//! uses timm's `efficientnet_b0` parameter names (`conv_stem.weight`,
//! `blocks.{stage}.{index}.conv_dw.weight`, `bn2.running_var`, ...).

use anyhow::{anyhow, bail, Context, Result};
use burn::{
    module::{Param, RunningState},
    nn::{conv::Conv2d, BatchNorm, Linear},
    tensor::{backend::Backend, Tensor, TensorData},
};
use safetensors::{tensor::Dtype, SafeTensors};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Named float tensors of a known shape.
pub trait TensorSource {
    fn read(&self, key: &str, shape: &[usize]) -> Result<Vec<f32>>;
}

#[derive(Debug)]
pub struct SafetensorsCheckpoint {
    path: PathBuf,
    tensors: HashMap<String, (Vec<usize>, Vec<f32>)>,
    /// Non-float entries such as `num_batches_tracked`.
    skipped: HashMap<String, Dtype>,
}

impl SafetensorsCheckpoint {
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("Failed to read pretrained weights {}", path.display()))?;
        let file = SafeTensors::deserialize(&bytes)
            .map_err(|e| anyhow!("Invalid safetensors file {}: {e}", path.display()))?;

        let mut tensors = HashMap::new();
        let mut skipped = HashMap::new();
        for (name, view) in file.tensors() {
            let values: Vec<f32> = match view.dtype() {
                Dtype::F32 => view
                    .data()
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
                Dtype::F64 => view
                    .data()
                    .chunks_exact(8)
                    .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32)
                    .collect(),
                other => {
                    skipped.insert(name, other);
                    continue;
                }
            };
            tensors.insert(name, (view.shape().to_vec(), values));
        }
        debug!(
            "{}: {} float tensors, {} skipped",
            path.display(),
            tensors.len(),
            skipped.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            tensors,
            skipped,
        })
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

impl TensorSource for SafetensorsCheckpoint {
    fn read(&self, key: &str, shape: &[usize]) -> Result<Vec<f32>> {
        if let Some(dtype) = self.skipped.get(key) {
            bail!(
                "{key} in {} is stored as {dtype:?}; convert the checkpoint to float32",
                self.path.display()
            );
        }
        let (stored_shape, values) = self
            .tensors
            .get(key)
            .with_context(|| format!("{key} not found in {}", self.path.display()))?;
        if stored_shape.as_slice() != shape {
            bail!(
                "{key} in {} has shape {stored_shape:?}, expected {shape:?}",
                self.path.display()
            );
        }
        Ok(values.clone())
    }
}

fn tensor<B: Backend, S: TensorSource + ?Sized, const D: usize>(
    source: &S,
    key: &str,
    shape: [usize; D],
    device: &B::Device,
) -> Result<Tensor<B, D>> {
    let values = source.read(key, &shape)?;
    Ok(Tensor::from_data(TensorData::new(values, shape), device))
}

pub fn load_conv2d<B: Backend, S: TensorSource + ?Sized>(
    mut conv: Conv2d<B>,
    source: &S,
    prefix: &str,
    device: &B::Device,
) -> Result<Conv2d<B>> {
    let shape = conv.weight.val().dims();
    conv.weight = Param::from_tensor(tensor(source, &format!("{prefix}.weight"), shape, device)?);
    if let Some(shape) = conv.bias.as_ref().map(|b| b.val().dims()) {
        conv.bias = Some(Param::from_tensor(tensor(
            source,
            &format!("{prefix}.bias"),
            shape,
            device,
        )?));
    }
    Ok(conv)
}

/// Affine parameters and running statistics.
pub fn load_batch_norm<B: Backend, S: TensorSource + ?Sized>(
    mut bn: BatchNorm<B>,
    source: &S,
    prefix: &str,
    device: &B::Device,
) -> Result<BatchNorm<B>> {
    let shape = bn.gamma.val().dims();
    let key = |name: &str| format!("{prefix}.{name}");

    bn.gamma = Param::from_tensor(tensor(source, &key("weight"), shape, device)?);
    bn.beta = Param::from_tensor(tensor(source, &key("bias"), shape, device)?);
    bn.running_mean = RunningState::new(tensor(source, &key("running_mean"), shape, device)?);
    bn.running_var = RunningState::new(tensor(source, &key("running_var"), shape, device)?);
    Ok(bn)
}

/// Loads a 1x1 convolution `[out, in, 1, 1]` into a linear layer, which
/// stores its weight as `[in, out]`.
pub fn load_pointwise_linear<B: Backend, S: TensorSource + ?Sized>(
    mut linear: Linear<B>,
    source: &S,
    prefix: &str,
    device: &B::Device,
) -> Result<Linear<B>> {
    let [d_input, d_output] = linear.weight.val().dims();
    let weight: Tensor<B, 4> = tensor(
        source,
        &format!("{prefix}.weight"),
        [d_output, d_input, 1, 1],
        device,
    )?;
    linear.weight = Param::from_tensor(weight.reshape([d_output, d_input]).transpose());
    if linear.bias.is_some() {
        linear.bias = Some(Param::from_tensor(tensor(
            source,
            &format!("{prefix}.bias"),
            [d_output],
            device,
        )?));
    }
    Ok(linear)
}


#[cfg(test)]
mod tests {
    use super::synthetic::{write_checkpoint, write_entries, SyntheticSource};
    use super::*;
    use crate::efficientnet::EfficientNetB0;
    use burn::{
        backend::NdArray,
        tensor::{Distribution, ElementConversion},
    };
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    #[test]
    fn checkpoint_file_reproduces_loaded_backbone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("efficientnet_b0.safetensors");
        write_checkpoint(&path);
        let device = Default::default();

        let checkpoint = SafetensorsCheckpoint::open(&path).unwrap();
        assert!(!checkpoint.is_empty());
        let from_file = EfficientNetB0::<TestBackend>::new(&device)
            .load_pretrained(&checkpoint, &device)
            .unwrap();
        let from_source = EfficientNetB0::<TestBackend>::new(&device)
            .load_pretrained(&SyntheticSource::default(), &device)
            .unwrap();

        let x = Tensor::<TestBackend, 4>::random([2, 3, 32, 32], Distribution::Uniform(0.0, 1.0), &device);
        let a = from_file.forward_features(x.clone());
        let b = from_source.forward_features(x);
        let diff: f32 = (a - b).abs().max().into_scalar().elem();
        assert!(diff < 1e-5, "features differ by {diff}");
    }

    #[test]
    fn every_layer_is_read_once() {
        let device = Default::default();
        let source = SyntheticSource::default();
        EfficientNetB0::<TestBackend>::new(&device)
            .load_pretrained(&source, &device)
            .unwrap();

        let requested = source.requested.into_inner();
        let keys: Vec<&str> = requested.iter().map(|(k, _, _)| k.as_str()).collect();
        let mut unique = keys.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), keys.len());

        for key in [
            "conv_stem.weight",
            "bn1.running_var",
            "blocks.0.0.conv_dw.weight",
            "blocks.0.0.conv_pw.weight",
            "blocks.1.0.se.conv_reduce.weight",
            "blocks.6.0.conv_pwl.weight",
            "blocks.6.0.bn3.bias",
            "conv_head.weight",
            "bn2.running_mean",
        ] {
            assert!(keys.contains(&key), "{key} was not read");
        }
        let se_reduce = requested
            .iter()
            .find(|(k, _, _)| k == "blocks.1.0.se.conv_reduce.weight")
            .unwrap();
        assert_eq!(se_reduce.1, vec![4, 96, 1, 1]);
    }

    #[test]
    fn shape_mismatch_names_the_tensor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.safetensors");
        let bytes = vec![0u8; 4 * 32 * 3 * 5 * 5];
        write_entries(
            &path,
            &[("conv_stem.weight".to_string(), vec![32, 3, 5, 5], Dtype::F32, bytes)],
        );

        let device = Default::default();
        let checkpoint = SafetensorsCheckpoint::open(&path).unwrap();
        let err = EfficientNetB0::<TestBackend>::new(&device)
            .load_pretrained(&checkpoint, &device)
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("conv_stem.weight"), "{message}");
        assert!(message.contains("[32, 3, 3, 3]"), "{message}");
    }

    #[test]
    fn integer_entries_are_reported_not_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ints.safetensors");
        write_entries(
            &path,
            &[("bn1.weight".to_string(), vec![2], Dtype::I64, vec![0u8; 16])],
        );

        let checkpoint = SafetensorsCheckpoint::open(&path).unwrap();
        assert!(checkpoint.is_empty());
        let err = checkpoint.read("bn1.weight", &[2]).unwrap_err();
        assert!(err.to_string().contains("float32"));
        let err = checkpoint.read("bn1.bias", &[2]).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = SafetensorsCheckpoint::open(Path::new("/no/such/weights.safetensors")).unwrap_err();
        assert!(err.to_string().contains("/no/such/weights.safetensors"));
    }
}
