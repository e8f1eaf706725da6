use crate::{
    class_weights::ClassWeights,
    efficientnet::{feature_map_size, EfficientNetB0, NUM_FEATURES},
    heads::ClassifierHead,
    pretrained::{SafetensorsCheckpoint, TensorSource},
};
use anyhow::{Context, Result};
use burn::{
    config::Config,
    module::{AutodiffModule, Module},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Tensor,
    },
};
use std::path::Path;
use tracing::info;

/// Probabilities are clamped to `[EPSILON, 1 - EPSILON]` before taking logs.
pub const BCE_EPSILON: f64 = 1e-7;

/// Everything needed to rebuild the network before loading weights.
#[derive(Config, Debug, PartialEq)]
pub struct ClassifierConfig {
    pub image_height: usize,
    pub image_width: usize,
    #[config(default = 0.5)]
    pub dropout_rate: f64,
    #[config(default = 128)]
    pub hidden_units: usize,
}

impl ClassifierConfig {
    pub fn flattened_features(&self) -> usize {
        NUM_FEATURES * feature_map_size(self.image_height) * feature_map_size(self.image_width)
    }

    /// Randomly initialised classifier with a frozen backbone.
    pub fn init<B: Backend>(&self, device: &B::Device) -> CatClassifier<B> {
        CatClassifier {
            backbone: EfficientNetB0::new(device).no_grad(),
            head: ClassifierHead::new(
                self.flattened_features(),
                self.hidden_units,
                self.dropout_rate,
                device,
            ),
        }
    }
}

#[derive(Module, Debug)]
pub struct CatClassifier<B: Backend> {
    backbone: EfficientNetB0<B>,
    head: ClassifierHead<B>,
}

impl<B: Backend> CatClassifier<B> {
    /// Loads ImageNet weights into the backbone from a timm-named safetensors
    /// checkpoint. The backbone stays frozen.
    pub fn with_backbone_weights(self, path: &Path, device: &B::Device) -> Result<Self> {
        let checkpoint = SafetensorsCheckpoint::open(path)?;
        let model = self
            .with_backbone_source(&checkpoint, device)
            .with_context(|| format!("Failed to load backbone weights from {}", path.display()))?;
        info!("Loaded {} pretrained tensors from {}", checkpoint.len(), path.display());
        Ok(model)
    }

    pub fn with_backbone_source<S: TensorSource + ?Sized>(
        self,
        source: &S,
        device: &B::Device,
    ) -> Result<Self> {
        let backbone = self.backbone.load_pretrained(source, device)?.no_grad();
        Ok(Self {
            backbone,
            head: self.head,
        })
    }

    /// `[batch, 3, h, w]` images in `[0, 1]` to `[batch, 1]` P(cat).
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward_features(images);
        self.head.forward(features)
    }
}

impl<B: AutodiffBackend> CatClassifier<B> {
    /// Training-mode forward pass. The frozen backbone runs in inference mode
    /// (batch norm on its running statistics, no graph); dropout in the head
    /// stays active.
    pub fn forward_train(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.valid().forward_features(images.inner());
        self.head.forward(Tensor::from_inner(features))
    }
}

/// Mean binary cross-entropy over the batch. With `weights`, each sample's
/// term is scaled by the weight of its true class before averaging.
pub fn binary_cross_entropy<B: Backend>(
    probs: Tensor<B, 2>,
    targets: Tensor<B, 2>,
    weights: Option<&ClassWeights>,
) -> Tensor<B, 1> {
    let p = probs.clamp(BCE_EPSILON, 1.0 - BCE_EPSILON);
    let positive = targets.clone() * p.clone().log();
    let negative = (targets.clone().neg() + 1.0) * (p.neg() + 1.0).log();
    let per_sample = (positive + negative).neg();

    let per_sample = match weights {
        Some(w) => per_sample * (targets * (w.cat - w.other) + w.other),
        None => per_sample,
    };
    per_sample.mean()
}

/// Number of samples whose thresholded prediction (`p > 0.5`) matches the
/// target.
pub fn count_correct<B: Backend>(probs: Tensor<B, 2>, targets: Tensor<B, 2>) -> usize {
    let predicted = probs.greater_elem(0.5).float();
    let correct: i64 = predicted.equal(targets).int().sum().into_scalar().elem();
    correct as usize
}
