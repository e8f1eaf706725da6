use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf};

use crate::augmentation::AugmentationConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EarlyStoppingConfig {
    /// Epochs without validation-loss improvement before training halts.
    pub patience: usize,
    pub min_delta: f64,
    pub restore_best_weights: bool,
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            patience: 5,
            min_delta: 0.0,
            restore_best_weights: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub dataset_path: PathBuf,
    pub model_path: PathBuf,
    /// Subdirectory holding label 1 images.
    pub positive_class_dir: String,
    /// Subdirectory holding label 0 images.
    pub negative_class_dir: String,
    pub image_height: usize,
    pub image_width: usize,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub validation_split: f64,
    pub dropout_rate: f64,
    pub hidden_units: usize,
    pub learning_rate: f64,
    pub adam_epsilon: f32,
    pub early_stopping: EarlyStoppingConfig,
    pub augmentation: AugmentationConfig,
    pub augment_validation: bool,
    /// safetensors checkpoint of an ImageNet EfficientNet-B0 (timm names).
    pub backbone_weights: PathBuf,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            dataset_path: PathBuf::from("dataset/train"),
            model_path: PathBuf::from("cat_classifier.tar.gz"),
            positive_class_dir: "cats".to_string(),
            negative_class_dir: "others".to_string(),
            image_height: 224,
            image_width: 224,
            batch_size: 32,
            num_epochs: 30,
            validation_split: 0.2,
            dropout_rate: 0.5,
            hidden_units: 128,
            learning_rate: 0.001,
            adam_epsilon: 1e-7,
            early_stopping: EarlyStoppingConfig::default(),
            augmentation: AugmentationConfig::default(),
            augment_validation: true,
            backbone_weights: PathBuf::from("weights/efficientnet_b0.safetensors"),
            seed: 42,
        }
    }
}

impl TrainingConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Class directory names indexed by label.
    pub fn class_dirs(&self) -> [&str; 2] {
        [&self.negative_class_dir, &self.positive_class_dir]
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be > 0");
        }
        if self.num_epochs == 0 {
            bail!("num_epochs must be > 0");
        }
        if self.learning_rate <= 0.0 {
            bail!("learning_rate must be > 0");
        }
        if self.validation_split <= 0.0 || self.validation_split >= 1.0 {
            bail!(
                "validation_split must be between 0 and 1 (got {})",
                self.validation_split
            );
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            bail!("dropout_rate must be in [0, 1) (got {})", self.dropout_rate);
        }
        if self.image_height == 0 || self.image_width == 0 {
            bail!("image_height and image_width must be > 0");
        }
        if self.hidden_units == 0 {
            bail!("hidden_units must be > 0");
        }
        if self.positive_class_dir == self.negative_class_dir {
            bail!(
                "positive_class_dir and negative_class_dir must differ (both are '{}')",
                self.positive_class_dir
            );
        }
        if self.backbone_weights.as_os_str().is_empty() {
            bail!("backbone_weights must name an EfficientNet-B0 checkpoint");
        }
        self.augmentation.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_reference_run() {
        let config = TrainingConfig::default();
        assert_eq!(config.image_height, 224);
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.num_epochs, 30);
        assert_eq!(config.early_stopping.patience, 5);
        assert!(config.early_stopping.restore_best_weights);
        assert_eq!(config.class_dirs(), ["others", "cats"]);
        config.validate().unwrap();
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "num_epochs": 3, "early_stopping": {{ "patience": 1 }}, "augmentation": {{ "horizontal_flip": false }} }}"#
        )
        .unwrap();

        let config = TrainingConfig::load(file.path()).unwrap();
        assert_eq!(config.num_epochs, 3);
        assert_eq!(config.early_stopping.patience, 1);
        assert!(config.early_stopping.restore_best_weights);
        assert!(!config.augmentation.horizontal_flip);
        assert_eq!(config.augmentation.rotation_range, 30.0);
        assert_eq!(config.batch_size, 32);
    }

    #[test]
    fn rejects_bad_values() {
        let bad = [
            TrainingConfig { batch_size: 0, ..Default::default() },
            TrainingConfig { validation_split: 1.0, ..Default::default() },
            TrainingConfig { learning_rate: 0.0, ..Default::default() },
            TrainingConfig { dropout_rate: 1.0, ..Default::default() },
            TrainingConfig {
                negative_class_dir: "cats".to_string(),
                ..Default::default()
            },
            TrainingConfig { backbone_weights: PathBuf::new(), ..Default::default() },
        ];
        for config in bad {
            assert!(config.validate().is_err(), "{config:?} should be rejected");
        }
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = TrainingConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.json"));
    }
}
