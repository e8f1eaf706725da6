use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use cat_classifier::{
    backend::{backend_name, default_device, TrainingBackend},
    config::TrainingConfig,
    logging::init_logging,
    training::CatTrainer,
};

/// Train a cat / non-cat classifier on `<dataset>/cats` and `<dataset>/others`.
#[derive(Parser, Debug)]
#[command(name = "cat-classifier", version, about, long_about = None)]
struct Cli {
    /// JSON training config; fields left out take their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dataset root holding one subdirectory per class
    #[arg(short, long)]
    dataset: Option<PathBuf>,

    /// Where to write the trained model archive
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Maximum number of epochs
    #[arg(short, long)]
    epochs: Option<usize>,

    #[arg(short, long)]
    batch_size: Option<usize>,

    /// safetensors checkpoint with ImageNet EfficientNet-B0 weights
    #[arg(long)]
    backbone_weights: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,

    /// Enable debug logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

impl Cli {
    fn resolve_config(&self) -> Result<TrainingConfig> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::load(path)?,
            None => TrainingConfig::default(),
        };
        if let Some(dataset) = &self.dataset {
            config.dataset_path = dataset.clone();
        }
        if let Some(output) = &self.output {
            config.model_path = output.clone();
        }
        if let Some(epochs) = self.epochs {
            config.num_epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(weights) = &self.backbone_weights {
            config.backbone_weights = weights.clone();
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let config = cli.resolve_config()?;
    info!("Backend: {}", backend_name());

    let report = CatTrainer::<TrainingBackend>::new(config, default_device()).run()?;
    info!(
        epochs = report.history.len(),
        best_epoch = ?report.best_epoch.map(|e| e + 1),
        stopped_early = report.stopped_early,
        restored_best = report.restored_best,
        "Done"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_defaults() {
        let cli = Cli::parse_from([
            "cat-classifier",
            "--dataset",
            "data/pets",
            "-e",
            "3",
            "--backbone-weights",
            "weights/b0.safetensors",
        ]);
        let config = cli.resolve_config().unwrap();

        assert_eq!(config.dataset_path, PathBuf::from("data/pets"));
        assert_eq!(config.num_epochs, 3);
        assert_eq!(config.backbone_weights, PathBuf::from("weights/b0.safetensors"));
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.model_path, PathBuf::from("cat_classifier.tar.gz"));
    }
}
