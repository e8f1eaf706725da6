use crate::{
    artifact::{encode_record, save_artifact, ArtifactMetadata},
    cat_model::{binary_cross_entropy, count_correct, CatClassifier, ClassifierConfig},
    class_weights::ClassWeights,
    config::TrainingConfig,
    data::{BatchSequence, CatBatcher, CatDataset, ImageItem},
    early_stopping::{Decision, EarlyStopping, EpochObserver},
    metrics::{EpochMetrics, PassAccumulator},
};
use anyhow::{bail, Context, Result};
use burn::{
    data::dataset::Dataset,
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use rand::{rngs::StdRng, SeedableRng};
use std::{path::PathBuf, time::Instant};
use tracing::{debug, info};

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub history: Vec<EpochMetrics>,
    pub best_epoch: Option<usize>,
    pub stopped_early: bool,
    pub restored_best: bool,
    pub model_path: PathBuf,
}

struct TrainedModel<B: AutodiffBackend> {
    model: CatClassifier<B>,
    optimizer_state: Vec<u8>,
    history: Vec<EpochMetrics>,
    best_epoch: Option<usize>,
    stopped_early: bool,
    restored_best: bool,
}

pub struct CatTrainer<B: AutodiffBackend> {
    config: TrainingConfig,
    device: B::Device,
}

impl<B: AutodiffBackend> CatTrainer<B> {
    pub fn new(config: TrainingConfig, device: B::Device) -> Self {
        Self { config, device }
    }

    pub fn run(&self) -> Result<TrainingReport> {
        self.config.validate()?;
        info!(
            backend = std::any::type_name::<B>(),
            device = ?self.device,
            image_size = %format!("{}x{}", self.config.image_width, self.config.image_height),
            batch_size = self.config.batch_size,
            learning_rate = self.config.learning_rate,
            "Starting training"
        );

        let class_weights = ClassWeights::from_directories(
            &self.config.dataset_path,
            &self.config.negative_class_dir,
            &self.config.positive_class_dir,
        )?;
        println!("🔹 Class weights: {class_weights}");

        let (train_data, valid_data) = self.create_datasets()?;
        let model = self.create_model()?;

        let trained = self.train_model(model, &class_weights, &train_data, &valid_data)?;
        self.save_trained(&trained, class_weights)?;
        println!("✅ Model saved to {}", self.config.model_path.display());

        Ok(TrainingReport {
            history: trained.history,
            best_epoch: trained.best_epoch,
            stopped_early: trained.stopped_early,
            restored_best: trained.restored_best,
            model_path: self.config.model_path.clone(),
        })
    }

    fn save_trained(&self, trained: &TrainedModel<B>, class_weights: ClassWeights) -> Result<()> {
        let mut metadata = ArtifactMetadata::new(
            self.classifier_config(),
            self.config.class_dirs().iter().map(|s| s.to_string()).collect(),
            class_weights,
        );
        metadata.history = trained.history.clone();
        metadata.best_epoch = trained.best_epoch;
        metadata.stopped_early = trained.stopped_early;
        metadata.restored_best = trained.restored_best;

        save_artifact(
            &self.config.model_path,
            &metadata,
            trained.model.valid(),
            Some(&trained.optimizer_state),
        )
    }

    fn classifier_config(&self) -> ClassifierConfig {
        ClassifierConfig::new(self.config.image_height, self.config.image_width)
            .with_dropout_rate(self.config.dropout_rate)
            .with_hidden_units(self.config.hidden_units)
    }

    fn create_datasets(&self) -> Result<(CatDataset, CatDataset)> {
        let dataset = CatDataset::scan(&self.config.dataset_path, &self.config.class_dirs())?;
        let (train_data, valid_data) = dataset.split(self.config.validation_split);

        if train_data.is_empty() {
            bail!("Training subset is empty");
        }
        if valid_data.is_empty() {
            bail!(
                "Validation subset is empty; a split of {} leaves no images for validation",
                self.config.validation_split
            );
        }

        let [n_other, n_cat] = dataset.class_counts();
        info!(
            "Found {} images ({}: {n_other}, {}: {n_cat}): {} train, {} validation",
            dataset.len(),
            self.config.negative_class_dir,
            self.config.positive_class_dir,
            train_data.len(),
            valid_data.len()
        );
        Ok((train_data, valid_data))
    }

    fn create_model(&self) -> Result<CatClassifier<B>> {
        let path = &self.config.backbone_weights;
        info!("Loading pretrained backbone from {}", path.display());
        self.classifier_config()
            .init::<B>(&self.device)
            .with_backbone_weights(path, &self.device)
    }

    fn train_model(
        &self,
        mut model: CatClassifier<B>,
        class_weights: &ClassWeights,
        train_data: &CatDataset,
        valid_data: &CatDataset,
    ) -> Result<TrainedModel<B>> {
        let config = &self.config;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut optim = AdamConfig::new()
            .with_beta_1(0.9)
            .with_beta_2(0.999)
            .with_epsilon(config.adam_epsilon)
            .init::<B, CatClassifier<B>>();

        let train_batcher = CatBatcher::<B>::new(
            config.image_height,
            config.image_width,
            config.augmentation.clone(),
            self.device.clone(),
        );
        let valid_augmentation = if config.augment_validation {
            config.augmentation.clone()
        } else {
            config.augmentation.rescale_only()
        };
        let valid_batcher = CatBatcher::<B::InnerBackend>::new(
            config.image_height,
            config.image_width,
            valid_augmentation,
            self.device.clone(),
        );

        let train_sequence = BatchSequence::new(train_data.len(), config.batch_size)?;
        let valid_sequence = BatchSequence::new(valid_data.len(), config.batch_size)?;
        let mut early_stopping = EarlyStopping::<CatClassifier<B>>::new(&config.early_stopping);
        let mut history = Vec::with_capacity(config.num_epochs);
        let start_time = Instant::now();

        info!(
            "Training for up to {} epochs ({} train / {} validation batches per epoch)",
            config.num_epochs,
            train_sequence.num_batches(),
            valid_sequence.num_batches()
        );

        for epoch in 0..config.num_epochs {
            let mut train_pass = PassAccumulator::default();
            let batches: Vec<Vec<usize>> = train_sequence.epoch(&mut rng).collect();
            for (iteration, indices) in batches.iter().enumerate() {
                let items = gather(train_data, indices)?;
                let batch = train_batcher.batch(&items, &mut rng)?;

                let probs = model.forward_train(batch.images);
                let correct = count_correct(probs.clone().inner(), batch.targets.clone().inner());
                let loss = binary_cross_entropy(probs, batch.targets, Some(class_weights));
                let loss_value: f64 = loss.clone().into_scalar().elem();

                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optim.step(config.learning_rate, model, grads);

                train_pass.record(loss_value, correct, items.len());
                debug!(
                    "epoch {} batch {}/{} loss {:.4}",
                    epoch + 1,
                    iteration + 1,
                    batches.len(),
                    loss_value
                );
            }

            let model_valid = model.valid();
            let mut valid_pass = PassAccumulator::default();
            let batches: Vec<Vec<usize>> = valid_sequence.epoch(&mut rng).collect();
            for indices in &batches {
                let items = gather(valid_data, indices)?;
                let batch = valid_batcher.batch(&items, &mut rng)?;

                let probs = model_valid.forward(batch.images);
                let correct = count_correct(probs.clone(), batch.targets.clone());
                let loss = binary_cross_entropy(probs, batch.targets, None);
                valid_pass.record(loss.into_scalar().elem(), correct, items.len());
            }

            let metrics = EpochMetrics {
                epoch,
                train_loss: train_pass.mean_loss(),
                train_accuracy: train_pass.accuracy(),
                valid_loss: valid_pass.mean_loss(),
                valid_accuracy: valid_pass.accuracy(),
            };
            info!("{metrics}");
            let decision = early_stopping.on_epoch_end(&metrics, &model);
            history.push(metrics);
            if decision == Decision::Stop {
                break;
            }
        }

        info!("Training finished in {:?}", start_time.elapsed());

        let stopped_early = early_stopping.stopped_epoch().is_some();
        let restored_best = match early_stopping.take_restore_state() {
            Some(best) => {
                info!(
                    "Restoring weights from epoch {}",
                    early_stopping.best_epoch().map_or(0, |e| e + 1)
                );
                model = best;
                true
            }
            None => false,
        };

        Ok(TrainedModel {
            optimizer_state: encode_record::<B, _>(optim.to_record())?,
            model,
            history,
            best_epoch: early_stopping.best_epoch(),
            stopped_early,
            restored_best,
        })
    }
}

fn gather<D: Dataset<ImageItem>>(dataset: &D, indices: &[usize]) -> Result<Vec<ImageItem>> {
    indices
        .iter()
        .map(|&i| {
            dataset
                .get(i)
                .with_context(|| format!("Sample index {i} out of range ({} samples)", dataset.len()))
        })
        .collect()
}
