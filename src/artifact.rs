//! Trained model persistence.
//!
//! One gzip-compressed tar file holds:
//! - `metadata.json`  - architecture, class layout, class weights, training summary
//! - `model.bin`      - classifier weights (full precision burn record)
//! - `optimizer.bin`  - optimizer state record, when available

use anyhow::{anyhow, bail, Context, Result};
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Record, Recorder},
    tensor::backend::Backend,
};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::Read,
    path::Path,
};
use tar::{Archive, Builder, Header};

use crate::{
    cat_model::{CatClassifier, ClassifierConfig},
    class_weights::ClassWeights,
    metrics::EpochMetrics,
};

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";
const OPTIMIZER_ENTRY: &str = "optimizer.bin";

type BytesRecorder = BinBytesRecorder<FullPrecisionSettings>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub classifier: ClassifierConfig,
    /// Class directory names indexed by label.
    pub class_names: Vec<String>,
    pub class_weights: ClassWeights,
    pub history: Vec<EpochMetrics>,
    pub best_epoch: Option<usize>,
    pub stopped_early: bool,
    pub restored_best: bool,
    pub trained_at: String,
}

impl ArtifactMetadata {
    pub fn new(classifier: ClassifierConfig, class_names: Vec<String>, class_weights: ClassWeights) -> Self {
        Self {
            classifier,
            class_names,
            class_weights,
            history: Vec::new(),
            best_epoch: None,
            stopped_early: false,
            restored_best: false,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }
}

/// Serializes any record (module or optimizer state) to bytes.
pub fn encode_record<B: Backend, R: Record<B>>(record: R) -> Result<Vec<u8>> {
    Recorder::<B>::record(&BytesRecorder::default(), record, ())
        .map_err(|e| anyhow!("Failed to encode record: {e:?}"))
}

pub fn decode_record<B: Backend, R: Record<B>>(bytes: Vec<u8>, device: &B::Device) -> Result<R> {
    Recorder::<B>::load(&BytesRecorder::default(), bytes, device)
        .map_err(|e| anyhow!("Failed to decode record: {e:?}"))
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, bytes)
        .with_context(|| format!("Failed to add {name} to archive"))
}

/// Writes the artifact to `path`, creating parent directories. An existing
/// file is overwritten.
pub fn save_artifact<B: Backend>(
    path: &Path,
    metadata: &ArtifactMetadata,
    model: CatClassifier<B>,
    optimizer_state: Option<&[u8]>,
) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let metadata_json = serde_json::to_vec_pretty(metadata)?;
    let model_bytes = encode_record::<B, _>(model.into_record())?;

    let file = File::create(path)
        .with_context(|| format!("Failed to create model file {}", path.display()))?;
    let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));

    append_entry(&mut builder, METADATA_ENTRY, &metadata_json)?;
    append_entry(&mut builder, MODEL_ENTRY, &model_bytes)?;
    if let Some(state) = optimizer_state {
        append_entry(&mut builder, OPTIMIZER_ENTRY, state)?;
    }

    builder
        .into_inner()
        .context("Failed to finalize model archive")?
        .finish()
        .context("Failed to flush model archive")?;
    Ok(())
}

/// Raw contents of an artifact file.
#[derive(Debug)]
pub struct Artifact {
    pub metadata: ArtifactMetadata,
    pub model_bytes: Vec<u8>,
    pub optimizer_bytes: Option<Vec<u8>>,
}

pub fn read_artifact(path: &Path) -> Result<Artifact> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open model file {}", path.display()))?;
    let mut archive = Archive::new(GzDecoder::new(file));

    let mut metadata = None;
    let mut model_bytes = None;
    let mut optimizer_bytes = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let mut buffer = Vec::new();
        entry.read_to_end(&mut buffer)?;

        match name.as_str() {
            METADATA_ENTRY => {
                metadata = Some(
                    serde_json::from_slice::<ArtifactMetadata>(&buffer)
                        .with_context(|| format!("Invalid {METADATA_ENTRY} in {}", path.display()))?,
                )
            }
            MODEL_ENTRY => model_bytes = Some(buffer),
            OPTIMIZER_ENTRY => optimizer_bytes = Some(buffer),
            _ => {}
        }
    }

    match (metadata, model_bytes) {
        (Some(metadata), Some(model_bytes)) => Ok(Artifact {
            metadata,
            model_bytes,
            optimizer_bytes,
        }),
        (None, _) => bail!("{METADATA_ENTRY} not found in {}", path.display()),
        (_, None) => bail!("{MODEL_ENTRY} not found in {}", path.display()),
    }
}

/// Rebuilds the classifier described by the artifact and loads its weights.
pub fn load_classifier<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> Result<(ArtifactMetadata, CatClassifier<B>)> {
    let artifact = read_artifact(path)?;
    let record = decode_record::<B, _>(artifact.model_bytes, device)
        .with_context(|| format!("Failed to load weights from {}", path.display()))?;
    let model = artifact.metadata.classifier.init::<B>(device).load_record(record);
    Ok((artifact.metadata, model))
}
