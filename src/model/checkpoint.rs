//! Per-epoch model snapshots: weights plus a JSON metadata sidecar.

use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::model::architecture::DrugCellNet;
use crate::model::ModelConfig;
use crate::training::{TrainingConfig, TrainingState};
use crate::utils::ensure_dir;

/// Full-precision named MessagePack records (`.mpk`)
type ModelRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Per-epoch training metrics
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EpochMetrics {
    /// Zero-based epoch
    pub epoch: usize,
    /// Spearman correlation over the training set
    pub train_corr: f64,
    /// Spearman correlation over the test set
    pub test_corr: f64,
    /// Loss of the last batch of the epoch
    pub total_loss: f64,
}

/// Checkpoint metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Crate version that wrote the checkpoint
    pub version: String,
    /// Metrics of the epoch that produced the weights
    pub metrics: EpochMetrics,
    /// Best epoch so far
    pub best_epoch: usize,
    /// Test correlation of the best epoch
    pub max_corr: f64,
    /// Model configuration
    pub model_config: ModelConfig,
    /// Training configuration
    pub training_config: TrainingConfig,
    /// Seconds since the Unix epoch
    pub saved_at: u64,
}

impl CheckpointMetadata {
    pub fn new(
        metrics: &EpochMetrics,
        state: &TrainingState,
        model_config: &ModelConfig,
        training_config: &TrainingConfig,
    ) -> Self {
        let saved_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            version: crate::VERSION.to_string(),
            metrics: metrics.clone(),
            best_epoch: state.best_epoch,
            max_corr: state.max_corr,
            model_config: model_config.clone(),
            training_config: training_config.clone(),
            saved_at,
        }
    }
}

/// Destination for the weights written after every epoch
pub trait CheckpointSink<B: Backend> {
    fn save(&mut self, model: &DrugCellNet<B>, metadata: &CheckpointMetadata) -> Result<()>;
}

/// Writes `model_final.mpk` (weights) and `model_final.json` (metadata) into a
/// directory, overwriting the previous epoch.
pub struct FileCheckpointSink {
    checkpoint_dir: PathBuf,
}

impl FileCheckpointSink {
    pub const MODEL_NAME: &'static str = "model_final";

    /// Create the sink, creating `checkpoint_dir` if needed
    pub fn new<P: AsRef<Path>>(checkpoint_dir: P) -> Result<Self> {
        let checkpoint_dir = checkpoint_dir.as_ref().to_path_buf();
        ensure_dir(&checkpoint_dir).context("Failed to create model directory")?;
        Ok(Self { checkpoint_dir })
    }

    /// Weight file path; the recorder appends its own extension
    pub fn model_path(&self) -> PathBuf {
        self.checkpoint_dir.join(Self::MODEL_NAME)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.checkpoint_dir.join(format!("{}.json", Self::MODEL_NAME))
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    /// Load the last saved weights into a network of the same layout
    pub fn load<B: Backend>(
        &self,
        model: DrugCellNet<B>,
        device: &B::Device,
    ) -> Result<(DrugCellNet<B>, CheckpointMetadata)> {
        info!("Loading checkpoint from {:?}", self.model_path());

        let record = ModelRecorder::new()
            .load(self.model_path(), device)
            .context("Failed to load model checkpoint")?;
        let model = model.load_record(record);

        let metadata_json = fs::read_to_string(self.metadata_path())
            .context("Failed to read metadata file")?;
        let metadata: CheckpointMetadata = serde_json::from_str(&metadata_json)
            .context("Failed to parse metadata")?;

        info!("Loaded checkpoint from epoch {}", metadata.metrics.epoch);
        Ok((model, metadata))
    }
}

impl<B: Backend> CheckpointSink<B> for FileCheckpointSink {
    fn save(&mut self, model: &DrugCellNet<B>, metadata: &CheckpointMetadata) -> Result<()> {
        let record = model.clone().into_record();
        ModelRecorder::new()
            .record(record, self.model_path())
            .context("Failed to save model checkpoint")?;

        let metadata_json = serde_json::to_string_pretty(metadata)
            .context("Failed to serialize metadata")?;
        fs::write(self.metadata_path(), metadata_json)
            .context("Failed to write metadata file")?;

        debug!("Saved checkpoint for epoch {}", metadata.metrics.epoch);
        Ok(())
    }
}

/// Keeps the metadata of every save in memory
#[derive(Debug, Default)]
pub struct MemoryCheckpointSink {
    pub saved: Vec<CheckpointMetadata>,
}

impl<B: Backend> CheckpointSink<B> for MemoryCheckpointSink {
    fn save(&mut self, _model: &DrugCellNet<B>, metadata: &CheckpointMetadata) -> Result<()> {
        self.saved.push(metadata.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::architecture::{init_model, tests::two_term_ontology, TermLayout};
    use crate::utils::tensor_to_vec;
    use burn::backend::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn create_test_metadata() -> CheckpointMetadata {
        let mut state = TrainingState::new();
        let metrics = EpochMetrics {
            epoch: 4,
            train_corr: 0.5,
            test_corr: 0.25,
            total_loss: 0.1,
        };
        state.update_epoch(&metrics);
        CheckpointMetadata::new(
            &metrics,
            &state,
            &ModelConfig::new(3, 2, vec![2]),
            &TrainingConfig::default(),
        )
    }

    #[test]
    fn test_checkpoint_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let mut sink = FileCheckpointSink::new(temp_dir.path().join("MODEL")).unwrap();

        let device = <TestBackend as Backend>::Device::default();
        let layout = TermLayout::from_ontology(&two_term_ontology(), 3).unwrap();
        let config = ModelConfig::new(3, 2, vec![2]);
        let model = init_model::<TestBackend>(&config, &layout, &device).unwrap();

        let metadata = create_test_metadata();
        sink.save(&model, &metadata).unwrap();

        let written: Vec<String> = fs::read_dir(sink.checkpoint_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(written.iter().any(|name| name.starts_with("model_final") && !name.ends_with(".json")));
        assert!(sink.metadata_path().exists());

        let fresh = init_model::<TestBackend>(&config.clone().with_seed(7), &layout, &device).unwrap();
        let (loaded, loaded_metadata) = sink.load(fresh, &device).unwrap();

        assert_eq!(loaded_metadata.metrics, metadata.metrics);
        assert_eq!(loaded_metadata.best_epoch, 4);
        assert!(written.contains(&"model_final.mpk".to_string()));
        assert_eq!(
            tensor_to_vec(loaded.final_linear.weight.val()).unwrap(),
            tensor_to_vec(model.final_linear.weight.val()).unwrap()
        );
        for ((_, saved), (_, restored)) in model.direct_layers().zip(loaded.direct_layers()) {
            assert_eq!(
                tensor_to_vec(restored.weight.val()).unwrap(),
                tensor_to_vec(saved.weight.val()).unwrap()
            );
        }
    }

    #[test]
    fn test_memory_sink_records_saves() {
        let device = <TestBackend as Backend>::Device::default();
        let layout = TermLayout::from_ontology(&two_term_ontology(), 3).unwrap();
        let model =
            init_model::<TestBackend>(&ModelConfig::new(3, 2, vec![2]), &layout, &device).unwrap();

        let mut sink = MemoryCheckpointSink::default();
        sink.save(&model, &create_test_metadata()).unwrap();
        assert_eq!(sink.saved.len(), 1);
    }
}
