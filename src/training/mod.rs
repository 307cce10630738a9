pub mod callbacks;
pub mod palm;
pub mod proximal;
pub mod trainer;

use crate::data::GraphSize;
use crate::model::checkpoint::EpochMetrics;
use serde::{Deserialize, Serialize};

/// Step sizes and penalties of the PALM pruning step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PalmConfig {
    /// Hard-threshold penalty on direct gene weights
    pub reg_l0: f64,
    /// Group-lasso penalty on child blocks of term weights
    pub reg_glasso: f64,
    /// Weight decay on every other tensor
    pub reg_decay: f64,
    /// Plain gradient step for non-edge tensors
    pub lr: f64,
    /// Gradient step for edge tensors
    pub lip: f64,
}

impl Default for PalmConfig {
    fn default() -> Self {
        Self {
            reg_l0: 1e-4,
            reg_glasso: 1e-4,
            reg_decay: 1e-4,
            lr: 1e-3,
            lip: 1e-3,
        }
    }
}

/// Training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of training epochs
    pub epochs: usize,
    /// Batch size
    pub batch_size: usize,
    /// Adam learning rate
    pub learning_rate: f64,
    /// Adam first-moment decay
    pub beta_1: f32,
    /// Adam second-moment decay
    pub beta_2: f32,
    /// Adam epsilon
    pub epsilon: f32,
    /// Factor applied to every freshly initialised parameter
    pub init_scale: f64,
    /// Loss weight of every non-final output
    pub aux_loss_weight: f64,
    /// Requested accelerator id, reported in progress lines
    pub device_id: usize,
    /// PALM pruning after every backward pass; disabled when `None`
    pub palm: Option<PalmConfig>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 300,
            batch_size: 3000,
            learning_rate: 0.001,
            beta_1: 0.9,
            beta_2: 0.99,
            epsilon: 1e-5,
            init_scale: 0.1,
            aux_loss_weight: 0.2,
            device_id: 0,
            palm: None,
        }
    }
}

impl TrainingConfig {
    /// Create configuration for quick testing
    pub fn quick_test() -> Self {
        Self {
            epochs: 2,
            batch_size: 2,
            ..Default::default()
        }
    }
}

/// Training state
#[derive(Debug, Clone)]
pub struct TrainingState {
    /// Epochs completed
    pub epoch: usize,
    /// Optimizer steps taken
    pub global_step: usize,
    /// Epoch with the highest test correlation (later epoch wins ties)
    pub best_epoch: usize,
    /// Test correlation of `best_epoch`
    pub max_corr: f64,
    pub train_corr_history: Vec<f64>,
    pub test_corr_history: Vec<f64>,
    pub loss_history: Vec<f64>,
}

impl TrainingState {
    /// Create new training state
    pub fn new() -> Self {
        Self {
            epoch: 0,
            global_step: 0,
            best_epoch: 0,
            max_corr: 0.0,
            train_corr_history: Vec::new(),
            test_corr_history: Vec::new(),
            loss_history: Vec::new(),
        }
    }

    /// Record an epoch; returns whether it became the best one
    pub fn update_epoch(&mut self, metrics: &EpochMetrics) -> bool {
        self.epoch += 1;
        self.train_corr_history.push(metrics.train_corr);
        self.test_corr_history.push(metrics.test_corr);
        self.loss_history.push(metrics.total_loss);

        if metrics.test_corr >= self.max_corr {
            self.max_corr = metrics.test_corr;
            self.best_epoch = metrics.epoch;
            true
        } else {
            false
        }
    }
}

impl Default for TrainingState {
    fn default() -> Self {
        Self::new()
    }
}

/// Training result
#[derive(Debug, Clone)]
pub struct TrainingResult {
    /// Final training state
    pub state: TrainingState,
    /// Graph reachable from the root over edges still live after pruning
    pub active_graph: GraphSize,
    /// Report of the last pruning step, if pruning ran
    pub last_prune: Option<palm::PruneReport>,
    /// Training duration in seconds
    pub duration_secs: f64,
}
