//! # DrugCell: ontology-structured drug response modelling
//!
//! DrugCell predicts the response of a cell line to a drug with a network
//! whose genotype branch mirrors a gene ontology: every term owns a small
//! block of hidden units fed by its child terms and by the genes annotated
//! straight to it.
//!
//! ## Features
//!
//! - Ontology loading and validation (single root, connected, acyclic)
//! - Binary gene masks keeping direct gene weights on their term's genes
//! - Auxiliary per-term losses and Spearman-tracked training
//! - Optional PALM pruning of ontology edges
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use drugcell::data::loader::{load_feature_table, load_mapping, load_ontology, prepare_train_data};
//! use drugcell::model::{checkpoint::FileCheckpointSink, ModelConfig};
//! use drugcell::training::{trainer::Trainer, TrainingConfig};
//! use drugcell::utils::ExecutionContext;
//! use drugcell::TrainBackend;
//!
//! let (data, _, _) = prepare_train_data("train.txt", "test.txt", "cell2ind.txt", "drug2ind.txt").unwrap();
//! let gene2id = load_mapping("gene2ind.txt").unwrap();
//! let cells = load_feature_table("cell2mutation.txt").unwrap();
//! let drugs = load_feature_table("drug2fingerprint.txt").unwrap();
//! let ontology = load_ontology("drugcell_ont.txt", &gene2id).unwrap();
//!
//! let model_config = ModelConfig::drugcell_default(gene2id.len(), drugs.cols);
//! let mut trainer = Trainer::new(TrainingConfig::default(), model_config, ExecutionContext::<TrainBackend>::cpu());
//! let mut sink = FileCheckpointSink::new("MODEL").unwrap();
//! let (_model, result) = trainer.train(&ontology, &data, &cells, &drugs, &mut sink).unwrap();
//! println!("best epoch {}", result.state.best_epoch);
//! ```

pub mod cli;
pub mod data;
pub mod model;
pub mod training;
pub mod utils;

use burn::backend::Autodiff;
use burn_ndarray::NdArray;

/// Default backend type
pub type DefaultBackend = NdArray<f32>;

/// Backend used for training
pub type TrainBackend = Autodiff<DefaultBackend>;

/// Re-export commonly used types
pub use data::{FeatureTable, Ontology, PairSet, TrainingData};
pub use model::{architecture::DrugCellNet, ModelConfig};
pub use training::{TrainingConfig, TrainingResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get library information
pub fn info() -> String {
    format!(
        "{} v{} - ontology-structured drug response modelling",
        NAME, VERSION
    )
}
