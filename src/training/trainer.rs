//! Training loop for the DrugCell network with optional PALM pruning.

use crate::data::{build_input_vector, FeatureTable, Ontology, PairSet, TrainingData};
use crate::model::architecture::{init_model, DrugCellNet, SlotRole, TermLayout};
use crate::model::checkpoint::{CheckpointMetadata, CheckpointSink, EpochMetrics};
use crate::model::loss::metrics::spearman_corr;
use crate::model::loss::AuxiliaryLoss;
use crate::model::mask::{create_term_mask, TermMask, TermMaskMap};
use crate::model::ModelConfig;
use crate::training::callbacks::{CallbackManager, ProgressLoggerCallback, TimerCallback, TrainingCallback};
use crate::training::palm::PalmPruner;
use crate::training::{TrainingConfig, TrainingResult, TrainingState};
use crate::utils::{tensor_to_vec, ExecutionContext};
use anyhow::{bail, Context, Result};
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use std::time::Instant;
use tracing::{debug, info};

/// Trainer for the DrugCell network
pub struct Trainer<B: AutodiffBackend> {
    /// Training configuration
    config: TrainingConfig,
    /// Model configuration
    model_config: ModelConfig,
    /// Device and requested accelerator id
    context: ExecutionContext<B>,
    callbacks: CallbackManager,
}

impl<B: AutodiffBackend> Trainer<B> {
    /// Create a trainer that reports progress lines and timing
    pub fn new(config: TrainingConfig, model_config: ModelConfig, context: ExecutionContext<B>) -> Self {
        let mut callbacks = CallbackManager::new();
        callbacks.add_callback(ProgressLoggerCallback::new(config.device_id));
        callbacks.add_callback(TimerCallback::new());

        Self {
            config,
            model_config,
            context,
            callbacks,
        }
    }

    /// Register an extra callback
    pub fn with_callback<C: TrainingCallback + 'static>(mut self, callback: C) -> Self {
        self.callbacks.add_callback(callback);
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Train a freshly initialised network, saving a checkpoint after every epoch
    pub fn train<S: CheckpointSink<B>>(
        &mut self,
        ontology: &Ontology,
        data: &TrainingData,
        cell_features: &FeatureTable,
        drug_features: &FeatureTable,
        sink: &mut S,
    ) -> Result<(DrugCellNet<B>, TrainingResult)> {
        self.validate_inputs(data, cell_features, drug_features)?;
        info!("Starting training with configuration: {:?}", self.config);

        let start_time = Instant::now();
        let device = self.context.device.clone();

        let layout = TermLayout::from_ontology(ontology, self.model_config.num_hiddens_genotype)?;
        let masks = create_term_mask::<B>(
            ontology.term_direct_gene_map(),
            self.model_config.gene_dim,
            &device,
        )?;
        let net = init_model::<B>(&self.model_config, &layout, &device)?;
        let mut net = initialize_parameters(net, &layout, &masks, self.config.init_scale)?;

        let cells = cell_features.to_tensor::<B>(&device);
        let drugs = drug_features.to_tensor::<B>(&device);
        let eval_cells = cell_features.to_tensor::<B::InnerBackend>(&device);
        let eval_drugs = drug_features.to_tensor::<B::InnerBackend>(&device);
        let train_labels = data.train.label_tensor::<B>(&device);

        let mut optim = AdamConfig::new()
            .with_beta_1(self.config.beta_1)
            .with_beta_2(self.config.beta_2)
            .with_epsilon(self.config.epsilon)
            .init::<B, DrugCellNet<B>>();
        let loss_fn = AuxiliaryLoss::new(self.config.aux_loss_weight);
        let pruner = self.config.palm.clone().map(PalmPruner::new);

        // live edges after the latest pruning step, kept for reporting only
        let mut active = ontology.active_edges();
        let mut last_prune = None;
        let mut state = TrainingState::new();
        let train_batches = data.train.batches(self.config.batch_size);

        self.callbacks.on_train_begin();

        for epoch in 0..self.config.epochs {
            self.callbacks.on_epoch_begin(epoch);

            let mut train_predict = Vec::with_capacity(data.train.len());
            let mut total_loss = 0.0;

            for (batch, range) in train_batches.iter().enumerate() {
                let cell_input = build_input_vector(&data.train.cell_ids(range.clone()), &cells)?;
                let drug_input = build_input_vector(&data.train.drug_ids(range.clone()), &drugs)?;
                let labels = train_labels.clone().slice([range.clone(), 0..1]);

                let outputs = net.forward(&layout, cell_input, drug_input);
                train_predict.extend(tensor_to_vec(outputs.final_output.clone().inner())?);

                let loss = loss_fn.forward(&outputs, labels);
                total_loss = loss.clone().into_scalar().elem::<f64>();

                let mut grads = loss.backward();
                mask_gradients(&net, &layout, &masks, &mut grads)?;

                let pruned = match &pruner {
                    Some(pruner) => Some(pruner.step(net.clone(), &grads, &layout, ontology)?),
                    None => None,
                };
                let grads = GradientsParams::from_grads(grads, &net);
                if let Some((pruned_net, pruned_active, report)) = pruned {
                    net = pruned_net;
                    active = pruned_active;
                    last_prune = Some(report);
                }
                net = optim.step(self.config.learning_rate, net, grads);

                state.global_step += 1;
                self.callbacks.on_batch_end(batch, total_loss);
            }

            let train_corr = spearman_corr(&train_predict, &data.train.labels)?;

            let test_predict = predict(
                &net.valid(),
                &layout,
                &data.test,
                &eval_cells,
                &eval_drugs,
                self.config.batch_size,
            )?;
            let test_corr = spearman_corr(&test_predict, &data.test.labels)?;

            let metrics = EpochMetrics {
                epoch,
                train_corr,
                test_corr,
                total_loss,
            };
            if state.update_epoch(&metrics) {
                debug!("Epoch {} is the new best with test correlation {:.6}", epoch, test_corr);
            }

            let metadata = CheckpointMetadata::new(&metrics, &state, &self.model_config, &self.config);
            sink.save(&net, &metadata)
                .with_context(|| format!("Failed to save checkpoint for epoch {}", epoch))?;

            self.callbacks.on_epoch_end(epoch, &state, &metrics);
        }

        self.callbacks.on_train_end(&state);

        let result = TrainingResult {
            active_graph: ontology.reachable_from_root(&active),
            last_prune,
            duration_secs: start_time.elapsed().as_secs_f64(),
            state,
        };
        Ok((net, result))
    }

    fn validate_inputs(
        &self,
        data: &TrainingData,
        cell_features: &FeatureTable,
        drug_features: &FeatureTable,
    ) -> Result<()> {
        if data.train.is_empty() {
            bail!("Training set is empty");
        }
        if self.config.batch_size == 0 {
            bail!("Batch size must be positive");
        }
        if cell_features.cols != self.model_config.gene_dim {
            bail!(
                "Cell features have {} columns but gene_dim is {}",
                cell_features.cols,
                self.model_config.gene_dim
            );
        }
        if drug_features.cols != self.model_config.drug_dim {
            bail!(
                "Drug features have {} columns but drug_dim is {}",
                drug_features.cols,
                self.model_config.drug_dim
            );
        }
        Ok(())
    }
}

/// Final predictions for every sample of `set`, in order
pub fn predict<B: Backend>(
    net: &DrugCellNet<B>,
    layout: &TermLayout,
    set: &PairSet,
    cells: &Tensor<B, 2>,
    drugs: &Tensor<B, 2>,
    batch_size: usize,
) -> Result<Vec<f32>> {
    let mut predictions = Vec::with_capacity(set.len());
    for range in set.batches(batch_size) {
        let cell_input = build_input_vector(&set.cell_ids(range.clone()), cells)?;
        let drug_input = build_input_vector(&set.drug_ids(range), drugs)?;
        let outputs = net.forward(layout, cell_input, drug_input);
        predictions.extend(tensor_to_vec(outputs.final_output)?);
    }
    Ok(predictions)
}

fn mask_for<'a, B: Backend>(
    masks: &'a TermMaskMap<B>,
    layout: &TermLayout,
    term: usize,
) -> Result<&'a TermMask<B>> {
    let name = &layout.terms[term].name;
    masks
        .get(name)
        .with_context(|| format!("No gene mask for term {}", name))
}

/// Scale every parameter by `scale` and zero direct gene weights outside
/// each term's mask.
pub fn initialize_parameters<B: Backend>(
    net: DrugCellNet<B>,
    layout: &TermLayout,
    masks: &TermMaskMap<B>,
    scale: f64,
) -> Result<DrugCellNet<B>> {
    net.map_slots(&mut |role, dense| {
        let weight = dense.weight.val();
        let bias = dense.bias.val();
        let weight = match role {
            SlotRole::DirectGene { term } => {
                let mask = mask_for(masks, layout, term)?;
                if mask.tensor().dims() != weight.dims() {
                    bail!(
                        "Mask of term {} has shape {:?}, weight has {:?}",
                        layout.terms[term].name,
                        mask.tensor().dims(),
                        weight.dims()
                    );
                }
                weight * mask.tensor().clone()
            }
            _ => weight,
        };
        Ok(dense.with_values(weight.mul_scalar(scale), bias.mul_scalar(scale)))
    })
}

/// Zero gradient entries of direct gene weights outside each term's mask
pub fn mask_gradients<B: AutodiffBackend>(
    net: &DrugCellNet<B>,
    layout: &TermLayout,
    masks: &TermMaskMap<B>,
    grads: &mut B::Gradients,
) -> Result<()> {
    for (term, direct) in net.direct_layers() {
        let mask = mask_for(masks, layout, term)?;
        let weight = direct.weight.val();
        if let Some(grad) = weight.grad(grads) {
            weight.grad_replace(grads, grad * mask.tensor().clone().inner());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::architecture::tests::two_term_ontology;
    use crate::model::checkpoint::{FileCheckpointSink, MemoryCheckpointSink};
    use crate::training::callbacks::HistoryCallback;
    use crate::training::PalmConfig;
    use burn::backend::{Autodiff, NdArray};
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn sample_data() -> (TrainingData, FeatureTable, FeatureTable) {
        let train = PairSet::new(
            vec![(0, 0), (1, 0), (0, 1), (1, 1)],
            vec![0.1, 0.4, 0.3, 0.9],
        )
        .unwrap();
        let test = PairSet::new(vec![(0, 1), (1, 0)], vec![0.2, 0.6]).unwrap();
        let cells = FeatureTable::from_rows(vec![vec![1.0, 0.0, 1.0], vec![0.0, 1.0, 1.0]]).unwrap();
        let drugs = FeatureTable::from_rows(vec![vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        (TrainingData { train, test }, cells, drugs)
    }

    fn trainer(config: TrainingConfig) -> Trainer<TestBackend> {
        Trainer::new(config, ModelConfig::new(3, 2, vec![2]), ExecutionContext::cpu())
    }

    /// Off-mask entries of every direct gene weight
    fn off_mask_values(net: &DrugCellNet<TestBackend>, layout: &TermLayout) -> Vec<f32> {
        let mut values = Vec::new();
        for (term, direct) in net.direct_layers() {
            let genes = &layout.terms[term].direct_genes;
            let weight = tensor_to_vec(direct.weight.val()).unwrap();
            let gene_dim = direct.d_input();
            for (row, &gene) in genes.iter().enumerate() {
                for col in (0..gene_dim).filter(|&c| c != gene) {
                    values.push(weight[row * gene_dim + col]);
                }
            }
        }
        values
    }

    #[test]
    fn test_single_epoch_end_to_end() {
        let (data, cells, drugs) = sample_data();
        let ontology = two_term_ontology();
        let callback = HistoryCallback::new();
        let history = callback.history();

        let mut trainer = trainer(TrainingConfig {
            epochs: 1,
            batch_size: 2,
            ..Default::default()
        })
        .with_callback(callback);
        let mut sink = MemoryCheckpointSink::default();

        let (_, result) = trainer.train(&ontology, &data, &cells, &drugs, &mut sink).unwrap();

        assert_eq!(result.state.epoch, 1);
        assert_eq!(result.state.global_step, 2);
        assert_eq!(result.state.best_epoch, 0);
        assert_eq!(sink.saved.len(), 1);
        assert!(result.last_prune.is_none());

        let history = history.lock().unwrap();
        let metrics = &history[0];
        assert!((-1.0..=1.0).contains(&metrics.train_corr));
        assert!((-1.0..=1.0).contains(&metrics.test_corr));
        assert!(metrics.total_loss.is_finite());
    }

    #[test]
    fn test_full_batch_linear_target_writes_one_checkpoint() {
        let cell_rows = vec![
            vec![1.0, 0.0, 0.0],
            vec![1.0, 1.0, 0.0],
            vec![1.0, 1.0, 1.0],
            vec![0.0, 0.0, 1.0],
        ];
        let drug_rows = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        // response = 0.1 * mutation count + 0.2 * first fingerprint bit
        let target = |cell: usize, drug: usize| {
            0.1 * cell_rows[cell].iter().sum::<f32>() + 0.2 * drug_rows[drug][0]
        };
        let train_pairs = vec![(0, 0), (1, 1), (2, 0), (3, 1)];
        let test_pairs = vec![(0, 1), (2, 1)];
        let train_labels = train_pairs.iter().map(|&(c, d)| target(c, d)).collect();
        let test_labels = test_pairs.iter().map(|&(c, d)| target(c, d)).collect();
        let cells = FeatureTable::from_rows(cell_rows.clone()).unwrap();
        let drugs = FeatureTable::from_rows(drug_rows.clone()).unwrap();
        let data = TrainingData {
            train: PairSet::new(train_pairs, train_labels).unwrap(),
            test: PairSet::new(test_pairs, test_labels).unwrap(),
        };

        let temp_dir = TempDir::new().unwrap();
        let mut sink = FileCheckpointSink::new(temp_dir.path().join("MODEL")).unwrap();
        let mut trainer = trainer(TrainingConfig {
            epochs: 1,
            batch_size: 4,
            ..Default::default()
        });

        let (_, result) = trainer
            .train(&two_term_ontology(), &data, &cells, &drugs, &mut sink)
            .unwrap();

        assert_eq!(result.state.global_step, 1);
        assert!((-1.0..=1.0).contains(&result.state.max_corr));

        let written: Vec<String> = std::fs::read_dir(sink.checkpoint_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        let weight_files = written
            .iter()
            .filter(|name| name.starts_with("model_final") && !name.ends_with(".json"))
            .count();
        assert_eq!(weight_files, 1);
        assert!(sink.metadata_path().exists());
    }

    #[test]
    fn test_direct_weights_stay_inside_mask() {
        let (data, cells, drugs) = sample_data();
        let ontology = two_term_ontology();
        let layout = TermLayout::from_ontology(&ontology, 3).unwrap();
        let mut sink = MemoryCheckpointSink::default();

        let (net, _) = trainer(TrainingConfig::quick_test())
            .train(&ontology, &data, &cells, &drugs, &mut sink)
            .unwrap();

        assert!(off_mask_values(&net, &layout).iter().all(|&v| v == 0.0));
        assert_eq!(sink.saved.len(), 2);
    }

    #[test]
    fn test_mask_gradients_zeroes_off_mask_entries() {
        let device = <TestBackend as Backend>::Device::default();
        let ontology = two_term_ontology();
        let layout = TermLayout::from_ontology(&ontology, 3).unwrap();
        let masks =
            create_term_mask::<TestBackend>(ontology.term_direct_gene_map(), 3, &device).unwrap();
        let net = init_model::<TestBackend>(&ModelConfig::new(3, 2, vec![2]), &layout, &device)
            .unwrap();

        let outputs = net.forward(
            &layout,
            Tensor::ones([2, 3], &device),
            Tensor::ones([2, 2], &device),
        );
        let labels = Tensor::zeros([2, 1], &device);
        let mut grads = AuxiliaryLoss::new(0.2).forward(&outputs, labels).backward();
        mask_gradients(&net, &layout, &masks, &mut grads).unwrap();

        for (term, direct) in net.direct_layers() {
            let grad = tensor_to_vec(direct.weight.val().grad(&grads).unwrap()).unwrap();
            let genes = &layout.terms[term].direct_genes;
            for (row, &gene) in genes.iter().enumerate() {
                for col in 0..3 {
                    if col != gene {
                        assert_eq!(grad[row * 3 + col], 0.0);
                    }
                }
            }
        }
    }

    #[test]
    fn test_initialization_scales_and_masks() {
        let device = <TestBackend as Backend>::Device::default();
        let ontology = two_term_ontology();
        let layout = TermLayout::from_ontology(&ontology, 3).unwrap();
        let masks =
            create_term_mask::<TestBackend>(ontology.term_direct_gene_map(), 3, &device).unwrap();
        let config = ModelConfig::new(3, 2, vec![2]);

        let raw = init_model::<TestBackend>(&config, &layout, &device).unwrap();
        let raw_final = tensor_to_vec(raw.final_linear.weight.val()).unwrap();
        let net = initialize_parameters(raw, &layout, &masks, 0.1).unwrap();

        let scaled = tensor_to_vec(net.final_linear.weight.val()).unwrap();
        for (s, r) in scaled.iter().zip(&raw_final) {
            assert!((s - r * 0.1).abs() < 1e-7);
        }
        assert!(off_mask_values(&net, &layout).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_training_with_pruning() {
        let (data, cells, drugs) = sample_data();
        let ontology = two_term_ontology();
        let mut sink = MemoryCheckpointSink::default();

        let (_, result) = trainer(TrainingConfig {
            epochs: 1,
            batch_size: 4,
            palm: Some(PalmConfig::default()),
            ..Default::default()
        })
        .train(&ontology, &data, &cells, &drugs, &mut sink)
        .unwrap();

        let report = result.last_prune.unwrap();
        assert_eq!(report.before.nodes, 2);
        assert!(result.active_graph.nodes <= 2);
    }

    #[test]
    fn test_feature_width_mismatch_rejected() {
        let (data, _, drugs) = sample_data();
        let cells = FeatureTable::from_rows(vec![vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        let mut sink = MemoryCheckpointSink::default();

        let result = trainer(TrainingConfig::quick_test()).train(
            &two_term_ontology(),
            &data,
            &cells,
            &drugs,
            &mut sink,
        );
        assert!(result.is_err());
        assert!(sink.saved.is_empty());
    }
}
