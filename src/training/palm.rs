//! Proximal alternating linearized minimization (PALM) pruning step.
//!
//! Runs between the backward pass and the optimizer step. Direct gene
//! weights get a hard threshold, each child block of a term layer gets a
//! group soft threshold, and everything else is decayed. A child block that
//! ends up all zero removes its ontology edge from the live set.

use crate::data::{ActiveEdges, GraphSize, Ontology};
use crate::model::architecture::{DrugCellNet, SlotRole, TermLayout};
use crate::training::proximal::{proximal_glasso_nonoverlap, proximal_l0, proximal_l2};
use crate::training::PalmConfig;
use crate::utils::tensor_to_vec;
use anyhow::Result;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use tracing::{debug, info};

/// Outcome of one pruning step
#[derive(Debug, Clone, PartialEq)]
pub struct PruneReport {
    /// Graph reachable from the root in the unpruned ontology
    pub before: GraphSize,
    /// Graph reachable from the root after the step
    pub after: GraphSize,
    /// `(parent, child)` edges removed by this step
    pub removed_edges: Vec<(String, String)>,
}

pub struct PalmPruner {
    config: PalmConfig,
}

impl PalmPruner {
    pub fn new(config: PalmConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PalmConfig {
        &self.config
    }

    /// Apply one proximal step to every parameter using the gradients of
    /// the last backward pass.
    ///
    /// Edge liveness is recomputed from the full ontology on every call, so
    /// an edge whose block became non-zero again is live in the returned set.
    pub fn step<B: AutodiffBackend>(
        &self,
        net: DrugCellNet<B>,
        grads: &B::Gradients,
        layout: &TermLayout,
        ontology: &Ontology,
    ) -> Result<(DrugCellNet<B>, ActiveEdges, PruneReport)> {
        let cfg = &self.config;
        let full = ontology.active_edges();
        let mut pruned = full.clone();
        let mut removed_edges = Vec::new();

        let net = net.map_slots(&mut |role, dense| {
            let weight = dense.weight.val();
            let bias = dense.bias.val();
            let weight_grad = weight
                .grad(grads)
                .unwrap_or_else(|| weight.clone().inner().zeros_like());
            let bias_grad = bias
                .grad(grads)
                .unwrap_or_else(|| bias.clone().inner().zeros_like());
            let (weight, bias) = (weight.inner(), bias.inner());

            let new_weight = match role {
                SlotRole::DirectGene { .. } => {
                    proximal_l0(weight - weight_grad.mul_scalar(cfg.lip), cfg.reg_l0)
                }
                SlotRole::TermLinear { term } => self.prune_term_linear(
                    term,
                    weight,
                    weight_grad,
                    layout,
                    ontology,
                    &mut pruned,
                    &mut removed_edges,
                )?,
                SlotRole::Other => {
                    proximal_l2(weight - weight_grad.mul_scalar(cfg.lr), cfg.reg_decay)
                }
            };
            let new_bias = proximal_l2(bias - bias_grad.mul_scalar(cfg.lr), cfg.reg_decay);

            Ok(dense.with_values(Tensor::from_inner(new_weight), Tensor::from_inner(new_bias)))
        })?;

        let before = ontology.reachable_from_root(&full);
        let after = ontology.reachable_from_root(&pruned);
        info!("Original graph has {} nodes and {} edges", before.nodes, before.edges);
        info!("Pruned   graph has {} nodes and {} edges", after.nodes, after.edges);

        Ok((
            net,
            pruned,
            PruneReport {
                before,
                after,
                removed_edges,
            },
        ))
    }

    /// Group-lasso each child block of a term layer, decay the direct block
    #[allow(clippy::too_many_arguments)]
    fn prune_term_linear<I: Backend>(
        &self,
        term: usize,
        weight: Tensor<I, 2>,
        grad: Tensor<I, 2>,
        layout: &TermLayout,
        ontology: &Ontology,
        active: &mut ActiveEdges,
        removed_edges: &mut Vec<(String, String)>,
    ) -> Result<Tensor<I, 2>> {
        let cfg = &self.config;
        let spec = &layout.terms[term];
        let hg = layout.num_hiddens_genotype;
        let [rows, cols] = weight.dims();
        let mut updated = weight.clone();

        for (i, &child) in spec.children.iter().enumerate() {
            let block_cols = i * hg..(i + 1) * hg;
            let block = weight.clone().slice([0..rows, block_cols.clone()]);
            let block_grad = grad.clone().slice([0..rows, block_cols.clone()]);
            let block = proximal_glasso_nonoverlap(block - block_grad.mul_scalar(cfg.lip), cfg.reg_glasso);

            let all_zero = tensor_to_vec(block.clone())?.iter().all(|&v| v == 0.0);
            updated = updated.slice_assign([0..rows, block_cols], block);

            if all_zero {
                let child_name = &layout.terms[child].name;
                let edge = ontology.edge_between(&spec.name, child_name)?;
                if active.remove(edge) {
                    debug!("Removed edge {} -> {}", spec.name, child_name);
                    removed_edges.push((spec.name.clone(), child_name.clone()));
                }
            }
        }

        let direct_start = spec.children.len() * hg;
        if spec.children.is_empty() {
            debug!("Term {} has no children, decaying its whole input block", spec.name);
        }
        if direct_start < cols {
            let block = weight.slice([0..rows, direct_start..cols]);
            let block_grad = grad.slice([0..rows, direct_start..cols]);
            let block = proximal_l2(block - block_grad.mul_scalar(cfg.lr), cfg.reg_decay);
            updated = updated.slice_assign([0..rows, direct_start..cols], block);
        }

        Ok(updated)
    }
}
