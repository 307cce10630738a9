use burn::nn::loss::{MseLoss, Reduction};
use burn::prelude::*;

use crate::model::architecture::AuxOutputs;

/// Mean squared error over every output of the network.
///
/// The `"final"` output counts with weight 1; every term and drug-layer
/// output counts with `aux_weight`.
#[derive(Clone, Debug)]
pub struct AuxiliaryLoss {
    aux_weight: f64,
}

impl AuxiliaryLoss {
    pub fn new(aux_weight: f64) -> Self {
        Self { aux_weight }
    }

    pub fn aux_weight(&self) -> f64 {
        self.aux_weight
    }

    /// Compute the weighted loss against `labels` `[batch, 1]`
    pub fn forward<B: Backend>(&self, outputs: &AuxOutputs<B>, labels: Tensor<B, 2>) -> Tensor<B, 1> {
        let mse = MseLoss::new();
        let mut total = mse.forward(outputs.final_output.clone(), labels.clone(), Reduction::Mean);

        for output in outputs.auxiliary.values() {
            let term_loss = mse.forward(output.clone(), labels.clone(), Reduction::Mean);
            total = total + term_loss.mul_scalar(self.aux_weight);
        }
        total
    }
}

/// Metrics for evaluation
pub mod metrics {
    use anyhow::{bail, Result};

    /// 1-based ranks, tied values sharing the average of their positions
    pub fn rank(values: &[f32]) -> Vec<f64> {
        let mut order: Vec<usize> = (0..values.len()).collect();
        order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

        let mut ranks = vec![0.0; values.len()];
        let mut start = 0;
        while start < order.len() {
            let mut end = start + 1;
            while end < order.len() && values[order[end]] == values[order[start]] {
                end += 1;
            }
            // positions start..end hold ranks start+1..=end
            let average = (start + end + 1) as f64 / 2.0;
            for &idx in &order[start..end] {
                ranks[idx] = average;
            }
            start = end;
        }
        ranks
    }

    /// Pearson correlation; 0 when either side has no variance
    pub fn pearson(x: &[f64], y: &[f64]) -> Result<f64> {
        if x.len() != y.len() {
            bail!("Length mismatch: {} vs {}", x.len(), y.len());
        }
        let n = x.len();
        if n < 2 {
            return Ok(0.0);
        }

        let mean_x = x.iter().sum::<f64>() / n as f64;
        let mean_y = y.iter().sum::<f64>() / n as f64;

        let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
        for (&a, &b) in x.iter().zip(y) {
            let (dx, dy) = (a - mean_x, b - mean_y);
            cov += dx * dy;
            var_x += dx * dx;
            var_y += dy * dy;
        }

        if var_x == 0.0 || var_y == 0.0 {
            return Ok(0.0);
        }
        Ok((cov / (var_x.sqrt() * var_y.sqrt())).clamp(-1.0, 1.0))
    }

    /// Spearman rank correlation between predictions and labels
    pub fn spearman_corr(predictions: &[f32], labels: &[f32]) -> Result<f64> {
        if predictions.len() != labels.len() {
            bail!(
                "Got {} predictions for {} labels",
                predictions.len(),
                labels.len()
            );
        }
        pearson(&rank(predictions), &rank(labels))
    }
}
