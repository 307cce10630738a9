pub mod loader;
pub mod ontology;

use anyhow::{bail, Result};
use burn::prelude::*;
use std::ops::Range;

pub use ontology::{ActiveEdges, GraphSize, Ontology};

/// Labelled (cell line, drug) pairs.
///
/// Rows hold ids into the cell and drug feature tables rather than raw
/// features; the features are looked up per batch.
#[derive(Debug, Clone, Default)]
pub struct PairSet {
    /// (cell id, drug id) per sample
    pub pairs: Vec<(usize, usize)>,
    /// Observed response per sample
    pub labels: Vec<f32>,
}

impl PairSet {
    /// Create a pair set, checking that every pair has a label
    pub fn new(pairs: Vec<(usize, usize)>, labels: Vec<f32>) -> Result<Self> {
        if pairs.len() != labels.len() {
            bail!(
                "Pair count ({}) does not match label count ({})",
                pairs.len(),
                labels.len()
            );
        }
        Ok(Self { pairs, labels })
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Consecutive batch ranges in dataset order
    pub fn batches(&self, batch_size: usize) -> Vec<Range<usize>> {
        let batch_size = batch_size.max(1);
        (0..self.len())
            .step_by(batch_size)
            .map(|start| start..(start + batch_size).min(self.len()))
            .collect()
    }

    /// Cell ids for a batch
    pub fn cell_ids(&self, range: Range<usize>) -> Vec<usize> {
        self.pairs[range].iter().map(|&(cell, _)| cell).collect()
    }

    /// Drug ids for a batch
    pub fn drug_ids(&self, range: Range<usize>) -> Vec<usize> {
        self.pairs[range].iter().map(|&(_, drug)| drug).collect()
    }

    /// Labels as a `[n, 1]` tensor on the given device
    pub fn label_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        let data = TensorData::new(self.labels.clone(), [self.len(), 1]);
        Tensor::from_data(data.convert::<B::FloatElem>(), device)
    }
}

/// Train and test splits
#[derive(Debug, Clone, Default)]
pub struct TrainingData {
    pub train: PairSet,
    pub test: PairSet,
}

/// Dense row-major feature matrix (one row per cell line or drug)
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    pub rows: usize,
    pub cols: usize,
    pub values: Vec<f32>,
}

impl FeatureTable {
    /// Build a table from equally sized rows
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        if let Some((idx, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != cols) {
            bail!("Row {} has {} columns, expected {}", idx, row.len(), cols);
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            values: rows.into_iter().flatten().collect(),
        })
    }

    /// Keep only the given columns, in the given order
    pub fn select_columns(&self, columns: &[usize]) -> Result<Self> {
        if let Some(&col) = columns.iter().find(|&&c| c >= self.cols) {
            bail!("Column {} out of range for table with {} columns", col, self.cols);
        }
        let values = (0..self.rows)
            .flat_map(|row| columns.iter().map(move |&col| self.values[row * self.cols + col]))
            .collect();
        Ok(Self {
            rows: self.rows,
            cols: columns.len(),
            values,
        })
    }

    /// Upload the table as a lookup tensor
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        let data = TensorData::new(self.values.clone(), [self.rows, self.cols]);
        Tensor::from_data(data.convert::<B::FloatElem>(), device)
    }
}

/// Gather one feature row per id into a batch-aligned dense tensor.
///
/// Ids outside the table are an error.
pub fn build_input_vector<B: Backend>(ids: &[usize], table: &Tensor<B, 2>) -> Result<Tensor<B, 2>> {
    let [rows, _] = table.dims();
    if let Some(&id) = ids.iter().find(|&&id| id >= rows) {
        bail!("Feature id {} out of range for table with {} rows", id, rows);
    }
    let indices: Vec<i64> = ids.iter().map(|&id| id as i64).collect();
    let indices = Tensor::<B, 1, Int>::from_data(
        TensorData::new(indices, [ids.len()]).convert::<B::IntElem>(),
        &table.device(),
    );
    Ok(table.clone().select(0, indices))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::tensor_to_vec;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn table() -> FeatureTable {
        FeatureTable::from_rows(vec![
            vec![0.0, 1.0, 2.0],
            vec![10.0, 11.0, 12.0],
            vec![20.0, 21.0, 22.0],
        ])
        .unwrap()
    }

    #[test]
    fn test_build_input_vector_copies_rows() {
        let device = <TestBackend as Backend>::Device::default();
        let lookup = table().to_tensor::<TestBackend>(&device);

        let batch = build_input_vector(&[2, 0, 2], &lookup).unwrap();
        assert_eq!(batch.dims(), [3, 3]);
        assert_eq!(
            tensor_to_vec(batch).unwrap(),
            vec![20.0, 21.0, 22.0, 0.0, 1.0, 2.0, 20.0, 21.0, 22.0]
        );
    }

    #[test]
    fn test_build_input_vector_rejects_out_of_range() {
        let device = <TestBackend as Backend>::Device::default();
        let lookup = table().to_tensor::<TestBackend>(&device);
        assert!(build_input_vector(&[0, 3], &lookup).is_err());
    }

    #[test]
    fn test_ragged_rows_rejected() {
        assert!(FeatureTable::from_rows(vec![vec![1.0, 2.0], vec![3.0]]).is_err());
    }

    #[test]
    fn test_select_columns() {
        let selected = table().select_columns(&[2, 0]).unwrap();
        assert_eq!(selected.cols, 2);
        assert_eq!(selected.values, vec![2.0, 0.0, 12.0, 10.0, 22.0, 20.0]);
        assert!(table().select_columns(&[5]).is_err());
    }

    #[test]
    fn test_batches_preserve_order() {
        let set = PairSet::new(vec![(0, 0); 7], vec![0.0; 7]).unwrap();
        assert_eq!(set.batches(3), vec![0..3, 3..6, 6..7]);
        assert!(PairSet::new(vec![(0, 0)], vec![]).is_err());
    }
}
