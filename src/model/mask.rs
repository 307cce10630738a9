//! Binary gene masks for the direct gene layers.

use anyhow::{bail, Result};
use burn::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Binary selector of the genes annotated straight to one term.
///
/// Shape `[|direct genes|, gene_dim]`; row `i` holds a single 1 at the global
/// index of the term's `i`-th direct gene. Multiplying a direct-gene weight
/// (or its gradient) by the mask keeps exactly one input per output unit.
#[derive(Debug, Clone)]
pub struct TermMask<B: Backend> {
    genes: Vec<usize>,
    tensor: Tensor<B, 2>,
}

impl<B: Backend> TermMask<B> {
    /// Genes selected by each row, in row order
    pub fn genes(&self) -> &[usize] {
        &self.genes
    }

    pub fn rows(&self) -> usize {
        self.genes.len()
    }

    pub fn tensor(&self) -> &Tensor<B, 2> {
        &self.tensor
    }
}

/// Mask per term, keyed by term name
pub type TermMaskMap<B> = BTreeMap<String, TermMask<B>>;

/// Build one mask per entry of the term -> direct gene map.
///
/// A term with no direct genes gets a mask with zero rows. A gene index
/// outside `gene_dim` is an error.
pub fn create_term_mask<B: Backend>(
    term_direct_gene_map: &BTreeMap<String, BTreeSet<usize>>,
    gene_dim: usize,
    device: &B::Device,
) -> Result<TermMaskMap<B>> {
    let mut term_mask_map = BTreeMap::new();

    for (term, gene_set) in term_direct_gene_map {
        let genes: Vec<usize> = gene_set.iter().copied().collect();
        let mut values = vec![0.0f32; genes.len() * gene_dim];

        for (row, &gene_id) in genes.iter().enumerate() {
            if gene_id >= gene_dim {
                bail!(
                    "Gene index {} of term {} is out of range for gene_dim {}",
                    gene_id,
                    term,
                    gene_dim
                );
            }
            values[row * gene_dim + gene_id] = 1.0;
        }

        let data = TensorData::new(values, [genes.len(), gene_dim]);
        let tensor = Tensor::from_data(data.convert::<B::FloatElem>(), device);
        term_mask_map.insert(term.clone(), TermMask { genes, tensor });
    }

    debug!("Built {} term masks over {} genes", term_mask_map.len(), gene_dim);
    Ok(term_mask_map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::tensor_to_vec;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn gene_map(entries: &[(&str, &[usize])]) -> BTreeMap<String, BTreeSet<usize>> {
        entries
            .iter()
            .map(|(term, genes)| (term.to_string(), genes.iter().copied().collect()))
            .collect()
    }

    /// Column of the single 1 in each row
    fn support_columns(mask: &TermMask<TestBackend>, gene_dim: usize) -> Vec<usize> {
        let values = tensor_to_vec(mask.tensor().clone()).unwrap();
        values
            .chunks(gene_dim)
            .map(|row| {
                assert_eq!(row.iter().filter(|&&v| v == 1.0).count(), 1);
                assert!(row.iter().all(|&v| v == 0.0 || v == 1.0));
                row.iter().position(|&v| v == 1.0).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_two_term_masks() {
        let device = <TestBackend as Backend>::Device::default();
        let masks =
            create_term_mask::<TestBackend>(&gene_map(&[("A", &[0, 1]), ("B", &[2])]), 3, &device)
                .unwrap();

        assert_eq!(
            tensor_to_vec(masks["A"].tensor().clone()).unwrap(),
            vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0]
        );
        assert_eq!(masks["A"].tensor().dims(), [2, 3]);
        assert_eq!(
            tensor_to_vec(masks["B"].tensor().clone()).unwrap(),
            vec![0.0, 0.0, 1.0]
        );
    }

    #[test]
    fn test_support_recovers_gene_set() {
        let device = <TestBackend as Backend>::Device::default();
        let map = gene_map(&[("T1", &[4, 0, 7]), ("T2", &[1]), ("T3", &[2, 3, 5, 6])]);
        let masks = create_term_mask::<TestBackend>(&map, 8, &device).unwrap();

        for (term, genes) in &map {
            let recovered: BTreeSet<usize> = support_columns(&masks[term], 8).into_iter().collect();
            assert_eq!(&recovered, genes);
            assert_eq!(masks[term].genes().len(), genes.len());
        }
    }

    #[test]
    fn test_empty_gene_set_has_zero_rows() {
        let device = <TestBackend as Backend>::Device::default();
        let masks = create_term_mask::<TestBackend>(&gene_map(&[("E", &[])]), 5, &device).unwrap();
        assert_eq!(masks["E"].rows(), 0);
        assert_eq!(masks["E"].tensor().dims(), [0, 5]);
    }

    #[test]
    fn test_out_of_range_gene_is_error() {
        let device = <TestBackend as Backend>::Device::default();
        let result = create_term_mask::<TestBackend>(&gene_map(&[("A", &[0, 3])]), 3, &device);
        assert!(result.is_err());
    }
}
