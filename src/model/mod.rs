pub mod architecture;
pub mod checkpoint;
pub mod loss;
pub mod mask;

use burn::prelude::*;

/// Model configuration
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// Width of the cell-line mutation vector (number of genes)
    pub gene_dim: usize,

    /// Width of the drug fingerprint vector
    pub drug_dim: usize,

    /// Hidden units of each drug-branch layer, bottom first
    pub num_hiddens_drug: Vec<usize>,

    /// Hidden units assigned to every ontology term
    #[config(default = "3")]
    pub num_hiddens_genotype: usize,

    /// Hidden units of the layer combining genotype and drug branches
    #[config(default = "3")]
    pub num_hiddens_final: usize,

    /// Seed for weight initialisation
    #[config(default = "2026")]
    pub seed: u64,
}

impl ModelConfig {
    /// Configuration with the default branch sizes (`100,50,3` drug layers)
    pub fn drugcell_default(gene_dim: usize, drug_dim: usize) -> Self {
        Self::new(gene_dim, drug_dim, vec![100, 50, 3])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ModelConfig::drugcell_default(10, 4);
        assert_eq!(config.num_hiddens_genotype, 3);
        assert_eq!(config.num_hiddens_final, 3);
        assert_eq!(config.num_hiddens_drug, vec![100, 50, 3]);
    }
}
