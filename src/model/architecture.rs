//! Ontology-wired network: one small block per term, a fully connected drug
//! branch, and a final layer combining the root term with the drug embedding.

use crate::data::Ontology;
use crate::model::ModelConfig;
use crate::utils::random::seeded_rng;
use anyhow::{bail, Result};
use burn::module::{Param, ParamId};
use burn::prelude::*;
use burn::tensor::activation::tanh;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Key of the root-level prediction in [`AuxOutputs::iter`]
pub const FINAL_KEY: &str = "final";

/// Regularisation group of a trainable tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamGroup {
    /// Gene -> term weights of a direct gene layer
    DirectGeneEdge,
    /// Weights of a term layer (child blocks followed by the direct block)
    InterTermEdge,
    /// Everything else, including every bias
    Other,
}

/// Where a dense layer sits in the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRole {
    DirectGene { term: usize },
    TermLinear { term: usize },
    Other,
}

impl SlotRole {
    /// Group of the slot's weight matrix; biases are always [`ParamGroup::Other`]
    pub fn weight_group(&self) -> ParamGroup {
        match self {
            SlotRole::DirectGene { .. } => ParamGroup::DirectGeneEdge,
            SlotRole::TermLinear { .. } => ParamGroup::InterTermEdge,
            SlotRole::Other => ParamGroup::Other,
        }
    }
}

/// Fully connected layer with weight laid out `[d_output, d_input]`
#[derive(Module, Debug)]
pub struct Dense<B: Backend> {
    pub weight: Param<Tensor<B, 2>>,
    pub bias: Param<Tensor<B, 1>>,
}

impl<B: Backend> Dense<B> {
    /// Uniform(-1/sqrt(d_input), 1/sqrt(d_input)) initialisation
    fn new(d_input: usize, d_output: usize, rng: &mut ChaCha8Rng, device: &B::Device) -> Self {
        let bound = 1.0 / (d_input.max(1) as f32).sqrt();
        let mut sample = |n: usize| -> Vec<f32> {
            (0..n).map(|_| rng.gen_range(-bound..bound)).collect()
        };

        let weight = TensorData::new(sample(d_output * d_input), [d_output, d_input]);
        let bias = TensorData::new(sample(d_output), [d_output]);

        Self {
            weight: Param::from_tensor(Tensor::from_data(weight.convert::<B::FloatElem>(), device)),
            bias: Param::from_tensor(Tensor::from_data(bias.convert::<B::FloatElem>(), device)),
        }
    }

    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        input.matmul(self.weight.val().transpose()) + self.bias.val().unsqueeze::<2>()
    }

    /// Replace the values of both parameters, keeping their ids so optimizer
    /// state stays attached.
    pub fn with_values(self, weight: Tensor<B, 2>, bias: Tensor<B, 1>) -> Self {
        Self {
            weight: Param::initialized(self.weight.id, weight.detach().require_grad()),
            bias: Param::initialized(self.bias.id, bias.detach().require_grad()),
        }
    }

    pub fn d_input(&self) -> usize {
        self.weight.val().dims()[1]
    }

    pub fn d_output(&self) -> usize {
        self.weight.val().dims()[0]
    }
}

/// Layers owned by one ontology term
#[derive(Module, Debug)]
pub struct TermBlock<B: Backend> {
    /// gene_dim -> |direct genes|; absent when the term has no direct genes
    pub direct: Option<Dense<B>>,
    /// [children hidden..., direct genes] -> num_hiddens_genotype
    pub linear: Dense<B>,
    pub aux_hidden: Dense<B>,
    pub aux_out: Dense<B>,
}

/// One drug-branch layer with its auxiliary head
#[derive(Module, Debug)]
pub struct DrugBlock<B: Backend> {
    pub linear: Dense<B>,
    pub aux_hidden: Dense<B>,
    pub aux_out: Dense<B>,
}

/// DrugCell network parameters. Term blocks are stored in [`TermLayout`] order.
#[derive(Module, Debug)]
pub struct DrugCellNet<B: Backend> {
    pub terms: Vec<TermBlock<B>>,
    pub drug: Vec<DrugBlock<B>>,
    pub final_linear: Dense<B>,
    pub final_aux_hidden: Dense<B>,
    pub final_aux_out: Dense<B>,
}

/// Static description of one term block
#[derive(Debug, Clone)]
pub struct TermSpec {
    pub name: String,
    /// Indices of child terms in [`TermLayout::terms`], in stored adjacency order
    pub children: Vec<usize>,
    pub direct_genes: Vec<usize>,
}

impl TermSpec {
    pub fn input_width(&self, num_hiddens_genotype: usize) -> usize {
        self.children.len() * num_hiddens_genotype + self.direct_genes.len()
    }
}

/// Evaluation order and wiring of the term blocks.
///
/// Terms are ordered leaves-first so every child precedes its parents; the
/// root is last.
#[derive(Debug, Clone)]
pub struct TermLayout {
    pub terms: Vec<TermSpec>,
    pub root: usize,
    pub num_hiddens_genotype: usize,
    index: HashMap<String, usize>,
}

impl TermLayout {
    pub fn from_ontology(ontology: &Ontology, num_hiddens_genotype: usize) -> Result<Self> {
        if num_hiddens_genotype == 0 {
            bail!("num_hiddens_genotype must be positive");
        }

        let order: Vec<String> = ontology.layers().into_iter().flatten().collect();
        let index: HashMap<String, usize> = order
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect();

        let mut terms = Vec::with_capacity(order.len());
        for (idx, name) in order.iter().enumerate() {
            let mut children = Vec::new();
            for child in ontology.children(name)? {
                match index.get(&child) {
                    Some(&c) if c < idx => children.push(c),
                    _ => bail!("Child {} of {} is not evaluated before its parent", child, name),
                }
            }
            terms.push(TermSpec {
                name: name.clone(),
                children,
                direct_genes: ontology.direct_genes(name),
            });
        }

        let root = match index.get(ontology.root()) {
            Some(&root) => root,
            None => bail!("Root {} missing from layout", ontology.root()),
        };
        debug!("Term layout: {} terms, root {}", terms.len(), ontology.root());

        Ok(Self {
            terms,
            root,
            num_hiddens_genotype,
            index,
        })
    }

    pub fn index_of(&self, term: &str) -> Option<usize> {
        self.index.get(term).copied()
    }

    pub fn root_name(&self) -> &str {
        &self.terms[self.root].name
    }
}

/// Per-term, per-drug-layer and final predictions of one forward pass
#[derive(Debug, Clone)]
pub struct AuxOutputs<B: Backend> {
    /// Root-level prediction `[batch, 1]`
    pub final_output: Tensor<B, 2>,
    /// Intermediate predictions keyed by term name or `drug_<layer>`
    pub auxiliary: BTreeMap<String, Tensor<B, 2>>,
}

impl<B: Backend> AuxOutputs<B> {
    /// All outputs, `"final"` first
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor<B, 2>)> {
        std::iter::once((FINAL_KEY, &self.final_output))
            .chain(self.auxiliary.iter().map(|(k, v)| (k.as_str(), v)))
    }

    pub fn len(&self) -> usize {
        self.auxiliary.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl<B: Backend> DrugCellNet<B> {
    /// Map `(cell features, drug features)` to the auxiliary output map
    pub fn forward(&self, layout: &TermLayout, cell: Tensor<B, 2>, drug: Tensor<B, 2>) -> AuxOutputs<B> {
        let mut auxiliary = BTreeMap::new();
        let mut hidden: Vec<Tensor<B, 2>> = Vec::with_capacity(self.terms.len());

        for (spec, block) in layout.terms.iter().zip(&self.terms) {
            let mut inputs: Vec<Tensor<B, 2>> =
                spec.children.iter().map(|&child| hidden[child].clone()).collect();
            if let Some(direct) = &block.direct {
                inputs.push(direct.forward(cell.clone()));
            }

            let out = tanh(block.linear.forward(Tensor::cat(inputs, 1)));
            let aux = block.aux_out.forward(tanh(block.aux_hidden.forward(out.clone())));
            auxiliary.insert(spec.name.clone(), aux);
            hidden.push(out);
        }

        let mut drug_out = drug;
        for (i, block) in self.drug.iter().enumerate() {
            drug_out = tanh(block.linear.forward(drug_out));
            let aux = block.aux_out.forward(tanh(block.aux_hidden.forward(drug_out.clone())));
            auxiliary.insert(format!("drug_{}", i + 1), aux);
        }

        let final_input = Tensor::cat(vec![hidden[layout.root].clone(), drug_out], 1);
        let out = tanh(self.final_linear.forward(final_input));
        let final_output = self.final_aux_out.forward(tanh(self.final_aux_hidden.forward(out)));

        AuxOutputs {
            final_output,
            auxiliary,
        }
    }

    /// Every dense layer with its role
    pub fn slots(&self) -> Vec<(SlotRole, &Dense<B>)> {
        let mut slots = Vec::new();
        for (term, block) in self.terms.iter().enumerate() {
            if let Some(direct) = &block.direct {
                slots.push((SlotRole::DirectGene { term }, direct));
            }
            slots.push((SlotRole::TermLinear { term }, &block.linear));
            slots.push((SlotRole::Other, &block.aux_hidden));
            slots.push((SlotRole::Other, &block.aux_out));
        }
        for block in &self.drug {
            slots.push((SlotRole::Other, &block.linear));
            slots.push((SlotRole::Other, &block.aux_hidden));
            slots.push((SlotRole::Other, &block.aux_out));
        }
        slots.push((SlotRole::Other, &self.final_linear));
        slots.push((SlotRole::Other, &self.final_aux_hidden));
        slots.push((SlotRole::Other, &self.final_aux_out));
        slots
    }

    /// Direct gene layers with the index of their term
    pub fn direct_layers(&self) -> impl Iterator<Item = (usize, &Dense<B>)> {
        self.terms
            .iter()
            .enumerate()
            .filter_map(|(term, block)| block.direct.as_ref().map(|d| (term, d)))
    }

    /// Group tag of every trainable tensor
    pub fn param_groups(&self) -> Vec<(ParamId, ParamGroup)> {
        self.slots()
            .into_iter()
            .flat_map(|(role, dense)| {
                [
                    (dense.weight.id, role.weight_group()),
                    (dense.bias.id, ParamGroup::Other),
                ]
            })
            .collect()
    }

    /// Rebuild the network by passing every dense layer through `f`
    pub fn map_slots<F>(self, f: &mut F) -> Result<Self>
    where
        F: FnMut(SlotRole, Dense<B>) -> Result<Dense<B>>,
    {
        let terms = self
            .terms
            .into_iter()
            .enumerate()
            .map(|(term, block)| {
                Ok(TermBlock {
                    direct: block
                        .direct
                        .map(|d| f(SlotRole::DirectGene { term }, d))
                        .transpose()?,
                    linear: f(SlotRole::TermLinear { term }, block.linear)?,
                    aux_hidden: f(SlotRole::Other, block.aux_hidden)?,
                    aux_out: f(SlotRole::Other, block.aux_out)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let drug = self
            .drug
            .into_iter()
            .map(|block| {
                Ok(DrugBlock {
                    linear: f(SlotRole::Other, block.linear)?,
                    aux_hidden: f(SlotRole::Other, block.aux_hidden)?,
                    aux_out: f(SlotRole::Other, block.aux_out)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            terms,
            drug,
            final_linear: f(SlotRole::Other, self.final_linear)?,
            final_aux_hidden: f(SlotRole::Other, self.final_aux_hidden)?,
            final_aux_out: f(SlotRole::Other, self.final_aux_out)?,
        })
    }
}

/// Initialize the network for a layout
pub fn init_model<B: Backend>(
    config: &ModelConfig,
    layout: &TermLayout,
    device: &B::Device,
) -> Result<DrugCellNet<B>> {
    if config.num_hiddens_genotype != layout.num_hiddens_genotype {
        bail!(
            "Layout built for {} hidden units per term, config asks for {}",
            layout.num_hiddens_genotype,
            config.num_hiddens_genotype
        );
    }
    if config.num_hiddens_drug.is_empty() || config.num_hiddens_drug.contains(&0) {
        bail!("Drug branch needs at least one positive layer size");
    }
    if config.num_hiddens_final == 0 {
        bail!("num_hiddens_final must be positive");
    }

    let hg = config.num_hiddens_genotype;
    let mut rng = seeded_rng(config.seed);

    let mut terms = Vec::with_capacity(layout.terms.len());
    for spec in &layout.terms {
        if let Some(&gene) = spec.direct_genes.iter().find(|&&g| g >= config.gene_dim) {
            bail!("Gene {} of term {} exceeds gene_dim {}", gene, spec.name, config.gene_dim);
        }
        if spec.input_width(hg) == 0 {
            bail!("Term {} has neither children nor direct genes", spec.name);
        }
        let direct = (!spec.direct_genes.is_empty())
            .then(|| Dense::new(config.gene_dim, spec.direct_genes.len(), &mut rng, device));
        terms.push(TermBlock {
            direct,
            linear: Dense::new(spec.input_width(hg), hg, &mut rng, device),
            aux_hidden: Dense::new(hg, 1, &mut rng, device),
            aux_out: Dense::new(1, 1, &mut rng, device),
        });
    }

    let mut drug = Vec::with_capacity(config.num_hiddens_drug.len());
    let mut d_input = config.drug_dim;
    for &d_output in &config.num_hiddens_drug {
        drug.push(DrugBlock {
            linear: Dense::new(d_input, d_output, &mut rng, device),
            aux_hidden: Dense::new(d_output, 1, &mut rng, device),
            aux_out: Dense::new(1, 1, &mut rng, device),
        });
        d_input = d_output;
    }

    let final_width = hg + d_input;
    Ok(DrugCellNet {
        terms,
        drug,
        final_linear: Dense::new(final_width, config.num_hiddens_final, &mut rng, device),
        final_aux_hidden: Dense::new(config.num_hiddens_final, 1, &mut rng, device),
        final_aux_out: Dense::new(1, 1, &mut rng, device),
    })
}
