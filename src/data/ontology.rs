//! Ontology topology used as the wiring of the term network.
//!
//! The graph itself never changes after loading. Pruning works on an
//! [`ActiveEdges`] set instead, so node and edge indices stay valid for the
//! lifetime of the model built from them.

use anyhow::{bail, Context, Result};
use petgraph::algo::{connected_components, toposort};
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::{Dfs, EdgeRef};
use petgraph::Direction;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::debug;

/// Liveness flag per ontology edge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveEdges {
    live: Vec<bool>,
}

impl ActiveEdges {
    /// All `edge_count` edges live
    pub fn all(edge_count: usize) -> Self {
        Self {
            live: vec![true; edge_count],
        }
    }

    pub fn is_live(&self, edge: EdgeIndex) -> bool {
        self.live.get(edge.index()).copied().unwrap_or(false)
    }

    /// Mark an edge removed. Returns whether it was live before.
    pub fn remove(&mut self, edge: EdgeIndex) -> bool {
        match self.live.get_mut(edge.index()) {
            Some(flag) => std::mem::replace(flag, false),
            None => false,
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.iter().filter(|&&live| live).count()
    }
}

/// Node and edge count of a (sub)graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphSize {
    pub nodes: usize,
    pub edges: usize,
}

/// Term hierarchy with parent -> child edges and a single root
#[derive(Debug, Clone)]
pub struct Ontology {
    graph: DiGraph<String, ()>,
    root: NodeIndex,
    term_index: HashMap<String, NodeIndex>,
    term_size_map: BTreeMap<String, usize>,
    term_direct_gene_map: BTreeMap<String, BTreeSet<usize>>,
}

impl Ontology {
    /// Build an ontology from term edges and direct gene annotations.
    ///
    /// Fails when the hierarchy has a cycle, more than one root, more than
    /// one connected component, or a term with no genes in its subtree.
    pub fn from_edges(
        term_edges: &[(String, String)],
        term_direct_gene_map: BTreeMap<String, BTreeSet<usize>>,
    ) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut term_index = HashMap::new();

        let mut node_for = |graph: &mut DiGraph<String, ()>, name: &str| -> NodeIndex {
            *term_index
                .entry(name.to_string())
                .or_insert_with(|| graph.add_node(name.to_string()))
        };

        for (parent, child) in term_edges {
            let p = node_for(&mut graph, parent);
            let c = node_for(&mut graph, child);
            if graph.find_edge(p, c).is_none() {
                graph.add_edge(p, c, ());
            }
        }
        for term in term_direct_gene_map.keys() {
            node_for(&mut graph, term);
        }

        if graph.node_count() == 0 {
            bail!("Ontology has no terms");
        }
        if let Err(cycle) = toposort(&graph, None) {
            bail!("Ontology has a cycle through term {}", graph[cycle.node_id()]);
        }

        let roots: Vec<NodeIndex> = graph
            .node_indices()
            .filter(|&n| graph.neighbors_directed(n, Direction::Incoming).next().is_none())
            .collect();
        if roots.len() != 1 {
            bail!(
                "There are {} roots of the ontology; use exactly one root",
                roots.len()
            );
        }
        let components = connected_components(&graph);
        if components > 1 {
            bail!(
                "Ontology has {} connected components; connect them under one root",
                components
            );
        }

        let mut term_size_map = BTreeMap::new();
        for node in graph.node_indices() {
            let mut genes = BTreeSet::new();
            let mut dfs = Dfs::new(&graph, node);
            while let Some(descendant) = dfs.next(&graph) {
                if let Some(direct) = term_direct_gene_map.get(&graph[descendant]) {
                    genes.extend(direct.iter().copied());
                }
            }
            if genes.is_empty() {
                bail!("Term {} has no genes; delete it from the ontology", graph[node]);
            }
            term_size_map.insert(graph[node].clone(), genes.len());
        }

        debug!(
            "Built ontology with {} terms and {} edges",
            graph.node_count(),
            graph.edge_count()
        );

        Ok(Self {
            root: roots[0],
            graph,
            term_index,
            term_size_map,
            term_direct_gene_map,
        })
    }

    pub fn root(&self) -> &str {
        &self.graph[self.root]
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, term: &str) -> bool {
        self.term_index.contains_key(term)
    }

    pub fn term_size_map(&self) -> &BTreeMap<String, usize> {
        &self.term_size_map
    }

    pub fn term_direct_gene_map(&self) -> &BTreeMap<String, BTreeSet<usize>> {
        &self.term_direct_gene_map
    }

    /// Genes annotated straight to `term` (empty if none)
    pub fn direct_genes(&self, term: &str) -> Vec<usize> {
        self.term_direct_gene_map
            .get(term)
            .map(|genes| genes.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Children of `term` in edge insertion order
    pub fn children(&self, term: &str) -> Result<Vec<String>> {
        let node = self.node(term)?;
        let mut edges: Vec<_> = self.graph.edges_directed(node, Direction::Outgoing).collect();
        edges.sort_by_key(|e| e.id());
        Ok(edges.iter().map(|e| self.graph[e.target()].clone()).collect())
    }

    /// Edge id of `parent -> child`
    pub fn edge_between(&self, parent: &str, child: &str) -> Result<EdgeIndex> {
        let (p, c) = (self.node(parent)?, self.node(child)?);
        self.graph
            .find_edge(p, c)
            .with_context(|| format!("No ontology edge {} -> {}", parent, child))
    }

    /// Fresh liveness set with every edge live
    pub fn active_edges(&self) -> ActiveEdges {
        ActiveEdges::all(self.graph.edge_count())
    }

    /// Terms grouped leaves-first: each group only depends on earlier groups.
    pub fn layers(&self) -> Vec<Vec<String>> {
        let mut pending: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| (n, self.graph.neighbors_directed(n, Direction::Outgoing).count()))
            .collect();
        let mut layers = Vec::new();

        while !pending.is_empty() {
            let mut leaves: Vec<NodeIndex> = pending
                .iter()
                .filter(|&(_, &remaining)| remaining == 0)
                .map(|(&n, _)| n)
                .collect();
            leaves.sort();
            for leaf in &leaves {
                pending.remove(leaf);
                for parent in self.graph.neighbors_directed(*leaf, Direction::Incoming) {
                    if let Some(remaining) = pending.get_mut(&parent) {
                        *remaining -= 1;
                    }
                }
            }
            layers.push(leaves.iter().map(|&n| self.graph[n].clone()).collect());
        }
        layers
    }

    /// Size of the subgraph reachable from the root over live edges, with
    /// edge direction ignored.
    pub fn reachable_from_root(&self, active: &ActiveEdges) -> GraphSize {
        let mut seen = vec![false; self.graph.node_count()];
        let mut queue = VecDeque::from([self.root]);
        seen[self.root.index()] = true;

        while let Some(node) = queue.pop_front() {
            let incident = self
                .graph
                .edges_directed(node, Direction::Outgoing)
                .map(|e| (e.id(), e.target()))
                .chain(
                    self.graph
                        .edges_directed(node, Direction::Incoming)
                        .map(|e| (e.id(), e.source())),
                );
            for (edge, next) in incident {
                if active.is_live(edge) && !seen[next.index()] {
                    seen[next.index()] = true;
                    queue.push_back(next);
                }
            }
        }

        let edges = self
            .graph
            .edge_references()
            .filter(|e| {
                active.is_live(e.id()) && seen[e.source().index()] && seen[e.target().index()]
            })
            .count();
        GraphSize {
            nodes: seen.iter().filter(|&&s| s).count(),
            edges,
        }
    }

    fn node(&self, term: &str) -> Result<NodeIndex> {
        self.term_index
            .get(term)
            .copied()
            .with_context(|| format!("Unknown ontology term: {}", term))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn genes(pairs: &[(&str, &[usize])]) -> BTreeMap<String, BTreeSet<usize>> {
        pairs
            .iter()
            .map(|(term, ids)| (term.to_string(), ids.iter().copied().collect()))
            .collect()
    }

    fn edges(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect()
    }

    fn three_level() -> Ontology {
        Ontology::from_edges(
            &edges(&[("R", "A"), ("R", "B"), ("A", "C")]),
            genes(&[("R", &[0]), ("A", &[1]), ("B", &[2, 3]), ("C", &[4])]),
        )
        .unwrap()
    }

    #[test]
    fn test_root_and_sizes() {
        let onto = three_level();
        assert_eq!(onto.root(), "R");
        assert_eq!(onto.term_size_map()["R"], 5);
        assert_eq!(onto.term_size_map()["A"], 2);
        assert_eq!(onto.term_size_map()["C"], 1);
        assert_eq!(onto.children("R").unwrap(), vec!["A", "B"]);
    }

    #[test]
    fn test_layers_are_leaves_first() {
        let layers = three_level().layers();
        assert_eq!(layers.len(), 3);
        assert!(layers[0].contains(&"B".to_string()));
        assert!(layers[0].contains(&"C".to_string()));
        assert_eq!(layers[1], vec!["A"]);
        assert_eq!(layers[2], vec!["R"]);
    }

    #[test]
    fn test_multiple_roots_rejected() {
        let result = Ontology::from_edges(
            &edges(&[("R", "A"), ("S", "A")]),
            genes(&[("A", &[0])]),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_term_rejected() {
        let result = Ontology::from_edges(&edges(&[("R", "A")]), genes(&[("R", &[0])]));
        assert!(result.is_err());
    }

    #[test]
    fn test_reachability_after_removal() {
        let onto = three_level();
        let mut active = onto.active_edges();
        assert_eq!(onto.reachable_from_root(&active), GraphSize { nodes: 4, edges: 3 });

        let edge = onto.edge_between("R", "A").unwrap();
        assert!(active.remove(edge));
        assert!(!active.remove(edge));

        // A and its child C are cut off from the root.
        assert_eq!(onto.reachable_from_root(&active), GraphSize { nodes: 2, edges: 1 });
        assert_eq!(active.live_count(), 2);
    }
}
