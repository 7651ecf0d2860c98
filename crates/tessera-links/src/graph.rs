//! Directed link graph built on `petgraph`.

use std::collections::{BTreeSet, HashMap};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use tessera_core::model::{CrossFeatureLink, FeatureRef, LinkType};
use tessera_core::types::LinkId;

/// Edge payload: the link a graph edge came from.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkEdge {
    pub link_id: LinkId,
    pub link_type: LinkType,
    pub strength: f64,
}

impl LinkEdge {
    pub fn from_link(link: &CrossFeatureLink) -> Self {
        Self {
            link_id: link.id.clone(),
            link_type: link.link_type,
            strength: link.strength,
        }
    }
}

/// Links as a directed graph keyed by `(feature, entity_id)` vertices.
///
/// Vertices are inserted in sorted order so index order, and therefore every
/// traversal over the graph, is deterministic.
#[derive(Debug, Default)]
pub struct LinkGraph {
    graph: DiGraph<FeatureRef, LinkEdge>,
    index_map: HashMap<FeatureRef, NodeIndex>,
}

impl LinkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_links(links: &[CrossFeatureLink]) -> Self {
        let vertices: BTreeSet<&FeatureRef> = links
            .iter()
            .flat_map(|l| [&l.source, &l.target])
            .collect();

        let mut graph = Self::new();
        for vertex in vertices {
            graph.vertex(vertex.clone());
        }
        for link in links {
            graph.add_edge(link.source.clone(), link.target.clone(), LinkEdge::from_link(link));
        }
        graph
    }

    fn vertex(&mut self, entity: FeatureRef) -> NodeIndex {
        if let Some(idx) = self.index_map.get(&entity) {
            return *idx;
        }
        let idx = self.graph.add_node(entity.clone());
        self.index_map.insert(entity, idx);
        idx
    }

    /// Add one directed edge, creating vertices as needed.
    pub fn add_edge(&mut self, source: FeatureRef, target: FeatureRef, edge: LinkEdge) {
        let from = self.vertex(source);
        let to = self.vertex(target);
        self.graph.add_edge(from, to, edge);
    }

    pub fn vertex_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.edge_count() == 0
    }

    /// Returns `true` if the graph contains at least one cycle.
    pub fn has_cycle(&self) -> bool {
        petgraph::algo::is_cyclic_directed(&self.graph)
    }

    pub fn contains(&self, entity: &FeatureRef) -> bool {
        self.index_map.contains_key(entity)
    }

    /// Entities `entity` links to, with the edge that reaches each.
    pub fn outgoing(&self, entity: &FeatureRef) -> Vec<(&FeatureRef, &LinkEdge)> {
        let Some(&idx) = self.index_map.get(entity) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|e| (&self.graph[e.target()], e.weight()))
            .collect()
    }

    pub(crate) fn inner(&self) -> &DiGraph<FeatureRef, LinkEdge> {
        &self.graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(id: &str, from: &str, to: &str) -> CrossFeatureLink {
        CrossFeatureLink::with_id(
            id,
            FeatureRef::model(from),
            FeatureRef::model(to),
            LinkType::References,
            0.5,
        )
        .unwrap()
    }

    #[test]
    fn test_empty_graph() {
        let graph = LinkGraph::from_links(&[]);
        assert!(graph.is_empty());
        assert_eq!(graph.vertex_count(), 0);
        assert!(!graph.has_cycle());
    }

    #[test]
    fn test_build_and_neighbors() {
        let graph = LinkGraph::from_links(&[link("l1", "a", "b"), link("l2", "a", "c")]);
        assert_eq!(graph.vertex_count(), 3);
        assert_eq!(graph.edge_count(), 2);
        let out = graph.outgoing(&FeatureRef::model("a"));
        assert_eq!(out.len(), 2);
        assert!(graph.outgoing(&FeatureRef::model("zzz")).is_empty());
        assert!(!graph.has_cycle());
    }

    #[test]
    fn test_cycle_flag() {
        let graph = LinkGraph::from_links(&[link("l1", "a", "b"), link("l2", "b", "a")]);
        assert!(graph.has_cycle());
    }
}
