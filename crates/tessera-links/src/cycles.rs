use std::collections::BTreeMap;

use petgraph::graph::{EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::Serialize;

use tessera_core::model::{FeatureRef, FeatureType, LinkType};
use tessera_core::types::LinkId;

use crate::graph::LinkGraph;

/// Coupling above which a cycle is reported as strongly coupled.
const STRONG_COUPLING: f64 = 0.8;

/// Coarse class of a cycle, from the link types on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    /// Contains a `TRIGGERS` link: may loop at runtime.
    Triggering,
    /// Contains a `NESTED` link: recursive model nesting.
    Nesting,
    /// Implementation or data-flow dependency loop.
    Dependency,
    /// Only documentation/reference links.
    Informational,
}

impl CycleKind {
    fn classify(link_types: &[LinkType]) -> Self {
        if link_types.contains(&LinkType::Triggers) {
            Self::Triggering
        } else if link_types.contains(&LinkType::Nested) {
            Self::Nesting
        } else if link_types.iter().any(|t| {
            matches!(t, LinkType::Implements | LinkType::Consumes | LinkType::Produces)
        }) {
            Self::Dependency
        } else {
            Self::Informational
        }
    }
}

/// One simple cycle. `vertices[i]` links to `vertices[i + 1]` through
/// `links[i]`; the last vertex links back to the first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkCycle {
    pub vertices: Vec<FeatureRef>,
    pub links: Vec<LinkId>,
    pub link_types: Vec<LinkType>,
    pub strength_product: f64,
    pub kind: CycleKind,
}

impl LinkCycle {
    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// `a -> b -> a` rendering for warnings and logs.
    pub fn path(&self) -> String {
        let mut parts: Vec<String> = self.vertices.iter().map(|v| v.to_string()).collect();
        if let Some(first) = self.vertices.first() {
            parts.push(first.to_string());
        }
        parts.join(" -> ")
    }
}

/// Result of one cycle-detection pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    pub total_cycles: usize,
    pub cycles: Vec<LinkCycle>,
    pub average_cycle_length: f64,
    pub max_strength_product: f64,
    pub by_kind: BTreeMap<CycleKind, usize>,
    pub by_link_type: BTreeMap<LinkType, usize>,
    pub warnings: Vec<String>,
}

impl CycleReport {
    pub fn has_cycles(&self) -> bool {
        self.total_cycles > 0
    }

    /// Cycles that can loop or recurse at runtime.
    pub fn dangerous(&self) -> impl Iterator<Item = &LinkCycle> {
        self.cycles
            .iter()
            .filter(|c| matches!(c.kind, CycleKind::Triggering | CycleKind::Nesting))
    }
}

/// Depth-first simple-cycle enumeration with a recursion stack.
///
/// Each cycle is reported once, rooted at its lowest vertex index; only
/// cycles of at most `max_cycle_length` links are reported.
#[derive(Debug, Clone, Copy)]
pub struct CycleDetector {
    max_cycle_length: usize,
}

impl CycleDetector {
    pub fn new(max_cycle_length: usize) -> Self {
        Self { max_cycle_length }
    }

    pub fn detect(&self, graph: &LinkGraph) -> CycleReport {
        let g = graph.inner();
        let mut found: Vec<Vec<EdgeIndex>> = Vec::new();
        let mut on_stack = vec![false; g.node_count()];

        if self.max_cycle_length > 0 {
            for start in g.node_indices() {
                let mut path = Vec::new();
                on_stack[start.index()] = true;
                self.walk(graph, start, start, &mut on_stack, &mut path, &mut found);
                on_stack[start.index()] = false;
            }
        }

        let cycles: Vec<LinkCycle> = found
            .into_iter()
            .map(|edges| {
                let mut vertices = Vec::with_capacity(edges.len());
                let mut links = Vec::with_capacity(edges.len());
                let mut link_types = Vec::with_capacity(edges.len());
                let mut strength_product = 1.0;
                for idx in edges {
                    if let Some((from, _)) = g.edge_endpoints(idx) {
                        vertices.push(g[from].clone());
                    }
                    let edge = &g[idx];
                    links.push(edge.link_id.clone());
                    link_types.push(edge.link_type);
                    strength_product *= edge.strength;
                }
                let kind = CycleKind::classify(&link_types);
                LinkCycle {
                    vertices,
                    links,
                    link_types,
                    strength_product,
                    kind,
                }
            })
            .collect();

        summarize(cycles)
    }

    fn walk(
        &self,
        graph: &LinkGraph,
        start: NodeIndex,
        current: NodeIndex,
        on_stack: &mut [bool],
        path: &mut Vec<EdgeIndex>,
        found: &mut Vec<Vec<EdgeIndex>>,
    ) {
        let g = graph.inner();
        let mut edges: Vec<_> = g.edges_directed(current, Direction::Outgoing).collect();
        edges.sort_by_key(|e| (e.target().index(), e.id().index()));

        for edge in edges {
            let next = edge.target();
            if next == start {
                let mut cycle = path.clone();
                cycle.push(edge.id());
                found.push(cycle);
            } else if next.index() > start.index()
                && !on_stack[next.index()]
                && path.len() + 2 <= self.max_cycle_length
            {
                on_stack[next.index()] = true;
                path.push(edge.id());
                self.walk(graph, start, next, on_stack, path, found);
                path.pop();
                on_stack[next.index()] = false;
            }
        }
    }
}

impl Default for CycleDetector {
    fn default() -> Self {
        Self::new(10)
    }
}

fn summarize(cycles: Vec<LinkCycle>) -> CycleReport {
    if cycles.is_empty() {
        return CycleReport::default();
    }

    let total_cycles = cycles.len();
    let total_length: usize = cycles.iter().map(|c| c.len()).sum();
    let max_strength_product = cycles
        .iter()
        .map(|c| c.strength_product)
        .fold(0.0_f64, f64::max);

    let mut by_kind = BTreeMap::new();
    let mut by_link_type = BTreeMap::new();
    let mut warnings = Vec::new();

    for cycle in &cycles {
        *by_kind.entry(cycle.kind).or_insert(0) += 1;
        for link_type in &cycle.link_types {
            *by_link_type.entry(*link_type).or_insert(0) += 1;
        }

        match cycle.kind {
            CycleKind::Triggering => warnings.push(format!(
                "Cycle {} contains a TRIGGERS link and may cause an infinite execution loop",
                cycle.path()
            )),
            CycleKind::Nesting
                if cycle
                    .vertices
                    .iter()
                    .all(|v| v.feature == FeatureType::FunctionModel) =>
            {
                warnings.push(format!(
                    "Cycle {} nests function models recursively; nested execution would not terminate",
                    cycle.path()
                ))
            }
            _ => {}
        }
        if cycle.strength_product >= STRONG_COUPLING {
            warnings.push(format!(
                "Cycle {} is strongly coupled (strength product {:.2})",
                cycle.path(),
                cycle.strength_product
            ));
        }
    }

    CycleReport {
        total_cycles,
        average_cycle_length: total_length as f64 / total_cycles as f64,
        max_strength_product,
        by_kind,
        by_link_type,
        warnings,
        cycles,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::model::CrossFeatureLink;

    fn link(id: &str, from: &str, to: &str, link_type: LinkType, strength: f64) -> CrossFeatureLink {
        CrossFeatureLink::with_id(
            id,
            FeatureRef::model(from),
            FeatureRef::model(to),
            link_type,
            strength,
        )
        .unwrap()
    }

    #[test]
    fn test_empty_graph_yields_zeroes() {
        let report = CycleDetector::default().detect(&LinkGraph::from_links(&[]));
        assert_eq!(report.total_cycles, 0);
        assert!(report.cycles.is_empty());
        assert_eq!(report.average_cycle_length, 0.0);
        assert_eq!(report.max_strength_product, 0.0);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_acyclic_graph() {
        let graph = LinkGraph::from_links(&[
            link("l1", "a", "b", LinkType::References, 0.5),
            link("l2", "b", "c", LinkType::References, 0.5),
            link("l3", "a", "c", LinkType::References, 0.5),
        ]);
        let report = CycleDetector::default().detect(&graph);
        assert!(!report.has_cycles());
    }

    #[test]
    fn test_two_cycle_reported_once() {
        let graph = LinkGraph::from_links(&[
            link("l1", "a", "b", LinkType::References, 0.5),
            link("l2", "b", "a", LinkType::References, 0.4),
        ]);
        let report = CycleDetector::default().detect(&graph);
        assert_eq!(report.total_cycles, 1);
        assert_eq!(report.average_cycle_length, 2.0);
        assert!((report.max_strength_product - 0.2).abs() < 1e-9);
        assert_eq!(report.cycles[0].kind, CycleKind::Informational);
        assert_eq!(report.cycles[0].path(), "function-model:a -> function-model:b -> function-model:a");
    }

    #[test]
    fn test_triggers_cycle_warns() {
        let graph = LinkGraph::from_links(&[
            link("l1", "a", "b", LinkType::Triggers, 0.9),
            link("l2", "b", "c", LinkType::References, 0.9),
            link("l3", "c", "a", LinkType::References, 0.9),
        ]);
        let report = CycleDetector::default().detect(&graph);
        assert_eq!(report.total_cycles, 1);
        assert_eq!(report.cycles[0].kind, CycleKind::Triggering);
        assert_eq!(report.by_kind[&CycleKind::Triggering], 1);
        assert_eq!(report.by_link_type[&LinkType::References], 2);
        assert!(report.warnings.iter().any(|w| w.contains("TRIGGERS")));
        assert_eq!(report.dangerous().count(), 1);
    }

    #[test]
    fn test_mutual_nesting_warns() {
        let graph = LinkGraph::from_links(&[
            link("l1", "a", "b", LinkType::Nested, 0.5),
            link("l2", "b", "a", LinkType::Nested, 0.5),
        ]);
        let report = CycleDetector::default().detect(&graph);
        assert_eq!(report.cycles[0].kind, CycleKind::Nesting);
        assert!(report.warnings.iter().any(|w| w.contains("recursively")));
    }

    #[test]
    fn test_max_length_bounds_search() {
        let graph = LinkGraph::from_links(&[
            link("l1", "a", "b", LinkType::References, 0.5),
            link("l2", "b", "c", LinkType::References, 0.5),
            link("l3", "c", "d", LinkType::References, 0.5),
            link("l4", "d", "a", LinkType::References, 0.5),
        ]);
        assert_eq!(CycleDetector::new(3).detect(&graph).total_cycles, 0);
        assert_eq!(CycleDetector::new(4).detect(&graph).total_cycles, 1);
    }

    #[test]
    fn test_overlapping_cycles() {
        // a <-> b and a -> b -> c -> a share the a->b edge
        let graph = LinkGraph::from_links(&[
            link("ab", "a", "b", LinkType::References, 1.0),
            link("ba", "b", "a", LinkType::References, 0.5),
            link("bc", "b", "c", LinkType::References, 1.0),
            link("ca", "c", "a", LinkType::References, 1.0),
        ]);
        let report = CycleDetector::default().detect(&graph);
        assert_eq!(report.total_cycles, 2);
        assert!((report.average_cycle_length - 2.5).abs() < 1e-9);
        assert!((report.max_strength_product - 1.0).abs() < 1e-9);
        assert!(report.warnings.iter().any(|w| w.contains("strongly coupled")));
    }
}
