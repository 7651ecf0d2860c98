//! Node dependency graph built on `petgraph`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use tessera_core::error::{Result, TesseraError};
use tessera_core::model::FunctionModel;
use tessera_core::types::NodeId;

/// Container nodes of one model with an edge from each dependency to its
/// dependent. Vertex index equals declaration index, which is what every
/// ordering below breaks ties on.
#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraph<NodeId, ()>,
    index_map: HashMap<NodeId, NodeIndex>,
    self_dependencies: Vec<NodeId>,
    unknown_dependencies: Vec<(NodeId, NodeId)>,
}

impl DependencyGraph {
    /// Build the graph. Self-dependencies and dependencies on unknown nodes
    /// are recorded rather than added as edges.
    pub fn from_model(model: &FunctionModel) -> Self {
        let mut graph = DiGraph::new();
        let mut index_map = HashMap::new();

        for node in &model.nodes {
            if !index_map.contains_key(&node.id) {
                let idx = graph.add_node(node.id.clone());
                index_map.insert(node.id.clone(), idx);
            }
        }

        let mut self_dependencies = Vec::new();
        let mut unknown_dependencies = Vec::new();
        let mut seen_edges = HashSet::new();
        for node in &model.nodes {
            let Some(&to) = index_map.get(&node.id) else {
                continue;
            };
            for dep in &node.dependencies {
                if dep == &node.id {
                    self_dependencies.push(node.id.clone());
                    continue;
                }
                match index_map.get(dep) {
                    Some(&from) => {
                        if seen_edges.insert((from, to)) {
                            graph.add_edge(from, to, ());
                        }
                    }
                    None => unknown_dependencies.push((node.id.clone(), dep.clone())),
                }
            }
        }

        Self {
            graph,
            index_map,
            self_dependencies,
            unknown_dependencies,
        }
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn self_dependencies(&self) -> &[NodeId] {
        &self.self_dependencies
    }

    /// `(node, missing dependency)` pairs.
    pub fn unknown_dependencies(&self) -> &[(NodeId, NodeId)] {
        &self.unknown_dependencies
    }

    /// Returns `true` if the graph contains at least one cycle.
    pub fn has_cycle(&self) -> bool {
        petgraph::algo::is_cyclic_directed(&self.graph)
    }

    /// Node sets that depend on each other circularly, in declaration order.
    pub fn cycles(&self) -> Vec<Vec<NodeId>> {
        let mut cycles: Vec<Vec<NodeId>> = petgraph::algo::tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1)
            .map(|mut scc| {
                scc.sort_by_key(|idx| idx.index());
                scc.into_iter().map(|idx| self.graph[idx].clone()).collect()
            })
            .collect();
        cycles.sort();
        cycles
    }

    /// Topological order; among ready nodes the earliest declared goes first.
    pub fn stable_order(&self) -> Result<Vec<NodeId>> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|idx| self.graph.neighbors_directed(idx, Direction::Incoming).count())
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(Reverse(i)) = ready.pop() {
            let idx = NodeIndex::new(i);
            order.push(self.graph[idx].clone());
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                in_degree[next.index()] -= 1;
                if in_degree[next.index()] == 0 {
                    ready.push(Reverse(next.index()));
                }
            }
        }

        if order.len() != self.graph.node_count() {
            return Err(self.cycle_error());
        }
        Ok(order)
    }

    /// Parallel levels: each level's nodes depend only on earlier levels.
    pub fn levels(&self) -> Result<Vec<Vec<NodeId>>> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|idx| self.graph.neighbors_directed(idx, Direction::Incoming).count())
            .collect();

        let mut current: Vec<usize> = (0..in_degree.len()).filter(|i| in_degree[*i] == 0).collect();
        let mut levels = Vec::new();
        let mut placed = 0;

        while !current.is_empty() {
            placed += current.len();
            let mut next = Vec::new();
            for &i in &current {
                for n in self.graph.neighbors_directed(NodeIndex::new(i), Direction::Outgoing) {
                    in_degree[n.index()] -= 1;
                    if in_degree[n.index()] == 0 {
                        next.push(n.index());
                    }
                }
            }
            next.sort_unstable();
            levels.push(current.iter().map(|i| self.graph[NodeIndex::new(*i)].clone()).collect());
            current = next;
        }

        if placed != self.graph.node_count() {
            return Err(self.cycle_error());
        }
        Ok(levels)
    }

    /// Direct dependencies of `id` that exist in the graph, in declaration order.
    pub fn dependencies(&self, id: &NodeId) -> Vec<NodeId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Nodes that directly depend on `id`, in declaration order.
    pub fn dependents(&self, id: &NodeId) -> Vec<NodeId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &NodeId, dir: Direction) -> Vec<NodeId> {
        let Some(&idx) = self.index_map.get(id) else {
            return Vec::new();
        };
        let mut found: Vec<NodeIndex> = self.graph.neighbors_directed(idx, dir).collect();
        found.sort_by_key(|i| i.index());
        found.into_iter().map(|i| self.graph[i].clone()).collect()
    }

    /// Every node reachable by following dependents from `starts`, inclusive.
    pub fn reachable_from<'a>(&self, starts: impl IntoIterator<Item = &'a NodeId>) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<NodeIndex> = starts
            .into_iter()
            .filter_map(|id| self.index_map.get(id).copied())
            .collect();
        while let Some(idx) = queue.pop_front() {
            if !seen.insert(self.graph[idx].clone()) {
                continue;
            }
            queue.extend(self.graph.neighbors_directed(idx, Direction::Outgoing));
        }
        seen
    }

    /// Every transitive dependency of `id`, excluding `id`.
    pub fn ancestors(&self, id: &NodeId) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let Some(&start) = self.index_map.get(id) else {
            return seen;
        };
        let mut queue: VecDeque<NodeIndex> =
            self.graph.neighbors_directed(start, Direction::Incoming).collect();
        while let Some(idx) = queue.pop_front() {
            if idx == start || !seen.insert(self.graph[idx].clone()) {
                continue;
            }
            queue.extend(self.graph.neighbors_directed(idx, Direction::Incoming));
        }
        seen
    }

    fn cycle_error(&self) -> TesseraError {
        let members: Vec<String> = self
            .cycles()
            .into_iter()
            .map(|c| c.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(" -> "))
            .collect();
        TesseraError::CycleDetected(members.join("; "))
    }
}
