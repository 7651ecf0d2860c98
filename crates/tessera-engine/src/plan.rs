use std::collections::HashMap;

use tessera_core::error::{Result, TesseraError};
use tessera_core::model::{ActionNode, FunctionModel};
use tessera_core::types::NodeId;
use tessera_validator::passes::action_steps;
use tessera_validator::DependencyGraph;

/// Static schedule for one model: node order, per-node dependencies and
/// per-node action steps.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Topological order, ties broken by declaration order.
    pub order: Vec<NodeId>,
    /// Dependency-depth levels; nodes within a level are independent.
    pub levels: Vec<Vec<NodeId>>,
    dependencies: HashMap<NodeId, Vec<NodeId>>,
    steps: HashMap<NodeId, Vec<Vec<ActionNode>>>,
}

impl ExecutionPlan {
    /// Fails on dependency cycles and on dependencies naming unknown or
    /// self nodes.
    pub fn build(model: &FunctionModel) -> Result<Self> {
        let graph = DependencyGraph::from_model(model);
        if let Some((node, dep)) = graph.unknown_dependencies().first() {
            return Err(TesseraError::InvalidModel(format!(
                "node '{}' depends on unknown node '{}'",
                node, dep
            )));
        }
        if let Some(node) = graph.self_dependencies().first() {
            return Err(TesseraError::CycleDetected(format!("node '{}' depends on itself", node)));
        }

        let order = graph.stable_order()?;
        let levels = graph.levels()?;

        let dependencies = model
            .nodes
            .iter()
            .map(|n| {
                let mut deps = n.dependencies.clone();
                deps.dedup();
                (n.id.clone(), deps)
            })
            .collect();

        let steps = model
            .nodes
            .iter()
            .map(|n| {
                let steps = action_steps(model, &n.id)
                    .into_iter()
                    .map(|step| step.into_iter().cloned().collect())
                    .collect();
                (n.id.clone(), steps)
            })
            .collect();

        Ok(Self {
            order,
            levels,
            dependencies,
            steps,
        })
    }

    pub fn dependencies(&self, node: &NodeId) -> &[NodeId] {
        self.dependencies.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn steps(&self, node: &NodeId) -> &[Vec<ActionNode>] {
        self.steps.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn action_count(&self) -> usize {
        self.steps.values().flatten().map(Vec::len).sum()
    }
}
