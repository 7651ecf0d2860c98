use std::collections::HashSet;

use tessera_core::error::Result;
use tessera_core::model::FunctionModel;

use crate::graph::DependencyGraph;
use crate::passes::ValidationPass;
use crate::pipeline::ValidationContext;
use crate::report::{PassKind, PassReport, ValidationIssue};

/// Graph well-formedness: ids, dependencies, cycles, IO boundaries, reachability.
pub struct StructuralPass;

impl StructuralPass {
    /// The checks themselves; needs no reference catalog.
    pub fn check(model: &FunctionModel) -> PassReport {
        let mut report = PassReport::new();

        for id in model.duplicate_ids() {
            report.error(ValidationIssue::new("DUPLICATE_ID", format!("Duplicate id '{}'", id)).on(&id));
        }

        for action in &model.actions {
            if model.node(&action.node_id).is_none() {
                report.error(
                    ValidationIssue::new(
                        "ORPHANED_ACTION",
                        format!(
                            "Action '{}' belongs to unknown container '{}'",
                            action.id, action.node_id
                        ),
                    )
                    .on(&action.id),
                );
            }
        }

        let graph = DependencyGraph::from_model(model);

        for node in graph.self_dependencies() {
            report.error(
                ValidationIssue::new("SELF_DEPENDENCY", format!("Node '{}' depends on itself", node))
                    .on(node),
            );
        }
        for (node, dep) in graph.unknown_dependencies() {
            report.error(
                ValidationIssue::new(
                    "UNKNOWN_DEPENDENCY",
                    format!("Node '{}' depends on unknown node '{}'", node, dep),
                )
                .on(node),
            );
        }
        for cycle in graph.cycles() {
            let path: Vec<&str> = cycle.iter().map(|n| n.as_str()).collect();
            report.error(ValidationIssue::new(
                "CIRCULAR_DEPENDENCY",
                format!("Circular dependency between nodes: {}", path.join(", ")),
            ));
        }

        let inputs: Vec<_> = model.nodes.iter().filter(|n| n.is_input_capable()).collect();
        if inputs.is_empty() {
            report.error(ValidationIssue::new(
                "MISSING_INPUT_BOUNDARY",
                "Workflow needs at least one input-capable IO boundary",
            ));
        }
        if !model.nodes.iter().any(|n| n.is_output_capable()) {
            report.error(ValidationIssue::new(
                "MISSING_OUTPUT_BOUNDARY",
                "Workflow needs at least one output-capable IO boundary",
            ));
        }

        if model.nodes.len() > 1 {
            let orphans: HashSet<_> = model
                .nodes
                .iter()
                .filter(|n| n.dependencies.is_empty() && model.dependents_of(&n.id).next().is_none())
                .map(|n| n.id.clone())
                .collect();
            for node in model.nodes.iter().filter(|n| orphans.contains(&n.id)) {
                report.warn(
                    ValidationIssue::new(
                        "ORPHANED_NODE",
                        format!("Node '{}' has no dependencies and no dependents", node.name),
                    )
                    .on(&node.id),
                );
            }

            if !inputs.is_empty() {
                let reachable = graph.reachable_from(inputs.iter().map(|n| &n.id));
                for node in &model.nodes {
                    if !reachable.contains(&node.id) && !orphans.contains(&node.id) {
                        report.warn(
                            ValidationIssue::new(
                                "UNREACHABLE_NODE",
                                format!("Node '{}' is not reachable from any input boundary", node.name),
                            )
                            .on(&node.id),
                        );
                    }
                }
            }
        }

        let mut names = HashSet::new();
        for node in &model.nodes {
            if !names.insert(node.name.as_str()) {
                report.warn(
                    ValidationIssue::new("DUPLICATE_NODE_NAME", format!("Node name '{}' is used more than once", node.name))
                        .on(&node.id),
                );
            }
        }

        report
    }
}

impl ValidationPass for StructuralPass {
    fn kind(&self) -> PassKind {
        PassKind::Structural
    }

    fn run(&self, model: &FunctionModel, _ctx: &ValidationContext) -> Result<PassReport> {
        Ok(Self::check(model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::model::{ActionNode, ContextBinding, Node};

    fn linear() -> FunctionModel {
        let mut m = FunctionModel::with_id("m", "Linear", "u");
        m.add_node(Node::input("in", "In", vec![ContextBinding::new("x")])).unwrap();
        m.add_node(Node::stage("s", "Stage").depends_on("in")).unwrap();
        m.add_node(Node::output("out", "Out", vec![]).depends_on("s")).unwrap();
        m.add_action(ActionNode::tether("t", "s", "https://example.com/api")).unwrap();
        m
    }

    #[test]
    fn test_valid_linear_model() {
        let report = StructuralPass::check(&linear());
        assert!(report.is_valid(), "{:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_missing_boundaries() {
        let mut m = FunctionModel::with_id("m", "Stages", "u");
        m.add_node(Node::stage("s", "S")).unwrap();
        let report = StructuralPass::check(&m);
        assert!(report.has_code("MISSING_INPUT_BOUNDARY"));
        assert!(report.has_code("MISSING_OUTPUT_BOUNDARY"));
    }

    #[test]
    fn test_cycles_and_bad_dependencies() {
        let mut m = linear();
        m.nodes[0].dependencies.push("out".into());
        m.nodes[1].dependencies.push("s".into());
        m.nodes[2].dependencies.push("ghost".into());
        let report = StructuralPass::check(&m);
        assert!(report.has_code("CIRCULAR_DEPENDENCY"));
        assert!(report.has_code("SELF_DEPENDENCY"));
        assert!(report.has_code("UNKNOWN_DEPENDENCY"));
    }

    #[test]
    fn test_duplicates_and_orphans() {
        let mut m = linear();
        m.nodes.push(Node::stage("lonely", "Stage"));
        m.actions.push(ActionNode::tether("t", "s", "https://example.com"));
        m.actions.push(ActionNode::tether("x", "nowhere", "https://example.com"));
        let report = StructuralPass::check(&m);
        assert!(report.has_code("DUPLICATE_ID"));
        assert!(report.has_code("ORPHANED_ACTION"));
        assert!(report.has_code("ORPHANED_NODE"));
        assert!(report.has_code("DUPLICATE_NODE_NAME"));
        assert!(!report.has_code("UNREACHABLE_NODE"));
    }

    #[test]
    fn test_unreachable_warning() {
        let mut m = linear();
        m.nodes.push(Node::stage("a", "A").depends_on("b"));
        m.nodes.push(Node::stage("b", "B"));
        let report = StructuralPass::check(&m);
        assert!(report.is_valid());
        assert_eq!(
            report.warnings.iter().filter(|w| w.code == "UNREACHABLE_NODE").count(),
            2
        );
    }
}
