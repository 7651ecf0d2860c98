use tessera_core::error::Result;
use tessera_core::model::{ActionKind, FeatureRef, FunctionModel, ModelStatus, RecoveryAction};
use tessera_links::{CycleDetector, LinkGraph};

use crate::passes::ValidationPass;
use crate::pipeline::ValidationContext;
use crate::report::{PassKind, PassReport, ValidationIssue};

/// References to other models, agents and links resolve; link types fit
/// their feature pair; external integrations carry auth; no nesting cycles.
pub struct CrossFeaturePass;

impl ValidationPass for CrossFeaturePass {
    fn kind(&self) -> PassKind {
        PassKind::CrossFeature
    }

    fn run(&self, model: &FunctionModel, ctx: &ValidationContext) -> Result<PassReport> {
        let catalog = &ctx.catalog;
        let mut report = PassReport::new();

        for action in &model.actions {
            match &action.kind {
                ActionKind::FunctionModel(cfg) => match catalog.model(&cfg.model_id) {
                    None => report.error(
                        ValidationIssue::new(
                            "UNRESOLVED_MODEL",
                            format!("Nested model '{}' does not exist", cfg.model_id),
                        )
                        .on(&action.id),
                    ),
                    Some(child) if child.deleted => report.error(
                        ValidationIssue::new(
                            "DELETED_MODEL",
                            format!("Nested model '{}' has been deleted", child.name),
                        )
                        .on(&action.id),
                    ),
                    Some(child) if child.status != ModelStatus::Published => report.error(
                        ValidationIssue::new(
                            "UNPUBLISHED_MODEL",
                            format!(
                                "Nested model '{}' is {} and cannot be executed",
                                child.name, child.status
                            ),
                        )
                        .on(&action.id),
                    ),
                    Some(_) => {}
                },
                ActionKind::AiAgent(cfg) => match catalog.agent(&cfg.agent_id) {
                    None => report.error(
                        ValidationIssue::new(
                            "UNRESOLVED_AGENT",
                            format!("Agent '{}' is not registered", cfg.agent_id),
                        )
                        .on(&action.id),
                    ),
                    Some(agent) => {
                        if !agent.enabled {
                            report.warn(
                                ValidationIssue::new(
                                    "DISABLED_AGENT",
                                    format!("Agent '{}' is disabled", agent.name),
                                )
                                .on(&action.id),
                            );
                        }
                        let missing: Vec<&str> = cfg
                            .required_capabilities
                            .iter()
                            .filter(|c| !agent.capabilities.iter().any(|own| own.eq_ignore_ascii_case(c)))
                            .map(|c| c.as_str())
                            .collect();
                        if !missing.is_empty() {
                            report.warn(
                                ValidationIssue::new(
                                    "MISSING_CAPABILITY",
                                    format!(
                                        "Agent '{}' lacks capabilities: {}",
                                        agent.name,
                                        missing.join(", ")
                                    ),
                                )
                                .on(&action.id),
                            );
                        }
                    }
                },
                ActionKind::Tether(cfg) if cfg.requires_auth && cfg.auth.is_none() => {
                    report.error(
                        ValidationIssue::new(
                            "MISSING_AUTH",
                            format!("External integration '{}' requires auth but none is configured", action.name),
                        )
                        .on(&action.id),
                    );
                }
                _ => {}
            }
        }

        for (i, policy) in model.recovery_policies.iter().enumerate() {
            let entity = format!("recovery_policies[{}]", i);
            match policy.action {
                RecoveryAction::FallbackAgent => {
                    if let Some(agent) = &policy.fallback_agent {
                        if catalog.agent(agent).is_none() {
                            report.error(
                                ValidationIssue::new(
                                    "UNRESOLVED_AGENT",
                                    format!("Fallback agent '{}' is not registered", agent),
                                )
                                .on(&entity),
                            );
                        }
                    }
                }
                RecoveryAction::PropagateCrossFeature => {
                    if let Some(link_id) = &policy.link_id {
                        match catalog.link(link_id) {
                            None => report.error(
                                ValidationIssue::new(
                                    "UNRESOLVED_LINK",
                                    format!("Propagation link '{}' does not exist", link_id),
                                )
                                .on(&entity),
                            ),
                            Some(link) if !link.touches(&FeatureRef::model(model.id.as_str())) => {
                                report.warn(
                                    ValidationIssue::new(
                                        "FOREIGN_LINK",
                                        format!("Propagation link '{}' does not touch this model", link_id),
                                    )
                                    .on(&entity),
                                )
                            }
                            Some(_) => {}
                        }
                    }
                }
                _ => {}
            }
        }

        let me = FeatureRef::model(model.id.as_str());
        for link in catalog.links().iter().filter(|l| l.touches(&me)) {
            if !link.link_type.is_compatible(link.source.feature, link.target.feature) {
                report.error(
                    ValidationIssue::new(
                        "INCOMPATIBLE_LINK",
                        format!(
                            "{} link from {} to {} is not allowed",
                            link.link_type, link.source, link.target
                        ),
                    )
                    .on(&link.id),
                );
            }
        }

        let detector = CycleDetector::new(ctx.max_cycle_length);
        let nesting = detector.detect(&catalog.nesting_graph(model));
        for cycle in nesting.cycles.iter().filter(|c| c.vertices.contains(&me)) {
            report.error(ValidationIssue::new(
                "NESTED_MODEL_CYCLE",
                format!("Models nest each other recursively: {}", cycle.path()),
            ));
        }

        let links = detector.detect(&LinkGraph::from_links(catalog.links()));
        for cycle in links.dangerous().filter(|c| c.vertices.contains(&me)) {
            report.warn(ValidationIssue::new(
                "LINK_CYCLE",
                format!("Link cycle through this model: {}", cycle.path()),
            ));
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ReferenceCatalog;
    use tessera_core::error::ErrorType;
    use tessera_core::model::{
        ActionNode, AiAgent, CrossFeatureLink, LinkType, NestedModelConfig, Node, RecoveryPolicy,
        TetherAuth,
    };
    use tessera_core::types::ModelId;

    fn nested(child: &str) -> NestedModelConfig {
        NestedModelConfig {
            model_id: ModelId::from(child),
            input_mapping: Default::default(),
            output_mapping: Default::default(),
        }
    }

    fn parent() -> FunctionModel {
        let mut m = FunctionModel::with_id("parent", "Parent", "u");
        m.add_node(Node::stage("s", "S")).unwrap();
        m
    }

    fn published(id: &str) -> FunctionModel {
        let mut m = FunctionModel::with_id(id, id, "u");
        m.publish().unwrap();
        m
    }

    fn run(m: &FunctionModel, catalog: ReferenceCatalog) -> PassReport {
        let ctx = ValidationContext {
            catalog,
            ..ValidationContext::default()
        };
        CrossFeaturePass.run(m, &ctx).unwrap()
    }

    #[test]
    fn test_nested_references_resolve() {
        let mut m = parent();
        m.add_action(ActionNode::nested("ok", "s", nested("child")).with_order(0)).unwrap();
        m.add_action(ActionNode::nested("missing", "s", nested("ghost")).with_order(1)).unwrap();
        m.add_action(ActionNode::nested("draft", "s", nested("draft")).with_order(2)).unwrap();

        let child = published("child");
        let draft = FunctionModel::with_id("draft", "draft", "u");
        let report = run(&m, ReferenceCatalog::new().with_models([&child, &draft]));
        assert!(report.has_code("UNRESOLVED_MODEL"));
        assert!(report.has_code("UNPUBLISHED_MODEL"));
        assert_eq!(report.errors.len(), 2);
    }

    #[test]
    fn test_agents_and_auth() {
        let mut m = parent();
        let mut task = ActionNode::agent_task("a", "s", "writer", "draft reply");
        if let ActionKind::AiAgent(cfg) = &mut task.kind {
            cfg.required_capabilities = vec!["summarize".into(), "translate".into()];
        }
        m.add_action(task.with_order(0)).unwrap();
        m.add_action(ActionNode::agent_task("b", "s", "ghost", "x").with_order(1)).unwrap();
        let mut tether = ActionNode::tether("t", "s", "https://x.test").with_order(2);
        if let ActionKind::Tether(cfg) = &mut tether.kind {
            cfg.requires_auth = true;
        }
        m.add_action(tether).unwrap();
        m.recovery_policies.push(RecoveryPolicy::fallback(ErrorType::AgentFailure, "nobody"));

        let writer = AiAgent::new("writer", "Writer").with_capabilities(vec!["summarize".into()]);
        let report = run(&m, ReferenceCatalog::new().with_agents([writer]));
        assert!(report.has_code("MISSING_CAPABILITY"));
        assert!(report.has_code("MISSING_AUTH"));
        assert_eq!(report.errors.iter().filter(|e| e.code == "UNRESOLVED_AGENT").count(), 2);

        if let ActionKind::Tether(cfg) = &mut m.actions[2].kind {
            cfg.auth = Some(TetherAuth::Bearer {
                token_ref: "API_TOKEN".into(),
            });
        }
        let report = run(&m, ReferenceCatalog::new());
        assert!(!report.has_code("MISSING_AUTH"));
    }

    #[test]
    fn test_propagation_link_must_exist() {
        let mut m = parent();
        m.recovery_policies.push(RecoveryPolicy::propagate(ErrorType::CascadeFailure, "l1"));
        assert!(run(&m, ReferenceCatalog::new()).has_code("UNRESOLVED_LINK"));

        let link = CrossFeatureLink::with_id(
            "l1",
            FeatureRef::model("parent"),
            FeatureRef::model("other"),
            LinkType::References,
            0.5,
        )
        .unwrap();
        let report = run(&m, ReferenceCatalog::new().with_links([link]));
        assert!(report.is_valid());
    }

    #[test]
    fn test_nesting_cycle_rejected() {
        let mut m = parent();
        m.add_action(ActionNode::nested("n", "s", nested("child"))).unwrap();

        let mut child = FunctionModel::with_id("child", "child", "u");
        child.add_node(Node::stage("s", "S")).unwrap();
        child
            .add_action(ActionNode::nested("back", "s", nested("parent")))
            .unwrap();
        child.publish().unwrap();

        let report = run(&m, ReferenceCatalog::new().with_models([&child]));
        assert!(report.has_code("NESTED_MODEL_CYCLE"));
    }

    #[test]
    fn test_triggers_cycle_warns() {
        let m = parent();
        let links = vec![
            CrossFeatureLink::with_id("a", FeatureRef::model("parent"), FeatureRef::model("x"), LinkType::Triggers, 0.5)
                .unwrap(),
            CrossFeatureLink::with_id("b", FeatureRef::model("x"), FeatureRef::model("parent"), LinkType::Triggers, 0.5)
                .unwrap(),
        ];
        let report = run(&m, ReferenceCatalog::new().with_links(links));
        assert!(report.is_valid());
        assert!(report.has_code("LINK_CYCLE"));
    }
}
