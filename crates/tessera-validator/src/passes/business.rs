use std::collections::HashSet;

use tessera_core::error::Result;
use tessera_core::model::{ActionKind, FunctionModel, NodeKind};

use crate::passes::ValidationPass;
use crate::pipeline::ValidationContext;
use crate::report::{PassKind, PassReport, ValidationIssue};

/// Required nodes, action configuration completeness, permissions, policy compliance.
pub struct BusinessRulesPass;

impl ValidationPass for BusinessRulesPass {
    fn kind(&self) -> PassKind {
        PassKind::BusinessRules
    }

    fn run(&self, model: &FunctionModel, ctx: &ValidationContext) -> Result<PassReport> {
        let mut report = PassReport::new();

        if model.name.trim().is_empty() {
            report.error(ValidationIssue::new("MISSING_NAME", "Model name must not be empty"));
        }

        if !model.nodes.iter().any(|n| n.kind == NodeKind::Stage) {
            report.warn(ValidationIssue::new(
                "NO_PROCESSING_STAGE",
                "Model has no processing stage; it only moves data between boundaries",
            ));
        }

        if let Some(user) = &ctx.user {
            if !model.permissions.can_edit(user) {
                report.error(ValidationIssue::new(
                    "PERMISSION_DENIED",
                    format!("User '{}' may not edit or publish this model", user),
                ));
            }
        }

        for action in &model.actions {
            if let Some(problem) = incomplete_config(&action.kind, model) {
                report.error(ValidationIssue::new("INCOMPLETE_ACTION_CONFIG", problem).on(&action.id));
            }
            if model
                .node(&action.node_id)
                .is_some_and(|n| n.io_direction().is_some())
            {
                report.warn(
                    ValidationIssue::new(
                        "ACTION_ON_BOUNDARY",
                        format!("Action '{}' is attached to an IO boundary instead of a stage", action.name),
                    )
                    .on(&action.id),
                );
            }
            if action.critical && action.raci.responsible.is_empty() {
                report.warn(
                    ValidationIssue::new(
                        "NO_RESPONSIBLE_PARTY",
                        format!("Critical action '{}' has no responsible party", action.name),
                    )
                    .on(&action.id),
                );
            }
        }

        let mut seen = HashSet::new();
        for (i, policy) in model.recovery_policies.iter().enumerate() {
            if let Some(problem) = policy.configuration_problem() {
                report.error(
                    ValidationIssue::new("INVALID_RECOVERY_POLICY", problem)
                        .on(format!("recovery_policies[{}]", i)),
                );
            }
            if !seen.insert(policy.error_type) {
                report.warn(
                    ValidationIssue::new(
                        "SHADOWED_RECOVERY_POLICY",
                        format!(
                            "Policy for '{}' is never used; an earlier policy matches first",
                            policy.error_type
                        ),
                    )
                    .on(format!("recovery_policies[{}]", i)),
                );
            }
        }

        Ok(report)
    }
}

fn incomplete_config(kind: &ActionKind, model: &FunctionModel) -> Option<String> {
    match kind {
        ActionKind::Tether(cfg) if cfg.endpoint.trim().is_empty() => {
            Some("Tether action has no endpoint".into())
        }
        ActionKind::KnowledgeBase(cfg) if cfg.knowledge_base_id.trim().is_empty() => {
            Some("Knowledge-base action has no knowledge base".into())
        }
        ActionKind::KnowledgeBase(cfg) if cfg.query.trim().is_empty() => {
            Some("Knowledge-base action has no query".into())
        }
        ActionKind::AiAgent(cfg) if cfg.agent_id.as_str().is_empty() => {
            Some("AI-agent action has no agent".into())
        }
        ActionKind::AiAgent(cfg) if cfg.task.trim().is_empty() => {
            Some("AI-agent action has no task".into())
        }
        ActionKind::FunctionModel(cfg) if cfg.model_id.as_str().is_empty() => {
            Some("Nested-model action has no model".into())
        }
        ActionKind::FunctionModel(cfg) if cfg.model_id == model.id => {
            Some("Nested-model action references its own model".into())
        }
        _ => None,
    }
}
