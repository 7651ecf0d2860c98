use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use tessera_core::error::{Result, TesseraError};
use tessera_core::model::{ActionKind, ActionMode, FunctionModel, NodeKind, TetherConfig};

use crate::passes::ValidationPass;
use crate::pipeline::ValidationContext;
use crate::report::{PassKind, PassReport, ValidationIssue};

const METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE"];

fn endpoint_re() -> Result<&'static Regex> {
    static RE: OnceLock<std::result::Result<Regex, String>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^https?://(?P<host>[A-Za-z0-9.\-]+|\[[0-9A-Fa-f:]+\])(?::\d{1,5})?(?:[/?#]\S*)?$")
            .map_err(|e| e.to_string())
    })
    .as_ref()
    .map_err(|e| TesseraError::Config(e.clone()))
}

/// Adapter configuration, execution order, error handling, external reachability.
pub struct ExecutionReadinessPass;

impl ValidationPass for ExecutionReadinessPass {
    fn kind(&self) -> PassKind {
        PassKind::ExecutionReadiness
    }

    fn run(&self, model: &FunctionModel, _ctx: &ValidationContext) -> Result<PassReport> {
        let re = endpoint_re()?;
        let mut report = PassReport::new();

        for action in &model.actions {
            if let ActionKind::Tether(cfg) = &action.kind {
                check_tether(cfg, re, &action.id, &mut report);
            }

            if let Some(retry) = &action.retry {
                if retry.max_attempts == 0 {
                    report.error(
                        ValidationIssue::new("INVALID_RETRY_POLICY", "Retry policy allows zero attempts")
                            .on(&action.id),
                    );
                }
                if retry.backoff_multiplier < 1.0 {
                    report.warn(
                        ValidationIssue::new(
                            "SHRINKING_BACKOFF",
                            format!("Backoff multiplier {} shrinks delays between retries", retry.backoff_multiplier),
                        )
                        .on(&action.id),
                    );
                }
            }

            if action.critical && action.retry.is_none() && model.recovery_policies.is_empty() {
                report.error(
                    ValidationIssue::new(
                        "MISSING_ERROR_HANDLING",
                        format!("Critical action '{}' has neither a retry nor a recovery policy", action.name),
                    )
                    .on(&action.id),
                );
            }

            if !action.is_active() {
                report.warn(
                    ValidationIssue::new("INACTIVE_ACTION", format!("Action '{}' will be skipped", action.name))
                        .on(&action.id),
                );
            }
        }

        // Sequential siblings must have distinct execution orders
        let mut orders: HashMap<(&str, u32), Vec<&str>> = HashMap::new();
        for action in model.actions.iter().filter(|a| a.mode == ActionMode::Sequential) {
            orders
                .entry((action.node_id.as_str(), action.execution_order))
                .or_default()
                .push(action.id.as_str());
        }
        let mut duplicates: Vec<_> = orders.into_iter().filter(|(_, ids)| ids.len() > 1).collect();
        duplicates.sort();
        for ((node, order), ids) in duplicates {
            report.error(
                ValidationIssue::new(
                    "DUPLICATE_EXECUTION_ORDER",
                    format!(
                        "Sequential actions {} share execution order {} in node '{}'",
                        ids.join(", "),
                        order,
                        node
                    ),
                )
                .on(node),
            );
        }

        for node in model.nodes.iter().filter(|n| n.kind == NodeKind::Stage) {
            if !model.actions_of(&node.id).any(|a| a.is_active()) {
                report.warn(
                    ValidationIssue::new(
                        "EMPTY_STAGE",
                        format!("Stage '{}' has no active actions", node.name),
                    )
                    .on(&node.id),
                );
            }
        }

        Ok(report)
    }
}

fn check_tether(
    cfg: &TetherConfig,
    re: &Regex,
    action: &tessera_core::types::ActionId,
    report: &mut PassReport,
) {
    match re.captures(cfg.endpoint.trim()) {
        None => report.error(
            ValidationIssue::new(
                "INVALID_ENDPOINT",
                format!("Endpoint '{}' is not an http(s) URL", cfg.endpoint),
            )
            .on(action),
        ),
        Some(caps) => {
            let host = caps.name("host").map(|h| h.as_str()).unwrap_or_default();
            if matches!(host, "localhost" | "127.0.0.1" | "[::1]" | "0.0.0.0") {
                report.warn(
                    ValidationIssue::new(
                        "LOCAL_ENDPOINT",
                        format!("Endpoint '{}' is only reachable from this machine", cfg.endpoint),
                    )
                    .on(action),
                );
            }
        }
    }

    if !METHODS.contains(&cfg.method.to_ascii_uppercase().as_str()) {
        report.error(
            ValidationIssue::new("INVALID_METHOD", format!("Unsupported HTTP method '{}'", cfg.method))
                .on(action),
        );
    }
    if cfg.timeout_ms == Some(0) {
        report.error(ValidationIssue::new("INVALID_TIMEOUT", "Tether timeout must be positive").on(action));
    }
}
