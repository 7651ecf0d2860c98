use serde::Serialize;

use tessera_core::audit::ops;
use tessera_core::error::{ActionFailure, ErrorType};
use tessera_core::model::{match_policy, ActionKind, ActionNode, RecoveryAction, RecoveryPolicy, RetryPolicy};
use tessera_core::traits::ActionOutput;
use tessera_core::types::{ActionId, AgentId, LinkId, NodeId};

/// What to do about an action that exhausted its own retries.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryDecision {
    /// Re-run with this policy.
    Retry { policy: RetryPolicy },
    /// Scale the run down to one node at a time, then re-run.
    ScaleDownAndRetry { policy: RetryPolicy },
    FallbackAgent { original: AgentId, fallback: AgentId },
    IsolateAndContinue,
    DegradeGracefully { output: ActionOutput },
    Propagate { link_id: LinkId },
    EmergencyShutdown,
    /// No usable policy; the failure is fatal for the run.
    Unhandled { reason: String },
}

impl RecoveryDecision {
    pub fn kind(&self) -> Option<RecoveryAction> {
        Some(match self {
            Self::Retry { .. } => RecoveryAction::Retry,
            Self::ScaleDownAndRetry { .. } => RecoveryAction::ScaleDownAndRetry,
            Self::FallbackAgent { .. } => RecoveryAction::FallbackAgent,
            Self::IsolateAndContinue => RecoveryAction::IsolateAndContinue,
            Self::DegradeGracefully { .. } => RecoveryAction::DegradeGracefully,
            Self::Propagate { .. } => RecoveryAction::PropagateCrossFeature,
            Self::EmergencyShutdown => RecoveryAction::EmergencyShutdown,
            Self::Unhandled { .. } => return None,
        })
    }

    /// Audit operation tag recorded for this decision.
    pub fn audit_op(&self) -> &'static str {
        match self {
            Self::Retry { .. } => ops::RECOVERY_RETRY,
            Self::ScaleDownAndRetry { .. } => ops::RECOVERY_SCALE_DOWN,
            Self::FallbackAgent { .. } => ops::RECOVERY_FALLBACK_AGENT,
            Self::IsolateAndContinue => ops::RECOVERY_ISOLATE,
            Self::DegradeGracefully { .. } => ops::RECOVERY_DEGRADE,
            Self::Propagate { .. } => ops::RECOVERY_PROPAGATE,
            Self::EmergencyShutdown => ops::RECOVERY_SHUTDOWN,
            Self::Unhandled { .. } => ops::RECOVERY_UNHANDLED,
        }
    }
}

/// Match `failure` against the model's policies (first match wins) and
/// resolve the matched policy into a decision for `action`.
///
/// `own_retry` is the action's effective retry policy; retry decisions keep
/// its backoff and take the policy's attempt budget when one is set.
pub fn decide(
    policies: &[RecoveryPolicy],
    action: &ActionNode,
    own_retry: &RetryPolicy,
    failure: &ActionFailure,
) -> RecoveryDecision {
    let Some(policy) = match_policy(policies, failure.error_type) else {
        return RecoveryDecision::Unhandled {
            reason: format!("no recovery policy for {} failures", failure.error_type),
        };
    };
    if let Some(problem) = policy.configuration_problem() {
        return RecoveryDecision::Unhandled { reason: problem };
    }

    let merged = || own_retry.with_max_attempts(policy.max_attempts.unwrap_or(own_retry.max_attempts).max(1));

    match policy.action {
        RecoveryAction::Retry => RecoveryDecision::Retry { policy: merged() },
        RecoveryAction::ScaleDownAndRetry => RecoveryDecision::ScaleDownAndRetry { policy: merged() },
        RecoveryAction::FallbackAgent => {
            let (ActionKind::AiAgent(cfg), Some(fallback)) = (&action.kind, &policy.fallback_agent) else {
                return RecoveryDecision::Unhandled {
                    reason: format!("action '{}' has no agent to fall back from", action.id),
                };
            };
            if &cfg.agent_id == fallback {
                return RecoveryDecision::Unhandled {
                    reason: format!("fallback agent '{}' is the failing agent", fallback),
                };
            }
            RecoveryDecision::FallbackAgent {
                original: cfg.agent_id.clone(),
                fallback: fallback.clone(),
            }
        }
        RecoveryAction::IsolateAndContinue => RecoveryDecision::IsolateAndContinue,
        RecoveryAction::DegradeGracefully => RecoveryDecision::DegradeGracefully {
            output: policy
                .default_output
                .clone()
                .map(ActionOutput::from_value)
                .unwrap_or_default(),
        },
        RecoveryAction::PropagateCrossFeature => match &policy.link_id {
            Some(link_id) => RecoveryDecision::Propagate {
                link_id: link_id.clone(),
            },
            None => RecoveryDecision::Unhandled {
                reason: "propagation policy has no link".into(),
            },
        },
        RecoveryAction::EmergencyShutdown => RecoveryDecision::EmergencyShutdown,
    }
}

/// Copy of `action` delegating to `agent` instead.
pub fn with_agent(action: &ActionNode, agent: &AgentId) -> ActionNode {
    let mut action = action.clone();
    if let ActionKind::AiAgent(cfg) = &mut action.kind {
        cfg.agent_id = agent.clone();
    }
    action
}

/// One entry of a run's recovery trail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryRecord {
    pub action_id: ActionId,
    pub node_id: NodeId,
    pub error_type: ErrorType,
    pub error: String,
    /// `None` when no policy applied.
    pub recovery: Option<RecoveryAction>,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub detail: serde_json::Value,
}
