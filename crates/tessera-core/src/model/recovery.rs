use serde::{Deserialize, Serialize};

use crate::error::ErrorType;
use crate::types::{AgentId, LinkId};

/// What the recovery engine does for a matched failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    FallbackAgent,
    IsolateAndContinue,
    DegradeGracefully,
    PropagateCrossFeature,
    EmergencyShutdown,
    ScaleDownAndRetry,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::FallbackAgent => "fallback_agent",
            Self::IsolateAndContinue => "isolate_and_continue",
            Self::DegradeGracefully => "degrade_gracefully",
            Self::PropagateCrossFeature => "propagate_cross_feature",
            Self::EmergencyShutdown => "emergency_shutdown",
            Self::ScaleDownAndRetry => "scale_down_and_retry",
        }
    }

    /// Actions that leave the run's own boundary.
    pub fn escalates(&self) -> bool {
        matches!(self, Self::PropagateCrossFeature | Self::EmergencyShutdown)
    }
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error-type to recovery-action mapping. First match wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPolicy {
    pub error_type: ErrorType,
    pub action: RecoveryAction,
    /// Attempt budget for `retry` / `scale_down_and_retry`.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Alternate agent for `fallback_agent`.
    #[serde(default)]
    pub fallback_agent: Option<AgentId>,
    /// Link to forward the error across for `propagate_cross_feature`.
    #[serde(default)]
    pub link_id: Option<LinkId>,
    /// Output substituted for `degrade_gracefully`.
    #[serde(default)]
    pub default_output: Option<serde_json::Value>,
}

impl RecoveryPolicy {
    pub fn new(error_type: ErrorType, action: RecoveryAction) -> Self {
        Self {
            error_type,
            action,
            max_attempts: None,
            fallback_agent: None,
            link_id: None,
            default_output: None,
        }
    }

    pub fn retry(error_type: ErrorType, max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Self::new(error_type, RecoveryAction::Retry)
        }
    }

    pub fn fallback(error_type: ErrorType, agent: impl Into<AgentId>) -> Self {
        Self {
            fallback_agent: Some(agent.into()),
            ..Self::new(error_type, RecoveryAction::FallbackAgent)
        }
    }

    pub fn propagate(error_type: ErrorType, link: impl Into<LinkId>) -> Self {
        Self {
            link_id: Some(link.into()),
            ..Self::new(error_type, RecoveryAction::PropagateCrossFeature)
        }
    }

    pub fn degrade(error_type: ErrorType, default_output: serde_json::Value) -> Self {
        Self {
            default_output: Some(default_output),
            ..Self::new(error_type, RecoveryAction::DegradeGracefully)
        }
    }

    /// Problems that make this policy unusable, if any.
    pub fn configuration_problem(&self) -> Option<String> {
        match self.action {
            RecoveryAction::FallbackAgent if self.fallback_agent.is_none() => {
                Some("fallback_agent policy has no fallback agent".into())
            }
            RecoveryAction::PropagateCrossFeature if self.link_id.is_none() => {
                Some("propagate_cross_feature policy has no link".into())
            }
            RecoveryAction::Retry | RecoveryAction::ScaleDownAndRetry
                if self.max_attempts == Some(0) =>
            {
                Some(format!("{} policy has zero attempts", self.action))
            }
            _ => None,
        }
    }
}

/// Find the first policy matching `error_type`.
pub fn match_policy(policies: &[RecoveryPolicy], error_type: ErrorType) -> Option<&RecoveryPolicy> {
    policies.iter().find(|p| p.error_type == error_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_match_wins() {
        let policies = vec![
            RecoveryPolicy::retry(ErrorType::Timeout, 2),
            RecoveryPolicy::new(ErrorType::Timeout, RecoveryAction::EmergencyShutdown),
            RecoveryPolicy::fallback(ErrorType::AgentFailure, "backup"),
        ];
        let matched = match_policy(&policies, ErrorType::Timeout).unwrap();
        assert_eq!(matched.action, RecoveryAction::Retry);
        assert!(match_policy(&policies, ErrorType::CascadeFailure).is_none());
    }

    #[test]
    fn configuration_problems() {
        let mut p = RecoveryPolicy::new(ErrorType::AgentFailure, RecoveryAction::FallbackAgent);
        assert!(p.configuration_problem().is_some());
        p.fallback_agent = Some(AgentId::from("b"));
        assert!(p.configuration_problem().is_none());
        assert!(RecoveryPolicy::retry(ErrorType::Timeout, 0)
            .configuration_problem()
            .is_some());
    }

    #[test]
    fn escalation_flags() {
        assert!(RecoveryAction::EmergencyShutdown.escalates());
        assert!(RecoveryAction::PropagateCrossFeature.escalates());
        assert!(!RecoveryAction::IsolateAndContinue.escalates());
    }
}
