use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::node::ContextBinding;
use crate::types::{ActionId, AgentId, ModelId, NodeId};

/// Retry policy attached to an action node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound on a single delay.
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

fn default_max_attempts() -> u32 { 3 }
fn default_base_delay() -> u64 { 1000 }
fn default_backoff_multiplier() -> f64 { 2.0 }

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: None,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            backoff_multiplier: 1.0,
            max_delay_ms: None,
        }
    }

    /// Delay before retry number `attempt` (0-based):
    /// `base_delay * backoff_multiplier^attempt`, capped by `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(0.0).powi(attempt as i32);
        let mut ms = (self.base_delay_ms as f64 * factor).round();
        if let Some(cap) = self.max_delay_ms {
            ms = ms.min(cap as f64);
        }
        Duration::from_millis(ms.max(0.0) as u64)
    }

    /// Same policy with a different attempt budget.
    pub fn with_max_attempts(&self, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..self.clone()
        }
    }
}

/// Whether an action runs in strict order or alongside siblings with the same order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionMode {
    #[default]
    Sequential,
    Parallel,
}

/// Lifecycle status of an action node definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    #[default]
    Active,
    Inactive,
    Draft,
}

/// Responsibility assignment for an action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Raci {
    #[serde(default)]
    pub responsible: Vec<String>,
    #[serde(default)]
    pub accountable: Vec<String>,
    #[serde(default)]
    pub consulted: Vec<String>,
    #[serde(default)]
    pub informed: Vec<String>,
}

impl Raci {
    pub fn responsible(who: impl Into<String>) -> Self {
        Self {
            responsible: vec![who.into()],
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.responsible.is_empty()
            && self.accountable.is_empty()
            && self.consulted.is_empty()
            && self.informed.is_empty()
    }
}

/// Credentials reference for an external integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TetherAuth {
    Bearer { token_ref: String },
    ApiKey { header: String, key_ref: String },
    Basic { username: String, password_ref: String },
}

/// External-call configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TetherConfig {
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub requires_auth: bool,
    #[serde(default)]
    pub auth: Option<TetherAuth>,
    /// Per-call timeout, overriding the engine default.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_method() -> String {
    "POST".to_string()
}

/// Knowledge-base lookup configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBaseConfig {
    pub knowledge_base_id: String,
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_top_k() -> usize {
    5
}

/// AI-agent task configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTaskConfig {
    pub agent_id: AgentId,
    pub task: String,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

/// Reference to a nested function model plus its context mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedModelConfig {
    pub model_id: ModelId,
    /// Parent context key -> child input key.
    #[serde(default)]
    pub input_mapping: BTreeMap<String, String>,
    /// Child output key -> parent context key.
    #[serde(default)]
    pub output_mapping: BTreeMap<String, String>,
}

/// Declared action type with its type-specific configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    Tether(TetherConfig),
    KnowledgeBase(KnowledgeBaseConfig),
    AiAgent(AgentTaskConfig),
    FunctionModel(NestedModelConfig),
}

impl ActionKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tether(_) => "tether",
            Self::KnowledgeBase(_) => "knowledge_base",
            Self::AiAgent(_) => "ai_agent",
            Self::FunctionModel(_) => "function_model",
        }
    }

    pub fn agent_id(&self) -> Option<&AgentId> {
        match self {
            Self::AiAgent(cfg) => Some(&cfg.agent_id),
            _ => None,
        }
    }

    pub fn nested_model(&self) -> Option<&NestedModelConfig> {
        match self {
            Self::FunctionModel(cfg) => Some(cfg),
            _ => None,
        }
    }
}

/// A unit of executable work owned by a container node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionNode {
    pub id: ActionId,
    /// Owning container node.
    pub node_id: NodeId,
    pub name: String,
    pub kind: ActionKind,
    #[serde(default)]
    pub execution_order: u32,
    #[serde(default)]
    pub mode: ActionMode,
    #[serde(default)]
    pub status: ActionStatus,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub raci: Raci,
    /// Critical actions must carry a retry or recovery policy.
    #[serde(default)]
    pub critical: bool,
    /// Context keys this action reads.
    #[serde(default)]
    pub inputs: Vec<ContextBinding>,
    /// Context keys this action writes.
    #[serde(default)]
    pub outputs: Vec<ContextBinding>,
}

impl ActionNode {
    pub fn new(
        id: impl Into<ActionId>,
        node_id: impl Into<NodeId>,
        name: impl Into<String>,
        kind: ActionKind,
    ) -> Self {
        Self {
            id: id.into(),
            node_id: node_id.into(),
            name: name.into(),
            kind,
            execution_order: 0,
            mode: ActionMode::Sequential,
            status: ActionStatus::Active,
            retry: None,
            raci: Raci::default(),
            critical: false,
            inputs: vec![],
            outputs: vec![],
        }
    }

    pub fn tether(
        id: impl Into<ActionId>,
        node_id: impl Into<NodeId>,
        endpoint: impl Into<String>,
    ) -> Self {
        let id = id.into();
        let name = format!("tether {}", id);
        Self::new(
            id,
            node_id,
            name,
            ActionKind::Tether(TetherConfig {
                endpoint: endpoint.into(),
                method: default_method(),
                ..TetherConfig::default()
            }),
        )
    }

    pub fn agent_task(
        id: impl Into<ActionId>,
        node_id: impl Into<NodeId>,
        agent_id: impl Into<AgentId>,
        task: impl Into<String>,
    ) -> Self {
        let id = id.into();
        let name = format!("agent {}", id);
        Self::new(
            id,
            node_id,
            name,
            ActionKind::AiAgent(AgentTaskConfig {
                agent_id: agent_id.into(),
                task: task.into(),
                required_capabilities: vec![],
            }),
        )
    }

    pub fn nested(
        id: impl Into<ActionId>,
        node_id: impl Into<NodeId>,
        config: NestedModelConfig,
    ) -> Self {
        let id = id.into();
        let name = format!("nested {}", config.model_id);
        Self::new(id, node_id, name, ActionKind::FunctionModel(config))
    }

    pub fn with_order(mut self, order: u32) -> Self {
        self.execution_order = order;
        self
    }

    pub fn with_mode(mut self, mode: ActionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_inputs(mut self, inputs: Vec<ContextBinding>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<ContextBinding>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_raci(mut self, raci: Raci) -> Self {
        self.raci = raci;
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == ActionStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delays() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: None,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_cap() {
        let policy = RetryPolicy {
            max_delay_ms: Some(250),
            base_delay_ms: 100,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(5), Duration::from_millis(250));
    }

    #[test]
    fn test_kind_tagging() {
        let action = ActionNode::nested(
            "a1",
            "stage",
            NestedModelConfig {
                model_id: ModelId::from("child"),
                input_mapping: BTreeMap::from([("x".to_string(), "in_x".to_string())]),
                output_mapping: BTreeMap::new(),
            },
        );
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["kind"]["type"], "function_model");
        assert_eq!(json["kind"]["model_id"], "child");
        assert_eq!(action.kind.label(), "function_model");
        assert!(action.kind.nested_model().is_some());
    }

    #[test]
    fn test_agent_accessor() {
        let action = ActionNode::agent_task("a1", "s", "agent-7", "summarize");
        assert_eq!(action.kind.agent_id(), Some(&AgentId::from("agent-7")));
        assert!(ActionNode::tether("t", "s", "https://x").kind.agent_id().is_none());
    }
}
