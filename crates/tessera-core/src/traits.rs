use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::audit::{AuditEntry, AuditQuery};
use crate::error::{ActionFailure, Result};
use crate::model::{ActionNode, AiAgent, CrossFeatureLink, ExecutionStats, FeatureRef, FunctionModel};
use crate::types::{AgentId, ExecutionId, LinkId, ModelId};

/// Model persistence — the engine reads graph models through this.
pub trait ModelRepository: Send + Sync + 'static {
    fn find_by_id<'a>(&'a self, id: &'a ModelId) -> BoxFuture<'a, Result<Option<FunctionModel>>>;

    fn save(&self, model: FunctionModel) -> BoxFuture<'_, Result<()>>;

    fn delete<'a>(&'a self, id: &'a ModelId) -> BoxFuture<'a, Result<bool>>;

    fn list(&self) -> BoxFuture<'_, Result<Vec<FunctionModel>>>;
}

/// Cross-feature link persistence.
pub trait LinkRepository: Send + Sync + 'static {
    fn find_by_id<'a>(&'a self, id: &'a LinkId) -> BoxFuture<'a, Result<Option<CrossFeatureLink>>>;

    fn save(&self, link: CrossFeatureLink) -> BoxFuture<'_, Result<()>>;

    fn delete<'a>(&'a self, id: &'a LinkId) -> BoxFuture<'a, Result<bool>>;

    fn find_all(&self) -> BoxFuture<'_, Result<Vec<CrossFeatureLink>>>;

    /// Links whose source or target is `entity`.
    fn find_by_entity<'a>(
        &'a self,
        entity: &'a FeatureRef,
    ) -> BoxFuture<'a, Result<Vec<CrossFeatureLink>>>;
}

/// Append-only audit log sink.
pub trait AuditSink: Send + Sync + 'static {
    fn save(&self, entry: AuditEntry) -> BoxFuture<'_, Result<()>>;

    fn query(&self, query: AuditQuery) -> BoxFuture<'_, Result<Vec<AuditEntry>>>;
}

/// AI-agent registry — capability lookup and execution statistics.
pub trait AgentRegistry: Send + Sync + 'static {
    fn find<'a>(&'a self, id: &'a AgentId) -> BoxFuture<'a, Result<Option<AiAgent>>>;

    fn register(&self, agent: AiAgent) -> BoxFuture<'_, Result<()>>;

    /// Fold one execution outcome into the agent's statistics.
    fn record_execution<'a>(
        &'a self,
        id: &'a AgentId,
        success: bool,
        duration_ms: u64,
    ) -> BoxFuture<'a, Result<ExecutionStats>>;

    /// Enabled agents ranked best-first for the required capabilities.
    fn discover<'a>(
        &'a self,
        required_capabilities: &'a [String],
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<AiAgent>>>;
}

/// Everything a handler needs to run one attempt of an action.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub execution_id: ExecutionId,
    pub model_id: ModelId,
    pub action: ActionNode,
    /// Values for the action's declared inputs, resolved from the context.
    pub inputs: serde_json::Map<String, serde_json::Value>,
    /// 0-based attempt number.
    pub attempt: u32,
}

/// Values an action produced, keyed by output name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionOutput {
    pub values: serde_json::Map<String, serde_json::Value>,
}

impl ActionOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_value(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(values) => Self { values },
            other => {
                let mut values = serde_json::Map::new();
                values.insert("result".into(), other);
                Self { values }
            }
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }
}

/// Executes one attempt of one action type (tether, knowledge base, AI agent).
pub trait ActionHandler: Send + Sync + 'static {
    /// Handler name for logs.
    fn name(&self) -> &str;

    fn execute(
        &self,
        request: ActionRequest,
    ) -> BoxFuture<'_, std::result::Result<ActionOutput, ActionFailure>>;
}
