use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::error::ErrorType;
use crate::model::{FeatureRef, LinkType};
use crate::types::{
    ActionId, AgentId, ExecutionId, ExecutionState, LinkId, ModelId, NodeId, RunMode, UserId,
};

/// Domain event broadcast to all subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum DomainEvent {
    /// A draft model was created.
    FunctionModelCreated { model_id: ModelId, name: String, user_id: UserId },
    /// A container node was added to a draft.
    ContainerNodeAdded { model_id: ModelId, node_id: NodeId, node_type: String },
    /// A container node (and its actions) was removed.
    ContainerNodeRemoved { model_id: ModelId, node_id: NodeId },
    /// An action node was added under a container.
    ActionNodeAdded {
        model_id: ModelId,
        node_id: NodeId,
        action_id: ActionId,
        action_type: String,
    },
    /// An action node was removed.
    ActionNodeRemoved { model_id: ModelId, action_id: ActionId },
    /// A model passed the publish gate.
    FunctionModelPublished { model_id: ModelId, version: String },
    /// A model was archived.
    FunctionModelArchived { model_id: ModelId },
    /// A new draft version was derived from a published model.
    FunctionModelVersionCreated {
        model_id: ModelId,
        previous_model_id: ModelId,
        version: String,
    },
    /// A model was soft-deleted.
    FunctionModelDeleted { model_id: ModelId },
    /// A validation run finished.
    ValidationCompleted {
        model_id: ModelId,
        level: String,
        valid: bool,
        error_count: usize,
        warning_count: usize,
    },
    /// A run (top-level or nested) started.
    ExecutionStarted {
        execution_id: ExecutionId,
        model_id: ModelId,
        mode: RunMode,
        depth: usize,
    },
    /// A nested model invocation started under a parent run.
    NestedExecutionStarted {
        execution_id: ExecutionId,
        parent_execution_id: ExecutionId,
        model_id: ModelId,
        depth: usize,
    },
    /// A container node reached a terminal status.
    NodeExecutionCompleted {
        execution_id: ExecutionId,
        node_id: NodeId,
        status: String,
    },
    /// An action node reached a terminal status.
    ActionNodeExecuted {
        execution_id: ExecutionId,
        action_id: ActionId,
        success: bool,
        attempts: u32,
        duration_ms: u64,
    },
    /// The recovery-policy engine was consulted for a failed action.
    ErrorHandlingTriggered {
        execution_id: ExecutionId,
        action_id: ActionId,
        error_type: ErrorType,
        recovery_action: Option<String>,
    },
    /// A failing agent task was re-run on a fallback agent.
    #[serde(rename = "AIAgentFallbackTriggered")]
    AiAgentFallbackTriggered {
        execution_id: ExecutionId,
        action_id: ActionId,
        original_agent: AgentId,
        fallback_agent: AgentId,
    },
    /// An execution error was forwarded across a cross-feature link.
    ErrorPropagated {
        execution_id: ExecutionId,
        link_id: LinkId,
        source: FeatureRef,
        target: FeatureRef,
        error: String,
    },
    /// A run was aborted by an emergency shutdown.
    EmergencyShutdown { execution_id: ExecutionId, reason: String },
    /// A run reached its terminal state.
    FunctionModelExecuted {
        execution_id: ExecutionId,
        model_id: ModelId,
        state: ExecutionState,
        duration_ms: u64,
    },
    /// Agent statistics were updated after an execution.
    AgentExecutionRecorded {
        agent_id: AgentId,
        success: bool,
        duration_ms: u64,
    },
    /// A cross-feature link was created.
    CrossFeatureLinkCreated {
        link_id: LinkId,
        source: FeatureRef,
        target: FeatureRef,
        link_type: LinkType,
    },
    /// A cross-feature link was deleted.
    CrossFeatureLinkDeleted { link_id: LinkId },
    /// Cycle analysis over the link graph finished.
    CyclesDetected {
        total_cycles: usize,
        average_cycle_length: f64,
        max_strength_product: f64,
        warnings: Vec<String>,
    },
    /// A link's strength was recomputed and persisted.
    LinkStrengthUpdated {
        link_id: LinkId,
        previous_strength: f64,
        new_strength: f64,
    },
}

impl DomainEvent {
    /// Stable event name used for subscriptions and audit records.
    pub fn name(&self) -> &'static str {
        match self {
            Self::FunctionModelCreated { .. } => "FunctionModelCreated",
            Self::ContainerNodeAdded { .. } => "ContainerNodeAdded",
            Self::ContainerNodeRemoved { .. } => "ContainerNodeRemoved",
            Self::ActionNodeAdded { .. } => "ActionNodeAdded",
            Self::ActionNodeRemoved { .. } => "ActionNodeRemoved",
            Self::FunctionModelPublished { .. } => "FunctionModelPublished",
            Self::FunctionModelArchived { .. } => "FunctionModelArchived",
            Self::FunctionModelVersionCreated { .. } => "FunctionModelVersionCreated",
            Self::FunctionModelDeleted { .. } => "FunctionModelDeleted",
            Self::ValidationCompleted { .. } => "ValidationCompleted",
            Self::ExecutionStarted { .. } => "ExecutionStarted",
            Self::NestedExecutionStarted { .. } => "NestedExecutionStarted",
            Self::NodeExecutionCompleted { .. } => "NodeExecutionCompleted",
            Self::ActionNodeExecuted { .. } => "ActionNodeExecuted",
            Self::ErrorHandlingTriggered { .. } => "ErrorHandlingTriggered",
            Self::AiAgentFallbackTriggered { .. } => "AIAgentFallbackTriggered",
            Self::ErrorPropagated { .. } => "ErrorPropagated",
            Self::EmergencyShutdown { .. } => "EmergencyShutdown",
            Self::FunctionModelExecuted { .. } => "FunctionModelExecuted",
            Self::AgentExecutionRecorded { .. } => "AgentExecutionRecorded",
            Self::CrossFeatureLinkCreated { .. } => "CrossFeatureLinkCreated",
            Self::CrossFeatureLinkDeleted { .. } => "CrossFeatureLinkDeleted",
            Self::CyclesDetected { .. } => "CyclesDetected",
            Self::LinkStrengthUpdated { .. } => "LinkStrengthUpdated",
        }
    }
}

type Handler = Arc<dyn Fn(&DomainEvent) + Send + Sync>;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events; named handlers receive only their event type.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<DomainEvent>,
    handlers: RwLock<Vec<(String, Handler)>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self {
            tx,
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn publish(&self, event: DomainEvent) {
        if let Ok(handlers) = self.handlers.read() {
            for (name, handler) in handlers.iter() {
                if name == "*" || name == event.name() {
                    handler(&event);
                }
            }
        }
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }

    /// Register a handler for one event name (`"*"` matches every event).
    pub fn subscribe_to<F>(&self, event_name: impl Into<String>, handler: F)
    where
        F: Fn(&DomainEvent) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.push((event_name.into(), Arc::new(handler)));
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
