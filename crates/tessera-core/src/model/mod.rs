//! Graph model — function models, container nodes, action nodes, links, agents.
//!
//! A `FunctionModel` owns an ordered set of container `Node`s and the
//! `ActionNode`s they hold. Node dependency lists define the partial order
//! the engine executes in; action execution order and mode define the
//! sequencing inside one container.

pub mod action;
pub mod agent;
pub mod function_model;
pub mod link;
pub mod node;
pub mod recovery;

pub use action::{
    ActionKind, ActionMode, ActionNode, ActionStatus, AgentTaskConfig, KnowledgeBaseConfig,
    NestedModelConfig, Raci, RetryPolicy, TetherAuth, TetherConfig,
};
pub use agent::{AiAgent, ExecutionStats};
pub use function_model::{FunctionModel, ModelStatus, Permissions};
pub use link::{CrossFeatureLink, FeatureRef, FeatureType, LinkType, NodeLinkContext};
pub use node::{ContextBinding, IoDirection, Node, NodeKind, NodeStatus, Position, ValueType};
pub use recovery::{match_policy, RecoveryAction, RecoveryPolicy};
