//! Execution engine for function models.
//!
//! [`FunctionModelService`] is the entry point: it authors and publishes
//! models and hands published ones to the [`WorkflowOrchestrator`], which
//! schedules container nodes in dependency order, runs their action nodes
//! through the [`ActionExecutionService`], and routes terminal failures
//! through the model's recovery policies. Nested-model actions recurse into
//! the orchestrator with their own context tree.

pub mod action_service;
pub mod context;
pub mod fractal;
pub mod handlers;
pub mod orchestrator;
pub mod plan;
pub mod recovery;
pub mod retry;
pub mod service;
pub mod validation;

pub use action_service::{ActionExecutionService, ActionOutcome};
pub use context::{ContextTree, ScopeId};
pub use fractal::NestingGuard;
pub use handlers::{HandlerSet, HttpTetherHandler, UnconfiguredHandler};
pub use orchestrator::{
    ActionRecord, ActionRunStatus, ExecutionRecord, NodeRecord, NodeRunStatus, WorkflowOrchestrator,
};
pub use plan::ExecutionPlan;
pub use recovery::{RecoveryDecision, RecoveryRecord};
pub use retry::{run_with_retry, AttemptResult, RetryOutcome};
pub use service::{FunctionModelService, Stores};
pub use validation::ValidationService;
