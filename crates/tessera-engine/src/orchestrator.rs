use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tessera_core::audit::{ops, AuditEntry};
use tessera_core::config::ExecutionConfig;
use tessera_core::error::{ActionFailure, Result, TesseraError};
use tessera_core::event::{DomainEvent, EventBus};
use tessera_core::model::{
    ActionKind, ActionNode, FeatureRef, FunctionModel, ModelStatus, Node, RecoveryAction,
};
use tessera_core::traits::{
    ActionOutput, ActionRequest, AuditSink, LinkRepository, ModelRepository,
};
use tessera_core::types::{
    ActionId, AgentId, ExecutionId, ExecutionState, ModelId, NodeId, RunMode, UserId,
};

use crate::action_service::{ActionExecutionService, ActionOutcome};
use crate::context::{ContextTree, ScopeId};
use crate::fractal::{map_inputs, NestingGuard};
use crate::plan::ExecutionPlan;
use crate::recovery::{self, RecoveryDecision, RecoveryRecord};
use crate::retry::AttemptResult;

/// Terminal status of a container node within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    Completed,
    /// Completed, with at least one action replaced by its default output.
    Degraded,
    /// Stopped by `isolate_and_continue`; dependents are skipped.
    Isolated,
    /// Not run because a dependency did not complete.
    Skipped,
    Cancelled,
    Failed,
}

impl NodeRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Degraded => "degraded",
            Self::Isolated => "isolated",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    fn blocks_dependents(&self) -> bool {
        !matches!(self, Self::Completed | Self::Degraded)
    }

    fn stops_node(&self) -> bool {
        matches!(self, Self::Isolated | Self::Cancelled | Self::Failed)
    }
}

/// Terminal status of one action within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionRunStatus {
    Succeeded,
    /// Succeeded after a `retry` or `scale_down_and_retry` recovery.
    Recovered,
    /// Succeeded on a fallback agent.
    FellBack,
    Degraded,
    Isolated,
    Failed,
    Cancelled,
}

impl ActionRunStatus {
    fn node_status(&self) -> NodeRunStatus {
        match self {
            Self::Succeeded | Self::Recovered | Self::FellBack => NodeRunStatus::Completed,
            Self::Degraded => NodeRunStatus::Degraded,
            Self::Isolated => NodeRunStatus::Isolated,
            Self::Failed => NodeRunStatus::Failed,
            Self::Cancelled => NodeRunStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub status: NodeRunStatus,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    pub action_id: ActionId,
    pub node_id: NodeId,
    pub action_type: &'static str,
    pub status: ActionRunStatus,
    pub attempts: u32,
    pub duration_ms: u64,
    /// Agent that produced the result, for agent tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Structured terminal result of a run. Failed runs are reported here,
/// not as errors.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub model_id: ModelId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<ExecutionId>,
    pub depth: usize,
    pub mode: RunMode,
    pub state: ExecutionState,
    /// Output-boundary fields collected at the end of the run.
    pub outputs: Map<String, Value>,
    /// Bindings each node wrote into its own scope.
    pub stage_outputs: HashMap<NodeId, Map<String, Value>>,
    pub nodes: Vec<NodeRecord>,
    pub actions: Vec<ActionRecord>,
    pub recoveries: Vec<RecoveryRecord>,
    /// Nested runs started by this run, in start order.
    pub children: Vec<ExecutionRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ExecutionRecord {
    pub fn node(&self, id: &str) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.node_id.as_str() == id)
    }

    pub fn action(&self, id: &str) -> Option<&ActionRecord> {
        self.actions.iter().rev().find(|a| a.action_id.as_str() == id)
    }
}

/// Everything needed to start one run.
pub(crate) struct RunParams {
    pub model: FunctionModel,
    pub plan: ExecutionPlan,
    pub mode: RunMode,
    pub input: Map<String, Value>,
    pub user: UserId,
    pub guard: NestingGuard,
    pub parent: Option<ExecutionId>,
    pub cancel: CancellationToken,
}

#[derive(Default)]
pub(crate) struct Progress {
    state: Option<ExecutionState>,
    error: Option<String>,
    /// Set by `scale_down_and_retry`.
    scaled_down: bool,
    status: HashMap<NodeId, NodeRunStatus>,
    scopes: HashMap<NodeId, ScopeId>,
    nodes: Vec<NodeRecord>,
    actions: Vec<ActionRecord>,
    recoveries: Vec<RecoveryRecord>,
    pub(crate) children: Vec<ExecutionRecord>,
}

/// Shared state of one in-flight run.
pub(crate) struct Run {
    pub(crate) id: ExecutionId,
    pub(crate) model: FunctionModel,
    pub(crate) plan: ExecutionPlan,
    pub(crate) mode: RunMode,
    pub(crate) user: UserId,
    pub(crate) guard: NestingGuard,
    pub(crate) parent: Option<ExecutionId>,
    pub(crate) cancel: CancellationToken,
    context: ContextTree,
    progress: Mutex<Progress>,
}

impl Run {
    pub(crate) fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn node_limit(&self, max_parallel: usize) -> usize {
        match self.mode {
            RunMode::Sequential => 1,
            RunMode::Parallel => usize::MAX,
            RunMode::AdaptiveParallel if self.progress().scaled_down => 1,
            RunMode::AdaptiveParallel => max_parallel.max(1),
        }
    }

    /// Parallel action batches run one at a time after a scale-down.
    fn sequential_actions(&self) -> bool {
        self.mode == RunMode::AdaptiveParallel && self.progress().scaled_down
    }

    fn escalate(&self, state: ExecutionState) {
        let mut progress = self.progress();
        progress.state = Some(progress.state.map_or(state, |s| s.escalate(state)));
    }

    /// Record a terminal failure and cancel everything still running.
    /// The first error message wins.
    fn abort(&self, state: ExecutionState, message: impl Into<String>) {
        {
            let mut progress = self.progress();
            progress.state = Some(progress.state.map_or(state, |s| s.escalate(state)));
            if progress.error.is_none() {
                progress.error = Some(message.into());
            }
        }
        self.cancel.cancel();
    }

    /// Pull runnable nodes off `pending` (kept in topological order) up to
    /// `capacity`. Nodes behind a blocking dependency are marked skipped
    /// and returned separately.
    fn take_ready(&self, pending: &mut Vec<NodeId>, capacity: usize) -> (Vec<NodeId>, Vec<NodeId>) {
        let mut progress = self.progress();
        let mut ready = Vec::new();
        let mut skipped = Vec::new();
        let mut i = 0;
        while i < pending.len() {
            let statuses: Option<Vec<NodeRunStatus>> = self
                .plan
                .dependencies(&pending[i])
                .iter()
                .map(|d| progress.status.get(d).copied())
                .collect();
            match statuses {
                None => i += 1,
                Some(s) if s.iter().any(|st| st.blocks_dependents()) => {
                    let id = pending.remove(i);
                    progress.status.insert(id.clone(), NodeRunStatus::Skipped);
                    progress.nodes.push(NodeRecord {
                        node_id: id.clone(),
                        status: NodeRunStatus::Skipped,
                        duration_ms: 0,
                    });
                    skipped.push(id);
                }
                Some(_) if ready.len() < capacity => ready.push(pending.remove(i)),
                Some(_) => i += 1,
            }
        }
        (ready, skipped)
    }
}

/// Top-level executor: runs published models node by node in dependency
/// order and routes action failures through the model's recovery policies.
pub struct WorkflowOrchestrator {
    models: Arc<dyn ModelRepository>,
    links: Arc<dyn LinkRepository>,
    audit: Arc<dyn AuditSink>,
    event_bus: Arc<EventBus>,
    actions: ActionExecutionService,
    config: ExecutionConfig,
}

impl WorkflowOrchestrator {
    pub fn new(
        models: Arc<dyn ModelRepository>,
        links: Arc<dyn LinkRepository>,
        audit: Arc<dyn AuditSink>,
        event_bus: Arc<EventBus>,
        actions: ActionExecutionService,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            models,
            links,
            audit,
            event_bus,
            actions,
            config,
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Load a model that may be executed: present, not deleted, published.
    pub(crate) async fn load_runnable(&self, id: &ModelId) -> Result<FunctionModel> {
        let model = self
            .models
            .find_by_id(id)
            .await?
            .ok_or_else(|| TesseraError::ModelNotFound(id.to_string()))?;
        if model.deleted {
            return Err(TesseraError::ModelDeleted(id.to_string()));
        }
        if model.status != ModelStatus::Published {
            return Err(TesseraError::NotPublished(id.to_string()));
        }
        Ok(model)
    }

    /// Execute a published model.
    ///
    /// Models that are missing, deleted, unpublished, not visible to `user`
    /// or structurally unschedulable are rejected before anything is
    /// audited or published. Otherwise the run always yields a record,
    /// whatever its terminal state.
    pub async fn execute(
        &self,
        model_id: &ModelId,
        mode: RunMode,
        input: Map<String, Value>,
        user: &UserId,
    ) -> Result<ExecutionRecord> {
        let model = self.load_runnable(model_id).await?;
        if !model.permissions.can_view(user) {
            return Err(TesseraError::PermissionDenied {
                user: user.to_string(),
                operation: "execute".into(),
            });
        }
        let plan = ExecutionPlan::build(&model)?;
        let guard = NestingGuard::root(&model.id, self.config.max_nesting_depth);

        Ok(self
            .run(RunParams {
                model,
                plan,
                mode,
                input,
                user: user.clone(),
                guard,
                parent: None,
                cancel: CancellationToken::new(),
            })
            .await)
    }

    pub(crate) fn run(&self, params: RunParams) -> futures::future::BoxFuture<'_, ExecutionRecord> {
        Box::pin(async move {
            let started_at = Utc::now();
            let start = Instant::now();
            let run = Run {
                id: ExecutionId::new(),
                context: ContextTree::new(params.input),
                model: params.model,
                plan: params.plan,
                mode: params.mode,
                user: params.user,
                guard: params.guard,
                parent: params.parent,
                cancel: params.cancel,
                progress: Mutex::new(Progress::default()),
            };
            let depth = run.guard.depth();

            info!(
                execution_id = %run.id,
                model_id = %run.model.id,
                mode = run.mode.as_str(),
                depth,
                nodes = run.plan.order.len(),
                levels = run.plan.levels.len(),
                actions = run.plan.action_count(),
                "Starting function model execution"
            );
            self.event_bus.publish(DomainEvent::ExecutionStarted {
                execution_id: run.id.clone(),
                model_id: run.model.id.clone(),
                mode: run.mode,
                depth,
            });
            if let Some(parent) = &run.parent {
                self.event_bus.publish(DomainEvent::NestedExecutionStarted {
                    execution_id: run.id.clone(),
                    parent_execution_id: parent.clone(),
                    model_id: run.model.id.clone(),
                    depth,
                });
            }
            self.record(
                &run,
                ops::EXECUTION_STARTED,
                run.id.as_str(),
                json!({
                    "mode": run.mode.as_str(),
                    "depth": depth,
                    "parent_execution_id": run.parent,
                }),
            )
            .await;

            self.schedule(&run).await;
            self.finish(run, started_at, start).await
        })
    }

    async fn schedule(&self, run: &Run) {
        let mut pending = run.plan.order.clone();
        let mut running = FuturesUnordered::new();

        loop {
            if !run.cancel.is_cancelled() {
                let limit = run.node_limit(self.config.max_parallel_nodes);
                let (ready, skipped) = run.take_ready(&mut pending, limit.saturating_sub(running.len()));
                for node_id in skipped {
                    self.node_finished(run, &node_id, NodeRunStatus::Skipped).await;
                }
                for node_id in ready {
                    running.push(self.run_node(run, node_id));
                }
            }
            if running.next().await.is_none() {
                break;
            }
        }

        // Whatever never started
        let leftover = if run.cancel.is_cancelled() {
            NodeRunStatus::Cancelled
        } else {
            NodeRunStatus::Skipped
        };
        for node_id in pending {
            {
                let mut progress = run.progress();
                progress.status.insert(node_id.clone(), leftover);
                progress.nodes.push(NodeRecord {
                    node_id: node_id.clone(),
                    status: leftover,
                    duration_ms: 0,
                });
            }
            self.node_finished(run, &node_id, leftover).await;
        }
    }

    async fn run_node(&self, run: &Run, node_id: NodeId) {
        let start = Instant::now();
        let status = self.execute_node(run, &node_id).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        {
            let mut progress = run.progress();
            if let Some(scope) = progress.scopes.get(&node_id).copied() {
                if let Err(e) = run.context.seal(scope) {
                    warn!(execution_id = %run.id, node_id = %node_id, error = %e, "Failed to seal scope");
                }
            }
            progress.status.insert(node_id.clone(), status);
            progress.nodes.push(NodeRecord {
                node_id: node_id.clone(),
                status,
                duration_ms,
            });
        }
        debug!(
            execution_id = %run.id,
            node_id = %node_id,
            status = status.as_str(),
            duration_ms,
            "Node finished"
        );
        self.node_finished(run, &node_id, status).await;
    }

    async fn node_finished(&self, run: &Run, node_id: &NodeId, status: NodeRunStatus) {
        self.event_bus.publish(DomainEvent::NodeExecutionCompleted {
            execution_id: run.id.clone(),
            node_id: node_id.clone(),
            status: status.as_str().to_string(),
        });
        self.record(run, ops::NODE_COMPLETED, node_id.as_str(), json!({ "status": status.as_str() }))
            .await;
    }

    async fn execute_node(&self, run: &Run, node_id: &NodeId) -> NodeRunStatus {
        let Some(node) = run.model.node(node_id) else {
            return NodeRunStatus::Skipped;
        };

        let parents: Vec<ScopeId> = {
            let progress = run.progress();
            run.plan
                .dependencies(node_id)
                .iter()
                .filter_map(|d| progress.scopes.get(d).copied())
                .collect()
        };
        let scope = match run.context.open_scope(node_id.as_str(), &parents) {
            Ok(scope) => scope,
            Err(e) => {
                run.abort(ExecutionState::Failed, e.to_string());
                return NodeRunStatus::Failed;
            }
        };
        run.progress().scopes.insert(node_id.clone(), scope);

        self.record(run, ops::NODE_STARTED, node_id.as_str(), json!({ "node_type": node.kind.label() }))
            .await;

        if node.is_input_capable() {
            self.bind_inputs(run, node, scope);
        }

        let mut status = NodeRunStatus::Completed;
        for step in run.plan.steps(node_id) {
            if run.cancel.is_cancelled() {
                status = status.max(NodeRunStatus::Cancelled);
                break;
            }
            let step_status = if step.len() == 1 || run.sequential_actions() {
                let mut worst = NodeRunStatus::Completed;
                for action in step {
                    let s = self.run_action(run, scope, action).await.node_status();
                    worst = worst.max(s);
                    if s.stops_node() {
                        break;
                    }
                }
                worst
            } else {
                join_all(step.iter().map(|a| self.run_action(run, scope, a)))
                    .await
                    .into_iter()
                    .map(|s| s.node_status())
                    .max()
                    .unwrap_or(NodeRunStatus::Completed)
            };
            status = status.max(step_status);
            if status.stops_node() {
                break;
            }
        }
        status
    }

    /// Copy the input boundary's fields from the run input into its scope.
    fn bind_inputs(&self, run: &Run, node: &Node, scope: ScopeId) {
        for field in node.fields() {
            match run.context.get(ScopeId::ROOT, &field.key) {
                Some(value) => {
                    if !field.value_type.matches(&value) {
                        warn!(
                            execution_id = %run.id,
                            node_id = %node.id,
                            key = %field.key,
                            expected = ?field.value_type,
                            "Run input has unexpected type"
                        );
                    }
                    if let Err(e) = run.context.set(scope, field.key.clone(), value) {
                        warn!(execution_id = %run.id, node_id = %node.id, error = %e, "Failed to bind input");
                    }
                }
                None => debug!(execution_id = %run.id, node_id = %node.id, key = %field.key, "Run input not provided"),
            }
        }
    }

    fn resolve_inputs(&self, run: &Run, scope: ScopeId, action: &ActionNode) -> std::result::Result<Map<String, Value>, ActionFailure> {
        if let ActionKind::FunctionModel(cfg) = &action.kind {
            return Ok(map_inputs(cfg, &run.context.visible(scope)));
        }
        if action.inputs.is_empty() {
            return Ok(run.context.visible(scope));
        }
        let mut inputs = Map::new();
        for binding in &action.inputs {
            match run.context.get(scope, &binding.key) {
                Some(value) if !binding.value_type.matches(&value) => {
                    return Err(ActionFailure::configuration(format!(
                        "input '{}' is not of type {:?}",
                        binding.key, binding.value_type
                    )));
                }
                Some(value) => {
                    inputs.insert(binding.key.clone(), value);
                }
                None => {
                    return Err(ActionFailure::configuration(format!(
                        "input '{}' is not bound",
                        binding.key
                    )));
                }
            }
        }
        Ok(inputs)
    }

    /// Write an action's output into the node scope. Declared outputs are
    /// type-checked and are the only keys written; actions without
    /// declarations write everything they return.
    fn apply_output(
        &self,
        run: &Run,
        scope: ScopeId,
        action: &ActionNode,
        output: ActionOutput,
    ) -> std::result::Result<(), ActionFailure> {
        let mut values = output.values;
        let writes: Vec<(String, Value)> = if action.outputs.is_empty() {
            values.into_iter().collect()
        } else {
            let mut writes = Vec::new();
            for binding in &action.outputs {
                match values.remove(&binding.key) {
                    Some(value) if !binding.value_type.matches(&value) => {
                        return Err(ActionFailure::configuration(format!(
                            "output '{}' is not of type {:?}",
                            binding.key, binding.value_type
                        )));
                    }
                    Some(value) => writes.push((binding.key.clone(), value)),
                    None => warn!(
                        execution_id = %run.id,
                        action_id = %action.id,
                        key = %binding.key,
                        "Declared output missing from action result"
                    ),
                }
            }
            writes
        };
        for (key, value) in writes {
            run.context
                .set(scope, key, value)
                .map_err(|e| ActionFailure::configuration(e.to_string()))?;
        }
        Ok(())
    }

    /// One pass of an action under `policy`, through the nested-model path
    /// or the adapter handlers.
    async fn attempt(&self, run: &Run, request: ActionRequest, policy: &tessera_core::model::RetryPolicy) -> ActionOutcome {
        if request.action.kind.nested_model().is_some() {
            self.actions
                .execute_with(request, policy, &run.cancel, |req| self.run_nested(run, req))
                .await
        } else {
            self.actions
                .execute_with(request, policy, &run.cancel, |req| self.actions.dispatch(req))
                .await
        }
    }

    /// Re-run an action chosen by a recovery decision. Inputs are resolved
    /// again, so an action whose declared inputs are still unbound fails
    /// without reaching its adapter.
    async fn reattempt(
        &self,
        run: &Run,
        scope: ScopeId,
        mut request: ActionRequest,
        policy: &tessera_core::model::RetryPolicy,
    ) -> ActionOutcome {
        match self.resolve_inputs(run, scope, &request.action) {
            Ok(inputs) => {
                request.inputs = inputs;
                self.attempt(run, request, policy).await
            }
            Err(failure) => ActionOutcome {
                result: AttemptResult::Failed(failure),
                attempts: 0,
                duration_ms: 0,
            },
        }
    }

    async fn run_action(&self, run: &Run, scope: ScopeId, action: &ActionNode) -> ActionRunStatus {
        let (inputs, unresolved) = match self.resolve_inputs(run, scope, action) {
            Ok(inputs) => (inputs, None),
            Err(failure) => (Map::new(), Some(failure)),
        };
        let request = ActionRequest {
            execution_id: run.id.clone(),
            model_id: run.model.id.clone(),
            action: action.clone(),
            inputs,
            attempt: 0,
        };
        if let Some(failure) = unresolved {
            let outcome = ActionOutcome {
                result: AttemptResult::Failed(failure.clone()),
                attempts: 0,
                duration_ms: 0,
            };
            self.action_failed(run, action, &outcome, &failure).await;
            return self.recover(run, scope, request, failure, &outcome).await;
        }

        let policy = self.actions.policy_for(&request);
        let outcome = self.attempt(run, request.clone(), &policy).await;
        match outcome.result.clone() {
            AttemptResult::Succeeded(output) => match self.apply_output(run, scope, action, output) {
                Ok(()) => {
                    self.action_done(run, action, &outcome, ActionRunStatus::Succeeded, None).await;
                    ActionRunStatus::Succeeded
                }
                Err(failure) => {
                    self.action_failed(run, action, &outcome, &failure).await;
                    self.recover(run, scope, request, failure, &outcome).await
                }
            },
            AttemptResult::Failed(failure) => {
                self.action_failed(run, action, &outcome, &failure).await;
                self.recover(run, scope, request, failure, &outcome).await
            }
            AttemptResult::Cancelled => {
                self.push_action(run, action, &outcome, ActionRunStatus::Cancelled, None);
                ActionRunStatus::Cancelled
            }
        }
    }

    async fn recover(
        &self,
        run: &Run,
        scope: ScopeId,
        request: ActionRequest,
        failure: ActionFailure,
        first: &ActionOutcome,
    ) -> ActionRunStatus {
        let action = request.action.clone();
        let own = self.actions.policy_for(&request);
        let decision = recovery::decide(&run.model.recovery_policies, &action, &own, &failure);

        warn!(
            execution_id = %run.id,
            action_id = %action.id,
            error_type = %failure.error_type,
            error = %failure.message,
            recovery = decision.kind().map(|k| k.as_str()).unwrap_or("none"),
            "Action failed, consulting recovery policies"
        );
        self.event_bus.publish(DomainEvent::ErrorHandlingTriggered {
            execution_id: run.id.clone(),
            action_id: action.id.clone(),
            error_type: failure.error_type,
            recovery_action: decision.kind().map(|k| k.as_str().to_string()),
        });

        let base_detail = json!({
            "action_id": action.id,
            "error_type": failure.error_type,
            "error": failure.message,
        });

        let op = decision.audit_op();
        match decision {
            RecoveryDecision::Retry { policy } => {
                self.record(run, op, action.id.as_str(), merge(&base_detail, json!({ "max_attempts": policy.max_attempts })))
                    .await;
                let outcome = self.reattempt(run, scope, request, &policy).await;
                self.settle(run, scope, &action, &failure, RecoveryAction::Retry, outcome, ActionRunStatus::Recovered, Value::Null)
                    .await
            }
            RecoveryDecision::ScaleDownAndRetry { policy } => {
                run.progress().scaled_down = true;
                info!(execution_id = %run.id, action_id = %action.id, "Scaling run down to one node at a time");
                self.record(
                    run,
                    op,
                    action.id.as_str(),
                    merge(&base_detail, json!({ "max_attempts": policy.max_attempts })),
                )
                .await;
                let outcome = self.reattempt(run, scope, request, &policy).await;
                self.settle(
                    run,
                    scope,
                    &action,
                    &failure,
                    RecoveryAction::ScaleDownAndRetry,
                    outcome,
                    ActionRunStatus::Recovered,
                    Value::Null,
                )
                .await
            }
            RecoveryDecision::FallbackAgent { original, fallback } => {
                info!(
                    execution_id = %run.id,
                    action_id = %action.id,
                    original_agent = %original,
                    fallback_agent = %fallback,
                    "Falling back to alternate agent"
                );
                self.event_bus.publish(DomainEvent::AiAgentFallbackTriggered {
                    execution_id: run.id.clone(),
                    action_id: action.id.clone(),
                    original_agent: original.clone(),
                    fallback_agent: fallback.clone(),
                });
                let detail = json!({ "original_agent": original, "fallback_agent": fallback });
                self.record(run, op, action.id.as_str(), merge(&base_detail, detail.clone()))
                    .await;

                let mut request = request;
                request.action = recovery::with_agent(&action, &fallback);
                let fallback_action = request.action.clone();
                let outcome = self.reattempt(run, scope, request, &own).await;
                self.settle(run, scope, &fallback_action, &failure, RecoveryAction::FallbackAgent, outcome, ActionRunStatus::FellBack, detail)
                    .await
            }
            RecoveryDecision::IsolateAndContinue => {
                self.record(run, op, action.id.as_str(), merge(&base_detail, json!({ "node_id": action.node_id })))
                    .await;
                self.push_recovery(run, &action, &failure, Some(RecoveryAction::IsolateAndContinue), true, Value::Null);
                run.escalate(ExecutionState::CompletedWithRecovery);
                self.push_action(run, &action, first, ActionRunStatus::Isolated, Some(failure.to_string()));
                ActionRunStatus::Isolated
            }
            RecoveryDecision::DegradeGracefully { output } => {
                let applied = self.apply_output(run, scope, &action, output.clone());
                let detail = json!({ "default_output": output.values });
                self.record(run, op, action.id.as_str(), merge(&base_detail, detail.clone()))
                    .await;
                match applied {
                    Ok(()) => {
                        self.push_recovery(run, &action, &failure, Some(RecoveryAction::DegradeGracefully), true, detail);
                        run.escalate(ExecutionState::CompletedWithRecovery);
                        self.push_action(run, &action, first, ActionRunStatus::Degraded, Some(failure.to_string()));
                        ActionRunStatus::Degraded
                    }
                    Err(e) => {
                        self.push_recovery(run, &action, &failure, Some(RecoveryAction::DegradeGracefully), false, detail);
                        run.abort(ExecutionState::Failed, format!("default output for '{}' rejected: {}", action.id, e));
                        ActionRunStatus::Failed
                    }
                }
            }
            RecoveryDecision::Propagate { link_id } => {
                let me = FeatureRef::model(run.model.id.as_str());
                let link = match self.links.find_by_id(&link_id).await {
                    Ok(link) => link,
                    Err(e) => {
                        warn!(execution_id = %run.id, link_id = %link_id, error = %e, "Link lookup failed");
                        None
                    }
                };
                let Some(link) = link else {
                    self.record(run, ops::RECOVERY_UNHANDLED, action.id.as_str(), merge(&base_detail, json!({ "link_id": link_id, "reason": "link not found" })))
                        .await;
                    self.push_recovery(run, &action, &failure, Some(RecoveryAction::PropagateCrossFeature), false, json!({ "link_id": link_id }));
                    run.abort(ExecutionState::Failed, format!("propagation link '{}' not found: {}", link_id, failure));
                    return ActionRunStatus::Failed;
                };
                let target = if link.source == me { link.target.clone() } else { link.source.clone() };
                error!(
                    execution_id = %run.id,
                    link_id = %link_id,
                    target = %target,
                    "Propagating failure across link"
                );
                self.event_bus.publish(DomainEvent::ErrorPropagated {
                    execution_id: run.id.clone(),
                    link_id: link_id.clone(),
                    source: me.clone(),
                    target: target.clone(),
                    error: failure.to_string(),
                });
                let detail = json!({ "link_id": link_id, "source": me.to_string(), "target": target.to_string() });
                self.record(run, op, action.id.as_str(), merge(&base_detail, detail.clone()))
                    .await;
                self.push_recovery(run, &action, &failure, Some(RecoveryAction::PropagateCrossFeature), true, detail);
                self.push_action(run, &action, first, ActionRunStatus::Failed, Some(failure.to_string()));
                run.abort(ExecutionState::FailedWithPropagation, failure.to_string());
                ActionRunStatus::Failed
            }
            RecoveryDecision::EmergencyShutdown => {
                let reason = format!("emergency shutdown after '{}' failed: {}", action.id, failure);
                error!(execution_id = %run.id, action_id = %action.id, "Emergency shutdown");
                self.event_bus.publish(DomainEvent::EmergencyShutdown {
                    execution_id: run.id.clone(),
                    reason: reason.clone(),
                });
                self.record(run, op, action.id.as_str(), base_detail).await;
                self.push_recovery(run, &action, &failure, Some(RecoveryAction::EmergencyShutdown), true, Value::Null);
                self.push_action(run, &action, first, ActionRunStatus::Failed, Some(failure.to_string()));
                run.abort(ExecutionState::Failed, reason);
                ActionRunStatus::Failed
            }
            RecoveryDecision::Unhandled { reason } => {
                error!(execution_id = %run.id, action_id = %action.id, reason = %reason, "Unrecoverable action failure");
                self.record(run, op, action.id.as_str(), merge(&base_detail, json!({ "reason": reason })))
                    .await;
                self.push_recovery(run, &action, &failure, None, false, json!({ "reason": reason }));
                self.push_action(run, &action, first, ActionRunStatus::Failed, Some(failure.to_string()));
                run.abort(ExecutionState::Failed, format!("action '{}' failed: {}", action.id, failure));
                ActionRunStatus::Failed
            }
        }
    }

    /// Conclude a recovery that re-ran the action.
    #[allow(clippy::too_many_arguments)]
    async fn settle(
        &self,
        run: &Run,
        scope: ScopeId,
        action: &ActionNode,
        failure: &ActionFailure,
        kind: RecoveryAction,
        outcome: ActionOutcome,
        on_success: ActionRunStatus,
        detail: Value,
    ) -> ActionRunStatus {
        let result = match outcome.result.clone() {
            AttemptResult::Succeeded(output) => self.apply_output(run, scope, action, output),
            AttemptResult::Failed(f) => Err(f),
            AttemptResult::Cancelled => {
                self.push_action(run, action, &outcome, ActionRunStatus::Cancelled, None);
                return ActionRunStatus::Cancelled;
            }
        };

        match result {
            Ok(()) => {
                self.push_recovery(run, action, failure, Some(kind), true, detail);
                run.escalate(if on_success == ActionRunStatus::FellBack {
                    ExecutionState::CompletedWithFallback
                } else {
                    ExecutionState::CompletedWithRecovery
                });
                self.action_done(run, action, &outcome, on_success, None).await;
                on_success
            }
            Err(second) => {
                self.push_recovery(run, action, failure, Some(kind), false, detail);
                self.action_failed(run, action, &outcome, &second).await;
                self.push_action(run, action, &outcome, ActionRunStatus::Failed, Some(second.to_string()));
                run.abort(
                    ExecutionState::Failed,
                    format!("action '{}' failed after {}: {}", action.id, kind, second),
                );
                ActionRunStatus::Failed
            }
        }
    }

    async fn action_done(
        &self,
        run: &Run,
        action: &ActionNode,
        outcome: &ActionOutcome,
        status: ActionRunStatus,
        error: Option<String>,
    ) {
        self.push_action(run, action, outcome, status, error);
        self.record(
            run,
            ops::ACTION_COMPLETED,
            action.id.as_str(),
            json!({
                "node_id": action.node_id,
                "action_type": action.kind.label(),
                "attempts": outcome.attempts,
                "duration_ms": outcome.duration_ms,
                "agent_id": action.kind.agent_id(),
            }),
        )
        .await;
    }

    async fn action_failed(&self, run: &Run, action: &ActionNode, outcome: &ActionOutcome, failure: &ActionFailure) {
        self.record(
            run,
            ops::ACTION_FAILED,
            action.id.as_str(),
            json!({
                "node_id": action.node_id,
                "action_type": action.kind.label(),
                "attempts": outcome.attempts,
                "error_type": failure.error_type,
                "error": failure.message,
            }),
        )
        .await;
    }

    fn push_action(
        &self,
        run: &Run,
        action: &ActionNode,
        outcome: &ActionOutcome,
        status: ActionRunStatus,
        error: Option<String>,
    ) {
        run.progress().actions.push(ActionRecord {
            action_id: action.id.clone(),
            node_id: action.node_id.clone(),
            action_type: action.kind.label(),
            status,
            attempts: outcome.attempts,
            duration_ms: outcome.duration_ms,
            agent_id: action.kind.agent_id().cloned(),
            error,
        });
    }

    fn push_recovery(
        &self,
        run: &Run,
        action: &ActionNode,
        failure: &ActionFailure,
        recovery: Option<RecoveryAction>,
        succeeded: bool,
        detail: Value,
    ) {
        run.progress().recoveries.push(RecoveryRecord {
            action_id: action.id.clone(),
            node_id: action.node_id.clone(),
            error_type: failure.error_type,
            error: failure.message.clone(),
            recovery,
            succeeded,
            detail,
        });
    }

    async fn record(&self, run: &Run, op: &str, entity: &str, details: Value) {
        let entry = AuditEntry::new(op, entity, &run.user)
            .for_model(&run.model.id)
            .with_details(merge(&json!({ "execution_id": run.id }), details));
        if let Err(e) = self.audit.save(entry).await {
            warn!(execution_id = %run.id, op, error = %e, "Failed to write audit entry");
        }
    }

    /// Collect output-boundary fields. A boundary without declared fields
    /// contributes everything visible from its scope.
    fn summarize(&self, run: &Run) -> (Map<String, Value>, HashMap<NodeId, Map<String, Value>>) {
        let progress = run.progress();
        let mut outputs = Map::new();
        let mut stage_outputs = HashMap::new();

        for node in &run.model.nodes {
            let Some(scope) = progress.scopes.get(&node.id).copied() else {
                continue;
            };
            stage_outputs.insert(node.id.clone(), run.context.own(scope));

            let completed = matches!(
                progress.status.get(&node.id),
                Some(NodeRunStatus::Completed | NodeRunStatus::Degraded)
            );
            if !node.is_output_capable() || !completed {
                continue;
            }
            if node.fields().is_empty() {
                for (k, v) in run.context.visible(scope) {
                    outputs.entry(k).or_insert(v);
                }
            } else {
                for field in node.fields() {
                    if let Some(v) = run.context.get(scope, &field.key) {
                        outputs.insert(field.key.clone(), v);
                    }
                }
            }
        }
        (outputs, stage_outputs)
    }

    async fn finish(&self, run: Run, started_at: DateTime<Utc>, start: Instant) -> ExecutionRecord {
        let (outputs, stage_outputs) = self.summarize(&run);
        let duration_ms = start.elapsed().as_millis() as u64;

        let (state, error, nodes, actions, recoveries, children) = {
            let mut progress = run.progress();
            let mut state = progress.state.unwrap_or(ExecutionState::Completed);
            if run.cancel.is_cancelled() && state.is_success() {
                // Cancelled from outside, e.g. by a failing parent run
                state = ExecutionState::Failed;
                progress.error.get_or_insert_with(|| TesseraError::Cancelled.to_string());
            }
            (
                state,
                progress.error.clone(),
                std::mem::take(&mut progress.nodes),
                std::mem::take(&mut progress.actions),
                std::mem::take(&mut progress.recoveries),
                std::mem::take(&mut progress.children),
            )
        };

        if state.is_success() {
            info!(
                execution_id = %run.id,
                model_id = %run.model.id,
                state = %state,
                duration_ms,
                "Function model execution finished"
            );
        } else {
            error!(
                execution_id = %run.id,
                model_id = %run.model.id,
                state = %state,
                error = error.as_deref().unwrap_or(""),
                duration_ms,
                "Function model execution failed"
            );
        }

        self.event_bus.publish(DomainEvent::FunctionModelExecuted {
            execution_id: run.id.clone(),
            model_id: run.model.id.clone(),
            state,
            duration_ms,
        });
        self.record(
            &run,
            ops::EXECUTION_FINISHED,
            run.id.as_str(),
            json!({ "state": state, "error": error, "duration_ms": duration_ms }),
        )
        .await;

        ExecutionRecord {
            execution_id: run.id.clone(),
            model_id: run.model.id.clone(),
            parent_execution_id: run.parent.clone(),
            depth: run.guard.depth(),
            mode: run.mode,
            state,
            outputs,
            stage_outputs,
            nodes,
            actions,
            recoveries,
            children,
            error,
            started_at,
            finished_at: Utc::now(),
            duration_ms,
        }
    }
}

fn merge(base: &Value, extra: Value) -> Value {
    let mut out = base.as_object().cloned().unwrap_or_default();
    if let Value::Object(extra) = extra {
        out.extend(extra);
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::future::BoxFuture;

    use tessera_core::error::ErrorType;
    use tessera_core::model::{
        ActionMode, ContextBinding, CrossFeatureLink, LinkType, NestedModelConfig, RecoveryPolicy, ValueType,
    };
    use tessera_core::traits::ActionHandler;
    use tessera_memory::{InMemoryLinkRepository, InMemoryModelRepository, MemoryAuditLog};
    use tessera_test_utils::{fast_retry, linear_model, pipeline_model, published, with_actions, RoutingHandler, ScriptedHandler};

    use crate::handlers::HandlerSet;

    struct Harness {
        orchestrator: WorkflowOrchestrator,
        audit: Arc<MemoryAuditLog>,
        events: tokio::sync::broadcast::Receiver<DomainEvent>,
    }

    impl Harness {
        fn new(models: Vec<FunctionModel>, handler: Arc<dyn ActionHandler>) -> Self {
            Self::with_links(models, vec![], handler)
        }

        fn with_links(models: Vec<FunctionModel>, links: Vec<CrossFeatureLink>, handler: Arc<dyn ActionHandler>) -> Self {
            Self::build(models, links, handler, Duration::from_secs(5))
        }

        fn with_timeout(models: Vec<FunctionModel>, handler: Arc<dyn ActionHandler>, timeout: Duration) -> Self {
            Self::build(models, vec![], handler, timeout)
        }

        fn build(
            models: Vec<FunctionModel>,
            links: Vec<CrossFeatureLink>,
            handler: Arc<dyn ActionHandler>,
            timeout: Duration,
        ) -> Self {
            let bus = Arc::new(EventBus::default());
            let events = bus.subscribe();
            let audit = Arc::new(MemoryAuditLog::new());
            let handlers = HandlerSet::new()
                .with_tether(handler.clone())
                .with_ai_agent(handler.clone())
                .with_knowledge_base(handler);
            let actions = ActionExecutionService::new(handlers, bus.clone()).with_timeout(timeout);
            let orchestrator = WorkflowOrchestrator::new(
                Arc::new(InMemoryModelRepository::with_models(models)),
                Arc::new(InMemoryLinkRepository::with_links(links)),
                audit.clone(),
                bus,
                actions,
                ExecutionConfig::default(),
            );
            Self {
                orchestrator,
                audit,
                events,
            }
        }

        async fn run(&self, id: &str, mode: RunMode) -> ExecutionRecord {
            let mut input = Map::new();
            input.insert("testInput".into(), json!("hello"));
            self.orchestrator
                .execute(&ModelId::from(id), mode, input, &UserId::from("tester"))
                .await
                .unwrap()
        }

        fn event_names(&mut self) -> Vec<&'static str> {
            std::iter::from_fn(|| self.events.try_recv().ok()).map(|e| e.name()).collect()
        }

        fn audit_ops(&self) -> Vec<String> {
            self.audit.entries().into_iter().map(|e| e.action).collect()
        }
    }

    /// Succeeds after a short pause, tracking the most calls seen in flight.
    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    impl ActionHandler for Gauge {
        fn name(&self) -> &str {
            "gauge"
        }

        fn execute(&self, _request: ActionRequest) -> BoxFuture<'_, std::result::Result<ActionOutput, ActionFailure>> {
            Box::pin(async move {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                Ok(ActionOutput::empty())
            })
        }
    }

    fn with_policy(mut model: FunctionModel, policy: RecoveryPolicy) -> FunctionModel {
        model.add_recovery_policy(policy).unwrap();
        model
    }

    #[tokio::test]
    async fn test_linear_run_completes() {
        let mut h = Harness::new(vec![published(linear_model("m1"))], Arc::new(ScriptedHandler::echo()));
        let record = h.run("m1", RunMode::Sequential).await;

        assert_eq!(record.state, ExecutionState::Completed);
        assert_eq!(record.outputs["testInput"], "hello");
        assert_eq!(record.nodes.len(), 3);
        assert!(record.nodes.iter().all(|n| n.status == NodeRunStatus::Completed));
        assert_eq!(record.action("call").unwrap().attempts, 1);
        assert_eq!(record.depth, 0);

        let names = h.event_names();
        assert_eq!(names.first(), Some(&"ExecutionStarted"));
        assert_eq!(names.last(), Some(&"FunctionModelExecuted"));
        assert_eq!(names.iter().filter(|n| **n == "NodeExecutionCompleted").count(), 3);

        let ops = h.audit_ops();
        assert_eq!(ops.first().map(String::as_str), Some(ops::EXECUTION_STARTED));
        assert_eq!(ops.last().map(String::as_str), Some(ops::EXECUTION_FINISHED));
        assert!(ops.iter().any(|o| o == ops::ACTION_COMPLETED));
    }

    #[tokio::test]
    async fn test_unrunnable_models_rejected_without_side_effects() {
        let draft = linear_model("draft");
        let mut deleted = published(linear_model("gone"));
        deleted.soft_delete();
        let mut h = Harness::new(vec![draft, deleted], Arc::new(ScriptedHandler::echo()));
        let user = UserId::from("tester");

        let err = h
            .orchestrator
            .execute(&ModelId::from("draft"), RunMode::Sequential, Map::new(), &user)
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::NotPublished(_)));
        let err = h
            .orchestrator
            .execute(&ModelId::from("gone"), RunMode::Sequential, Map::new(), &user)
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::ModelDeleted(_)));
        let err = h
            .orchestrator
            .execute(&ModelId::from("missing"), RunMode::Sequential, Map::new(), &user)
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::ModelNotFound(_)));

        assert!(h.audit.entries().is_empty());
        assert!(h.event_names().is_empty());
    }

    #[tokio::test]
    async fn test_stranger_cannot_execute() {
        let h = Harness::new(vec![published(linear_model("m1"))], Arc::new(ScriptedHandler::echo()));
        let err = h
            .orchestrator
            .execute(&ModelId::from("m1"), RunMode::Sequential, Map::new(), &UserId::from("mallory"))
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn test_retry_policy_recovers() {
        let model = with_policy(linear_model("m1"), RecoveryPolicy::retry(ErrorType::Timeout, 3));
        let handler = Arc::new(ScriptedHandler::fail_times(1, ErrorType::Timeout));
        let mut h = Harness::new(vec![published(model)], handler.clone());
        let record = h.run("m1", RunMode::Sequential).await;

        assert_eq!(record.state, ExecutionState::CompletedWithRecovery);
        assert_eq!(record.action("call").unwrap().status, ActionRunStatus::Recovered);
        assert_eq!(record.recoveries.len(), 1);
        assert!(record.recoveries[0].succeeded);
        assert_eq!(handler.calls(), 2);
        assert!(h.event_names().contains(&"ErrorHandlingTriggered"));
        assert!(h.audit_ops().iter().any(|o| o == ops::RECOVERY_RETRY));
    }

    #[tokio::test]
    async fn test_fallback_agent_takes_over() {
        let model = with_actions(
            pipeline_model("m1"),
            vec![ActionNode::agent_task("classify", "stage", "primary", "classify")],
        );
        let model = with_policy(model, RecoveryPolicy::fallback(ErrorType::AgentFailure, "backup"));
        let failing = Arc::new(ScriptedHandler::always_fail(ErrorType::AgentFailure));
        let backup = Arc::new(ScriptedHandler::succeed(json!({"label": "spam"})));
        let router = RoutingHandler::new(backup.clone()).route_agent("primary", failing.clone());
        let mut h = Harness::new(vec![published(model)], Arc::new(router));

        let record = h.run("m1", RunMode::Sequential).await;
        assert_eq!(record.state, ExecutionState::CompletedWithFallback);
        let action = record.action("classify").unwrap();
        assert_eq!(action.status, ActionRunStatus::FellBack);
        assert_eq!(action.agent_id, Some(AgentId::from("backup")));
        assert_eq!(record.stage_outputs[&NodeId::from("stage")]["label"], "spam");
        assert_eq!(failing.calls(), 1);
        assert_eq!(backup.calls(), 1);

        let names = h.event_names();
        assert_eq!(names.iter().filter(|n| **n == "AIAgentFallbackTriggered").count(), 1);
    }

    #[tokio::test]
    async fn test_isolate_skips_dependents() {
        let model = with_policy(
            linear_model("m1"),
            RecoveryPolicy::new(ErrorType::ExternalService, RecoveryAction::IsolateAndContinue),
        );
        let h = Harness::new(vec![published(model)], Arc::new(ScriptedHandler::always_fail(ErrorType::ExternalService)));
        let record = h.run("m1", RunMode::Parallel).await;

        assert_eq!(record.state, ExecutionState::CompletedWithRecovery);
        assert_eq!(record.node("stage").unwrap().status, NodeRunStatus::Isolated);
        assert_eq!(record.node("out").unwrap().status, NodeRunStatus::Skipped);
        assert!(record.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_degrade_writes_default_output() {
        let model = with_policy(
            linear_model("m1"),
            RecoveryPolicy::degrade(ErrorType::ExternalService, json!({"score": 0})),
        );
        let h = Harness::new(vec![published(model)], Arc::new(ScriptedHandler::always_fail(ErrorType::ExternalService)));
        let record = h.run("m1", RunMode::Sequential).await;

        assert_eq!(record.state, ExecutionState::CompletedWithRecovery);
        assert_eq!(record.node("stage").unwrap().status, NodeRunStatus::Degraded);
        assert_eq!(record.node("out").unwrap().status, NodeRunStatus::Completed);
        assert_eq!(record.outputs["score"], 0);
    }

    #[tokio::test]
    async fn test_unhandled_failure_fails_run() {
        let mut h = Harness::new(
            vec![published(linear_model("m1"))],
            Arc::new(ScriptedHandler::always_fail(ErrorType::AgentFailure)),
        );
        let record = h.run("m1", RunMode::Sequential).await;

        assert_eq!(record.state, ExecutionState::Failed);
        assert!(record.error.as_deref().unwrap().contains("call"));
        assert_eq!(record.node("stage").unwrap().status, NodeRunStatus::Failed);
        assert_ne!(record.node("out").unwrap().status, NodeRunStatus::Completed);
        assert!(record.outputs.is_empty());

        assert!(h.audit_ops().iter().any(|o| o == ops::RECOVERY_UNHANDLED));
        assert_eq!(h.event_names().last(), Some(&"FunctionModelExecuted"));
    }

    #[tokio::test]
    async fn test_propagation_marks_run() {
        let link = CrossFeatureLink::with_id(
            "l1",
            FeatureRef::model("m1"),
            FeatureRef::model("billing"),
            LinkType::Triggers,
            0.5,
        )
        .unwrap();
        let model = with_policy(linear_model("m1"), RecoveryPolicy::propagate(ErrorType::ExternalService, "l1"));
        let mut h = Harness::with_links(
            vec![published(model)],
            vec![link],
            Arc::new(ScriptedHandler::always_fail(ErrorType::ExternalService)),
        );
        let record = h.run("m1", RunMode::Sequential).await;

        assert_eq!(record.state, ExecutionState::FailedWithPropagation);
        assert!(h.event_names().contains(&"ErrorPropagated"));
        assert!(h.audit_ops().iter().any(|o| o == ops::RECOVERY_PROPAGATE));
    }

    #[tokio::test]
    async fn test_emergency_shutdown() {
        let model = with_policy(
            linear_model("m1"),
            RecoveryPolicy::new(ErrorType::ResourceExhaustion, RecoveryAction::EmergencyShutdown),
        );
        let mut h = Harness::new(
            vec![published(model)],
            Arc::new(ScriptedHandler::always_fail(ErrorType::ResourceExhaustion)),
        );
        let record = h.run("m1", RunMode::AdaptiveParallel).await;
        assert_eq!(record.state, ExecutionState::Failed);
        assert!(h.event_names().contains(&"EmergencyShutdown"));
    }

    #[tokio::test]
    async fn test_declared_inputs_and_outputs() {
        let ok = ActionNode::tether("score", "stage", "https://x.test")
            .with_inputs(vec![ContextBinding::typed("testInput", ValueType::String)])
            .with_outputs(vec![ContextBinding::typed("score", ValueType::Number)]);
        let handler = Arc::new(ScriptedHandler::succeed(json!({"score": 7, "noise": true})));
        let h = Harness::new(vec![published(with_actions(pipeline_model("m1"), vec![ok]))], handler.clone());
        let record = h.run("m1", RunMode::Sequential).await;

        assert_eq!(record.state, ExecutionState::Completed);
        let stage = &record.stage_outputs[&NodeId::from("stage")];
        assert_eq!(stage["score"], 7);
        assert!(!stage.contains_key("noise"));
        let sent = &handler.requests()[0].inputs;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent["testInput"], "hello");

        let unbound = ActionNode::tether("needs", "stage", "https://x.test")
            .with_inputs(vec![ContextBinding::new("customerId")]);
        let h = Harness::new(
            vec![published(with_actions(pipeline_model("m2"), vec![unbound]))],
            Arc::new(ScriptedHandler::echo()),
        );
        let record = h.run("m2", RunMode::Sequential).await;
        assert_eq!(record.state, ExecutionState::Failed);
        assert!(record.error.unwrap().contains("customerId"));
    }

    #[tokio::test]
    async fn test_parallel_actions_in_one_step() {
        let actions = vec![
            ActionNode::tether("a", "stage", "https://x.test").with_mode(ActionMode::Parallel),
            ActionNode::tether("b", "stage", "https://x.test").with_mode(ActionMode::Parallel),
            ActionNode::tether("c", "stage", "https://x.test").with_order(1),
        ];
        let handler = Arc::new(ScriptedHandler::echo());
        let h = Harness::new(vec![published(with_actions(pipeline_model("m1"), actions))], handler.clone());
        let record = h.run("m1", RunMode::Parallel).await;

        assert_eq!(record.state, ExecutionState::Completed);
        assert_eq!(handler.calls(), 3);
        let last = handler.requests().pop().unwrap();
        assert_eq!(last.action.id, ActionId::from("c"));
    }

    #[tokio::test]
    async fn test_diamond_in_every_mode() {
        let mut model = FunctionModel::with_id("d", "diamond", "tester");
        model.add_node(Node::input("in", "In", vec![ContextBinding::new("testInput")])).unwrap();
        model.add_node(Node::stage("left", "Left").depends_on("in")).unwrap();
        model.add_node(Node::stage("right", "Right").depends_on("in")).unwrap();
        model
            .add_node(Node::output("out", "Out", vec![ContextBinding::new("l"), ContextBinding::new("r")]).depends_on("left").depends_on("right"))
            .unwrap();
        model.add_action(ActionNode::tether("l", "left", "https://x.test")).unwrap();
        model.add_action(ActionNode::tether("r", "right", "https://x.test")).unwrap();

        let router = RoutingHandler::new(Arc::new(ScriptedHandler::echo()))
            .route_action("l", Arc::new(ScriptedHandler::succeed(json!({"l": 1}))))
            .route_action("r", Arc::new(ScriptedHandler::succeed(json!({"r": 2}))));
        let h = Harness::new(vec![published(model)], Arc::new(router));

        for mode in [RunMode::Sequential, RunMode::Parallel, RunMode::AdaptiveParallel] {
            let record = h.run("d", mode).await;
            assert_eq!(record.state, ExecutionState::Completed, "{:?}", mode);
            assert_eq!(record.outputs.len(), 2);
            assert_eq!(record.outputs["l"], 1);
            assert_eq!(record.outputs["r"], 2);
        }
    }

    fn child_model() -> FunctionModel {
        let mut model = FunctionModel::with_id("child", "child", "tester");
        model.add_node(Node::input("in", "In", vec![ContextBinding::new("payload")])).unwrap();
        model.add_node(Node::stage("work", "Work").depends_on("in")).unwrap();
        model.add_node(Node::output("out", "Out", vec![ContextBinding::new("total")]).depends_on("work")).unwrap();
        model.add_action(ActionNode::tether("compute", "work", "https://x.test")).unwrap();
        model
    }

    fn nesting(model: &str) -> NestedModelConfig {
        NestedModelConfig {
            model_id: ModelId::from(model),
            input_mapping: BTreeMap::from([("testInput".to_string(), "payload".to_string())]),
            output_mapping: BTreeMap::from([("total".to_string(), "orderTotal".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_nested_model_maps_context() {
        let parent = with_actions(
            pipeline_model("parent"),
            vec![ActionNode::nested("sub", "stage", nesting("child"))],
        );
        let compute = Arc::new(ScriptedHandler::succeed(json!({"total": 42, "scratch": "x"})));
        let router = RoutingHandler::new(Arc::new(ScriptedHandler::echo())).route_action("compute", compute.clone());
        let mut h = Harness::new(vec![published(parent), published(child_model())], Arc::new(router));

        let record = h.run("parent", RunMode::Sequential).await;
        assert_eq!(record.state, ExecutionState::Completed);
        assert_eq!(record.children.len(), 1);
        let child = &record.children[0];
        assert_eq!(child.depth, 1);
        assert_eq!(child.parent_execution_id.as_ref(), Some(&record.execution_id));
        assert_eq!(child.outputs["total"], 42);

        // Only mapped keys cross in either direction
        let seen = &compute.requests()[0].inputs;
        assert_eq!(seen["payload"], "hello");
        assert!(!seen.contains_key("testInput"));
        let stage = &record.stage_outputs[&NodeId::from("stage")];
        assert_eq!(stage["orderTotal"], 42);
        assert!(!stage.contains_key("scratch"));
        assert!(!stage.contains_key("total"));

        assert!(h.event_names().contains(&"NestedExecutionStarted"));
    }

    #[tokio::test]
    async fn test_nested_failure_cascades() {
        let parent = with_actions(
            pipeline_model("parent"),
            vec![ActionNode::nested("sub", "stage", nesting("child"))],
        );
        let router = RoutingHandler::new(Arc::new(ScriptedHandler::echo()))
            .route_action("compute", Arc::new(ScriptedHandler::always_fail(ErrorType::AgentFailure)));
        let h = Harness::new(vec![published(parent), published(child_model())], Arc::new(router));

        let record = h.run("parent", RunMode::Sequential).await;
        assert_eq!(record.state, ExecutionState::Failed);
        assert_eq!(record.children[0].state, ExecutionState::Failed);
        assert_eq!(record.recoveries[0].error_type, ErrorType::CascadeFailure);
    }

    #[tokio::test]
    async fn test_mutual_nesting_is_refused() {
        let a = with_actions(pipeline_model("a"), vec![ActionNode::nested("to_b", "stage", nesting("b"))]);
        let b = with_actions(pipeline_model("b"), vec![ActionNode::nested("to_a", "stage", nesting("a"))]);
        let h = Harness::new(vec![published(a), published(b)], Arc::new(ScriptedHandler::echo()));

        let record = h.run("a", RunMode::Sequential).await;
        assert_eq!(record.state, ExecutionState::Failed);
        let b_run = &record.children[0];
        assert!(b_run.children.is_empty());
        assert!(b_run.error.as_deref().unwrap().contains("a -> b -> a"));
    }

    #[tokio::test]
    async fn test_recovery_reattempt_still_needs_declared_inputs() {
        let unbound = ActionNode::tether("needs", "stage", "https://x.test")
            .with_inputs(vec![ContextBinding::new("customerId")]);
        let model = with_policy(
            with_actions(pipeline_model("m1"), vec![unbound]),
            RecoveryPolicy::retry(ErrorType::Configuration, 2),
        );
        let handler = Arc::new(ScriptedHandler::echo());
        let h = Harness::new(vec![published(model)], handler.clone());

        let record = h.run("m1", RunMode::Sequential).await;
        assert_eq!(record.state, ExecutionState::Failed);
        assert_eq!(handler.calls(), 0);
        assert_eq!(record.action("needs").unwrap().status, ActionRunStatus::Failed);
        assert!(!record.recoveries[0].succeeded);
        assert!(record.error.unwrap().contains("customerId"));
    }

    #[tokio::test]
    async fn test_nested_run_not_bound_by_single_action_timeout() {
        let mut child = child_model();
        child
            .add_action(ActionNode::tether("compute_more", "work", "https://x.test").with_order(1))
            .unwrap();
        let parent = with_actions(
            pipeline_model("parent"),
            vec![ActionNode::nested("sub", "stage", nesting("child"))],
        );
        let slow = Arc::new(ScriptedHandler::echo().with_delay(Duration::from_millis(60)));
        let h = Harness::with_timeout(vec![published(parent), published(child)], slow.clone(), Duration::from_millis(100));

        let record = h.run("parent", RunMode::Sequential).await;
        assert_eq!(record.state, ExecutionState::Completed, "{:?}", record.error);
        assert_eq!(slow.calls(), 2);
        assert_eq!(record.children.len(), 1);
        assert_eq!(record.children[0].state, ExecutionState::Completed);

        let ops = h.audit_ops();
        let started = ops.iter().filter(|o| *o == ops::EXECUTION_STARTED).count();
        let finished = ops.iter().filter(|o| *o == ops::EXECUTION_FINISHED).count();
        assert_eq!(started, 2);
        assert_eq!(finished, 2);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_siblings() {
        let mut model = FunctionModel::with_id("m1", "fan out", "tester");
        model.add_node(Node::input("in", "In", vec![ContextBinding::new("testInput")])).unwrap();
        model.add_node(Node::stage("left", "Left").depends_on("in")).unwrap();
        model.add_node(Node::stage("right", "Right").depends_on("in")).unwrap();
        model
            .add_node(Node::output("out", "Out", vec![]).depends_on("left").depends_on("right"))
            .unwrap();
        model
            .add_action(ActionNode::tether("l", "left", "https://x.test").with_retry(fast_retry(1)))
            .unwrap();
        model.add_action(ActionNode::tether("r", "right", "https://x.test")).unwrap();
        let model = with_policy(
            model,
            RecoveryPolicy::new(ErrorType::ResourceExhaustion, RecoveryAction::EmergencyShutdown),
        );

        let slow = Arc::new(ScriptedHandler::echo().with_delay(Duration::from_secs(3)));
        let router = RoutingHandler::new(slow)
            .route_action("l", Arc::new(ScriptedHandler::always_fail(ErrorType::ResourceExhaustion)));
        let h = Harness::new(vec![published(model)], Arc::new(router));

        let start = std::time::Instant::now();
        let record = h.run("m1", RunMode::Parallel).await;
        assert!(start.elapsed() < Duration::from_secs(2));

        assert_eq!(record.state, ExecutionState::Failed);
        assert_eq!(record.node("left").unwrap().status, NodeRunStatus::Failed);
        assert_eq!(record.node("right").unwrap().status, NodeRunStatus::Cancelled);
        assert_eq!(record.action("r").unwrap().status, ActionRunStatus::Cancelled);
        assert_eq!(record.node("out").unwrap().status, NodeRunStatus::Cancelled);
    }

    /// in -> first(boom) -> {left(l1 | l2), right(r1 | r2)} -> out
    fn wide_model(id: &str) -> FunctionModel {
        let mut model = FunctionModel::with_id(id, "wide", "tester");
        model.add_node(Node::input("in", "In", vec![ContextBinding::new("testInput")])).unwrap();
        model.add_node(Node::stage("first", "First").depends_on("in")).unwrap();
        model.add_node(Node::stage("left", "Left").depends_on("first")).unwrap();
        model.add_node(Node::stage("right", "Right").depends_on("first")).unwrap();
        model
            .add_node(Node::output("out", "Out", vec![]).depends_on("left").depends_on("right"))
            .unwrap();
        model
            .add_action(ActionNode::tether("boom", "first", "https://x.test").with_retry(fast_retry(1)))
            .unwrap();
        for (action, node) in [("l1", "left"), ("l2", "left"), ("r1", "right"), ("r2", "right")] {
            model
                .add_action(ActionNode::tether(action, node, "https://x.test").with_mode(ActionMode::Parallel))
                .unwrap();
        }
        model
    }

    #[tokio::test]
    async fn test_scale_down_serializes_rest_of_adaptive_run() {
        // Without a scale-down the wide stages overlap
        let gauge = Arc::new(Gauge::default());
        let h = Harness::new(vec![published(wide_model("calm"))], gauge.clone());
        let record = h.run("calm", RunMode::AdaptiveParallel).await;
        assert_eq!(record.state, ExecutionState::Completed);
        assert!(gauge.peak() >= 2);

        let policy = RecoveryPolicy {
            max_attempts: Some(2),
            ..RecoveryPolicy::new(ErrorType::ResourceExhaustion, RecoveryAction::ScaleDownAndRetry)
        };
        let model = with_policy(wide_model("strained"), policy);
        let gauge = Arc::new(Gauge::default());
        let router = RoutingHandler::new(gauge.clone())
            .route_action("boom", Arc::new(ScriptedHandler::fail_times(1, ErrorType::ResourceExhaustion)));
        let h = Harness::new(vec![published(model)], Arc::new(router));

        let record = h.run("strained", RunMode::AdaptiveParallel).await;
        assert_eq!(record.state, ExecutionState::CompletedWithRecovery);
        assert_eq!(record.action("boom").unwrap().status, ActionRunStatus::Recovered);
        assert_eq!(record.recoveries[0].recovery, Some(RecoveryAction::ScaleDownAndRetry));
        assert_eq!(gauge.peak(), 1);
        assert!(h.audit_ops().iter().any(|o| o == ops::RECOVERY_SCALE_DOWN));
    }
}
