use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tessera_core::error::ActionFailure;
use tessera_core::event::{DomainEvent, EventBus};
use tessera_core::model::RetryPolicy;
use tessera_core::traits::{ActionOutput, ActionRequest, AgentRegistry};

use crate::handlers::HandlerSet;
use crate::retry::{run_with_retry, AttemptResult};

/// Terminal result of one action, retries included.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub result: AttemptResult,
    pub attempts: u32,
    pub duration_ms: u64,
}

/// Executes one action node to a terminal state under its retry policy and
/// records agent statistics.
pub struct ActionExecutionService {
    handlers: HandlerSet,
    agents: Option<Arc<dyn AgentRegistry>>,
    event_bus: Arc<EventBus>,
    default_retry: RetryPolicy,
    timeout: Duration,
}

impl ActionExecutionService {
    pub fn new(handlers: HandlerSet, event_bus: Arc<EventBus>) -> Self {
        Self {
            handlers,
            agents: None,
            event_bus,
            default_retry: RetryPolicy::none(),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_agents(mut self, agents: Arc<dyn AgentRegistry>) -> Self {
        self.agents = Some(agents);
        self
    }

    /// Policy used for actions that carry none.
    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn handlers(&self) -> &HandlerSet {
        &self.handlers
    }

    /// Retry policy in force for `request`'s action.
    pub fn policy_for(&self, request: &ActionRequest) -> RetryPolicy {
        request
            .action
            .retry
            .clone()
            .unwrap_or_else(|| self.default_retry.clone())
    }

    /// Execute an adapter action with its own retry policy.
    pub async fn execute(&self, request: ActionRequest, cancel: &CancellationToken) -> ActionOutcome {
        let policy = self.policy_for(&request);
        self.execute_with(request, &policy, cancel, |req| self.dispatch(req)).await
    }

    /// Execute with an explicit policy and attempt function. Nested-model
    /// actions come through here with the orchestrator as `attempt`.
    pub async fn execute_with<'a, F>(
        &'a self,
        request: ActionRequest,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        attempt: F,
    ) -> ActionOutcome
    where
        F: Fn(ActionRequest) -> BoxFuture<'a, Result<ActionOutput, ActionFailure>>,
    {
        let start = Instant::now();
        let action_id = request.action.id.clone();
        let agent_id = request.action.kind.agent_id().cloned();

        debug!(
            execution_id = %request.execution_id,
            action_id = %action_id,
            action_type = request.action.kind.label(),
            max_attempts = policy.max_attempts,
            "Executing action"
        );

        // Nested runs bound their own actions; the whole child run is not
        // held to a single action's timeout.
        let timeout = match request.action.kind.nested_model() {
            Some(_) => None,
            None => Some(self.timeout),
        };
        let outcome = run_with_retry(policy, timeout, cancel, |n| {
            let mut req = request.clone();
            req.attempt = n;
            attempt(req)
        })
        .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        if outcome.result != AttemptResult::Cancelled {
            let success = outcome.result.is_success();
            self.event_bus.publish(DomainEvent::ActionNodeExecuted {
                execution_id: request.execution_id.clone(),
                action_id: action_id.clone(),
                success,
                attempts: outcome.attempts,
                duration_ms,
            });

            if let (Some(agent_id), Some(agents)) = (agent_id, &self.agents) {
                match agents.record_execution(&agent_id, success, duration_ms).await {
                    Ok(stats) => {
                        info!(
                            agent_id = %agent_id,
                            success,
                            executions = stats.execution_count,
                            "Recorded agent execution"
                        );
                        self.event_bus.publish(DomainEvent::AgentExecutionRecorded {
                            agent_id,
                            success,
                            duration_ms,
                        });
                    }
                    Err(e) => {
                        warn!(agent_id = %agent_id, error = %e, "Failed to record agent execution");
                    }
                }
            }
        }

        ActionOutcome {
            result: outcome.result,
            attempts: outcome.attempts,
            duration_ms,
        }
    }

    /// One attempt through the handler registered for the action's type.
    pub fn dispatch(&self, request: ActionRequest) -> BoxFuture<'_, Result<ActionOutput, ActionFailure>> {
        match self.handlers.for_kind(&request.action.kind) {
            Some(handler) => handler.execute(request),
            None => Box::pin(async move {
                Err(ActionFailure::configuration(format!(
                    "action '{}' of type {} has no adapter handler",
                    request.action.id,
                    request.action.kind.label()
                )))
            }),
        }
    }
}
