//! Scripted action handlers and model fixtures shared by Tessera tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use tessera_core::error::{ActionFailure, ErrorType};
use tessera_core::model::{ActionNode, AiAgent, ContextBinding, FunctionModel, Node, RetryPolicy};
use tessera_core::traits::{ActionHandler, ActionOutput, ActionRequest};
use tessera_core::types::{ActionId, AgentId};

#[derive(Debug, Clone)]
enum Script {
    Succeed(Value),
    /// Returns the resolved inputs as the output.
    Echo,
    /// Fails the first `n` calls, then succeeds.
    FailTimes(u32, ErrorType),
    AlwaysFail(ErrorType),
}

/// Action handler with a fixed script that counts and records its calls.
pub struct ScriptedHandler {
    script: Script,
    calls: AtomicU32,
    requests: Mutex<Vec<ActionRequest>>,
    delay: Option<Duration>,
}

impl ScriptedHandler {
    fn with_script(script: Script) -> Self {
        Self {
            script,
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Always succeed with `output` (objects become the output map).
    pub fn succeed(output: Value) -> Self {
        Self::with_script(Script::Succeed(output))
    }

    pub fn echo() -> Self {
        Self::with_script(Script::Echo)
    }

    pub fn fail_times(n: u32, error_type: ErrorType) -> Self {
        Self::with_script(Script::FailTimes(n, error_type))
    }

    pub fn always_fail(error_type: ErrorType) -> Self {
        Self::with_script(Script::AlwaysFail(error_type))
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request received so far, in call order.
    pub fn requests(&self) -> Vec<ActionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl ActionHandler for ScriptedHandler {
    fn name(&self) -> &str {
        "scripted"
    }

    fn execute(&self, request: ActionRequest) -> BoxFuture<'_, Result<ActionOutput, ActionFailure>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(request.clone());
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            match &self.script {
                Script::Succeed(value) => Ok(ActionOutput::from_value(value.clone())),
                Script::Echo => Ok(ActionOutput {
                    values: request.inputs.clone(),
                }),
                Script::FailTimes(n, error_type) if call < *n => Err(ActionFailure::new(
                    *error_type,
                    format!("scripted failure {} of {}", call + 1, n),
                )),
                Script::FailTimes(..) => Ok(ActionOutput::empty().with("attempt", json!(call + 1))),
                Script::AlwaysFail(error_type) => Err(ActionFailure::new(
                    *error_type,
                    format!("scripted failure for '{}'", request.action.id),
                )),
            }
        })
    }
}

/// Routes requests to per-agent, then per-action handlers, then a default.
pub struct RoutingHandler {
    default: Arc<dyn ActionHandler>,
    by_action: HashMap<ActionId, Arc<dyn ActionHandler>>,
    by_agent: HashMap<AgentId, Arc<dyn ActionHandler>>,
}

impl RoutingHandler {
    pub fn new(default: Arc<dyn ActionHandler>) -> Self {
        Self {
            default,
            by_action: HashMap::new(),
            by_agent: HashMap::new(),
        }
    }

    pub fn route_action(mut self, action: &str, handler: Arc<dyn ActionHandler>) -> Self {
        self.by_action.insert(ActionId::from(action), handler);
        self
    }

    pub fn route_agent(mut self, agent: &str, handler: Arc<dyn ActionHandler>) -> Self {
        self.by_agent.insert(AgentId::from(agent), handler);
        self
    }
}

impl ActionHandler for RoutingHandler {
    fn name(&self) -> &str {
        "routing"
    }

    fn execute(&self, request: ActionRequest) -> BoxFuture<'_, Result<ActionOutput, ActionFailure>> {
        let handler = request
            .action
            .kind
            .agent_id()
            .and_then(|a| self.by_agent.get(a))
            .or_else(|| self.by_action.get(&request.action.id))
            .unwrap_or(&self.default);
        handler.execute(request)
    }
}

/// Retry policy with 1ms delays.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay_ms: 1,
        backoff_multiplier: 1.0,
        max_delay_ms: None,
    }
}

/// `in` (writes `testInput`) -> `stage` -> `out`, no actions.
pub fn pipeline_model(id: &str) -> FunctionModel {
    let mut model = FunctionModel::with_id(id, format!("{} pipeline", id), "tester");
    model.description = Some("fixture".into());
    let nodes = [
        Node::input("in", "Input", vec![ContextBinding::new("testInput")]),
        Node::stage("stage", "Stage").depends_on("in"),
        Node::output("out", "Output", vec![]).depends_on("stage"),
    ];
    for node in nodes {
        if let Err(e) = model.add_node(node) {
            panic!("fixture node rejected: {}", e);
        }
    }
    model
}

/// [`pipeline_model`] with one tether action `call` under `stage`.
pub fn linear_model(id: &str) -> FunctionModel {
    with_actions(
        pipeline_model(id),
        vec![ActionNode::tether("call", "stage", "https://api.example.com/run")],
    )
}

pub fn with_actions(mut model: FunctionModel, actions: Vec<ActionNode>) -> FunctionModel {
    for action in actions {
        if let Err(e) = model.add_action(action) {
            panic!("fixture action rejected: {}", e);
        }
    }
    model
}

pub fn published(mut model: FunctionModel) -> FunctionModel {
    if let Err(e) = model.publish() {
        panic!("fixture could not be published: {}", e);
    }
    model
}

pub fn agent(id: &str, capabilities: &[&str]) -> AiAgent {
    AiAgent::new(id, id).with_capabilities(capabilities.iter().map(|c| c.to_string()).collect())
}
