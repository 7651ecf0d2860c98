use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Method, StatusCode};
use tracing::debug;

use tessera_core::error::{ActionFailure, ErrorType};
use tessera_core::model::{ActionKind, TetherAuth, TetherConfig};
use tessera_core::traits::{ActionHandler, ActionOutput, ActionRequest};

/// One handler per adapter action type. Nested models are not dispatched
/// here; the orchestrator runs them itself.
#[derive(Clone)]
pub struct HandlerSet {
    tether: Arc<dyn ActionHandler>,
    knowledge_base: Arc<dyn ActionHandler>,
    ai_agent: Arc<dyn ActionHandler>,
}

impl HandlerSet {
    /// HTTP tether handler; knowledge-base and agent actions fail until a
    /// handler is installed.
    pub fn new() -> Self {
        Self {
            tether: Arc::new(HttpTetherHandler::new()),
            knowledge_base: Arc::new(UnconfiguredHandler::new("knowledge_base")),
            ai_agent: Arc::new(UnconfiguredHandler::new("ai_agent")),
        }
    }

    pub fn with_tether(mut self, handler: Arc<dyn ActionHandler>) -> Self {
        self.tether = handler;
        self
    }

    pub fn with_knowledge_base(mut self, handler: Arc<dyn ActionHandler>) -> Self {
        self.knowledge_base = handler;
        self
    }

    pub fn with_ai_agent(mut self, handler: Arc<dyn ActionHandler>) -> Self {
        self.ai_agent = handler;
        self
    }

    pub fn for_kind(&self, kind: &ActionKind) -> Option<&Arc<dyn ActionHandler>> {
        match kind {
            ActionKind::Tether(_) => Some(&self.tether),
            ActionKind::KnowledgeBase(_) => Some(&self.knowledge_base),
            ActionKind::AiAgent(_) => Some(&self.ai_agent),
            ActionKind::FunctionModel(_) => None,
        }
    }
}

impl Default for HandlerSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Rejects every request with a configuration failure.
pub struct UnconfiguredHandler {
    kind: &'static str,
}

impl UnconfiguredHandler {
    pub fn new(kind: &'static str) -> Self {
        Self { kind }
    }
}

impl ActionHandler for UnconfiguredHandler {
    fn name(&self) -> &str {
        self.kind
    }

    fn execute(&self, request: ActionRequest) -> BoxFuture<'_, Result<ActionOutput, ActionFailure>> {
        Box::pin(async move {
            Err(ActionFailure::configuration(format!(
                "no {} handler is installed for action '{}'",
                self.kind, request.action.id
            )))
        })
    }
}

/// Calls the tether endpoint with the resolved inputs as a JSON body.
///
/// Credentials are referenced by environment variable name in the model and
/// resolved at call time. A JSON object response becomes the action output;
/// anything else is stored under `result`.
pub struct HttpTetherHandler {
    client: reqwest::Client,
}

impl HttpTetherHandler {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpTetherHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn secret(reference: &str) -> Result<String, ActionFailure> {
    std::env::var(reference).map_err(|_| {
        ActionFailure::configuration(format!("credential variable '{}' is not set", reference))
    })
}

fn classify_status(status: StatusCode, body: &str) -> ActionFailure {
    let message = format!("endpoint returned {}: {}", status, body.chars().take(200).collect::<String>());
    if status == StatusCode::TOO_MANY_REQUESTS {
        ActionFailure::new(ErrorType::ResourceExhaustion, message)
    } else if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        ActionFailure::timeout(message)
    } else if status.is_server_error() {
        ActionFailure::new(ErrorType::ExternalService, message)
    } else {
        ActionFailure::fatal(ErrorType::ExternalService, message)
    }
}

fn build_request(
    client: &reqwest::Client,
    cfg: &TetherConfig,
    request: &ActionRequest,
) -> Result<reqwest::RequestBuilder, ActionFailure> {
    let method = Method::from_bytes(cfg.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| ActionFailure::configuration(format!("invalid HTTP method '{}'", cfg.method)))?;

    let mut req = client.request(method.clone(), cfg.endpoint.trim());
    req = if method == Method::GET || method == Method::DELETE {
        let query: Vec<(String, String)> = request
            .inputs
            .iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k.clone(), s.clone()),
                other => (k.clone(), other.to_string()),
            })
            .collect();
        req.query(&query)
    } else {
        req.json(&request.inputs)
    };

    for (name, value) in &cfg.headers {
        req = req.header(name.as_str(), value.as_str());
    }
    req = req
        .header("x-tessera-execution", request.execution_id.as_str())
        .header("x-tessera-attempt", request.attempt.to_string());

    req = match &cfg.auth {
        None => req,
        Some(TetherAuth::Bearer { token_ref }) => req.bearer_auth(secret(token_ref)?),
        Some(TetherAuth::ApiKey { header, key_ref }) => req.header(header.as_str(), secret(key_ref)?),
        Some(TetherAuth::Basic {
            username,
            password_ref,
        }) => req.basic_auth(username, Some(secret(password_ref)?)),
    };

    if let Some(ms) = cfg.timeout_ms {
        req = req.timeout(Duration::from_millis(ms));
    }
    Ok(req)
}

impl ActionHandler for HttpTetherHandler {
    fn name(&self) -> &str {
        "http_tether"
    }

    fn execute(&self, request: ActionRequest) -> BoxFuture<'_, Result<ActionOutput, ActionFailure>> {
        Box::pin(async move {
            let ActionKind::Tether(cfg) = &request.action.kind else {
                return Err(ActionFailure::configuration(format!(
                    "action '{}' is not a tether",
                    request.action.id
                )));
            };

            debug!(
                action_id = %request.action.id,
                endpoint = %cfg.endpoint,
                method = %cfg.method,
                attempt = request.attempt,
                "Calling tether endpoint"
            );

            let resp = build_request(&self.client, cfg, &request)?
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        ActionFailure::timeout(format!("tether request timed out: {}", e))
                    } else if e.is_builder() {
                        ActionFailure::configuration(format!("invalid tether request: {}", e))
                    } else {
                        ActionFailure::new(ErrorType::ExternalService, format!("tether request failed: {}", e))
                    }
                })?;

            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            if !status.is_success() {
                return Err(classify_status(status, &body));
            }

            if body.trim().is_empty() {
                return Ok(ActionOutput::empty());
            }
            Ok(match serde_json::from_str::<serde_json::Value>(&body) {
                Ok(value) => ActionOutput::from_value(value),
                Err(_) => ActionOutput::empty().with("result", serde_json::Value::String(body)),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::model::ActionNode;
    use tessera_core::types::{ExecutionId, ModelId};

    fn request(action: ActionNode) -> ActionRequest {
        ActionRequest {
            execution_id: ExecutionId::from("e1"),
            model_id: ModelId::from("m1"),
            action,
            inputs: Default::default(),
            attempt: 0,
        }
    }

    #[test]
    fn test_dispatch_by_kind() {
        let set = HandlerSet::new();
        let tether = ActionNode::tether("t", "s", "https://x.test");
        assert_eq!(set.for_kind(&tether.kind).unwrap().name(), "http_tether");
        let agent = ActionNode::agent_task("a", "s", "writer", "draft");
        assert_eq!(set.for_kind(&agent.kind).unwrap().name(), "ai_agent");
        let nested = ActionNode::nested(
            "n",
            "s",
            tessera_core::model::NestedModelConfig {
                model_id: ModelId::from("child"),
                input_mapping: Default::default(),
                output_mapping: Default::default(),
            },
        );
        assert!(set.for_kind(&nested.kind).is_none());
    }

    #[tokio::test]
    async fn test_unconfigured_handler_is_configuration_failure() {
        let handler = UnconfiguredHandler::new("knowledge_base");
        let failure = handler
            .execute(request(ActionNode::agent_task("a", "s", "x", "y")))
            .await
            .unwrap_err();
        assert_eq!(failure.error_type, ErrorType::Configuration);
        assert!(!failure.retryable);
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "").error_type,
            ErrorType::ResourceExhaustion
        );
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").retryable);
        assert_eq!(classify_status(StatusCode::GATEWAY_TIMEOUT, "").error_type, ErrorType::Timeout);
        assert!(!classify_status(StatusCode::NOT_FOUND, "").retryable);
    }

    #[tokio::test]
    async fn test_missing_credential_is_configuration_failure() {
        let mut action = ActionNode::tether("t", "s", "https://x.test");
        if let ActionKind::Tether(cfg) = &mut action.kind {
            cfg.auth = Some(TetherAuth::Bearer {
                token_ref: "TESSERA_TEST_TOKEN_THAT_IS_NOT_SET".into(),
            });
        }
        let failure = HttpTetherHandler::new().execute(request(action)).await.unwrap_err();
        assert_eq!(failure.error_type, ErrorType::Configuration);
        assert!(failure.message.contains("TESSERA_TEST_TOKEN_THAT_IS_NOT_SET"));
    }

    #[tokio::test]
    async fn test_invalid_method() {
        let mut action = ActionNode::tether("t", "s", "https://x.test");
        if let ActionKind::Tether(cfg) = &mut action.kind {
            cfg.method = "NOT A METHOD".into();
        }
        let failure = HttpTetherHandler::new().execute(request(action)).await.unwrap_err();
        assert_eq!(failure.error_type, ErrorType::Configuration);
    }
}
