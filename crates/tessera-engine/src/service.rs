use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{info, warn};

use tessera_core::audit::{ops, AuditEntry, AuditQuery};
use tessera_core::config::EngineConfig;
use tessera_core::error::{Result, TesseraError};
use tessera_core::event::{DomainEvent, EventBus};
use tessera_core::model::{ActionNode, AiAgent, FunctionModel, Node, RecoveryPolicy};
use tessera_core::traits::{AgentRegistry, AuditSink, LinkRepository, ModelRepository};
use tessera_core::types::{ActionId, ModelId, NodeId, RunMode, UserId};
use tessera_links::LinkService;
use tessera_validator::{validate_workflow, ValidationLevel, ValidationReport};

use crate::action_service::ActionExecutionService;
use crate::handlers::HandlerSet;
use crate::orchestrator::{ExecutionRecord, WorkflowOrchestrator};
use crate::validation::ValidationService;

/// Repositories the engine runs against.
#[derive(Clone)]
pub struct Stores {
    pub models: Arc<dyn ModelRepository>,
    pub links: Arc<dyn LinkRepository>,
    pub agents: Arc<dyn AgentRegistry>,
    pub audit: Arc<dyn AuditSink>,
}

/// Entry point for authoring, publishing and running function models.
pub struct FunctionModelService {
    models: Arc<dyn ModelRepository>,
    agents: Arc<dyn AgentRegistry>,
    audit: Arc<dyn AuditSink>,
    event_bus: Arc<EventBus>,
    validation: ValidationService,
    orchestrator: WorkflowOrchestrator,
    links: LinkService,
    default_mode: RunMode,
}

impl FunctionModelService {
    pub fn new(config: &EngineConfig, stores: Stores, handlers: HandlerSet, event_bus: Arc<EventBus>) -> Self {
        let actions = ActionExecutionService::new(handlers, event_bus.clone())
            .with_agents(stores.agents.clone())
            .with_default_retry(config.retry.to_policy())
            .with_timeout(Duration::from_secs(config.execution.action_timeout_secs));
        let orchestrator = WorkflowOrchestrator::new(
            stores.models.clone(),
            stores.links.clone(),
            stores.audit.clone(),
            event_bus.clone(),
            actions,
            config.execution.clone(),
        );
        let validation = ValidationService::new(
            stores.models.clone(),
            stores.links.clone(),
            stores.agents.clone(),
            event_bus.clone(),
        )
        .with_max_cycle_length(config.links.max_cycle_length);
        let links = LinkService::new(stores.links.clone(), event_bus.clone(), &config.links)
            .with_audit(stores.audit.clone());

        Self {
            models: stores.models,
            agents: stores.agents,
            audit: stores.audit,
            event_bus,
            validation,
            orchestrator,
            links,
            default_mode: config.execution.default_mode,
        }
    }

    pub fn links(&self) -> &LinkService {
        &self.links
    }

    pub fn orchestrator(&self) -> &WorkflowOrchestrator {
        &self.orchestrator
    }

    pub async fn create_model(
        &self,
        name: &str,
        description: Option<String>,
        user: &UserId,
    ) -> Result<FunctionModel> {
        let mut model = FunctionModel::new(name, user.clone());
        model.description = description;
        self.models.save(model.clone()).await?;

        info!(model_id = %model.id, name, user_id = %user, "Function model created");
        self.record(ops::MODEL_CREATED, model.id.as_str(), &model.id, user, json!({ "name": name }))
            .await;
        self.event_bus.publish(DomainEvent::FunctionModelCreated {
            model_id: model.id.clone(),
            name: model.name.clone(),
            user_id: user.clone(),
        });
        Ok(model)
    }

    /// Store a model authored elsewhere (e.g. loaded from JSON). Its owner
    /// must be the caller.
    pub async fn import_model(&self, model: FunctionModel, user: &UserId) -> Result<FunctionModel> {
        if !model.permissions.can_edit(user) {
            return Err(denied(user, "import"));
        }
        if self.models.find_by_id(&model.id).await?.is_some() {
            return Err(TesseraError::DuplicateId(model.id.to_string()));
        }
        self.models.save(model.clone()).await?;
        self.record(ops::MODEL_CREATED, model.id.as_str(), &model.id, user, json!({ "name": model.name, "imported": true }))
            .await;
        self.event_bus.publish(DomainEvent::FunctionModelCreated {
            model_id: model.id.clone(),
            name: model.name.clone(),
            user_id: user.clone(),
        });
        Ok(model)
    }

    pub async fn get_model(&self, id: &ModelId, user: &UserId) -> Result<FunctionModel> {
        let model = self.find(id).await?;
        if !model.permissions.can_view(user) {
            return Err(denied(user, "view"));
        }
        Ok(model)
    }

    pub async fn add_node(&self, model_id: &ModelId, node: Node, user: &UserId) -> Result<FunctionModel> {
        let mut model = self.load_for_edit(model_id, user).await?;
        let (node_id, node_type) = (node.id.clone(), node.kind.label());
        model.add_node(node)?;
        self.models.save(model.clone()).await?;

        self.record(ops::NODE_ADDED, node_id.as_str(), model_id, user, json!({ "node_type": node_type }))
            .await;
        self.event_bus.publish(DomainEvent::ContainerNodeAdded {
            model_id: model_id.clone(),
            node_id,
            node_type: node_type.to_string(),
        });
        Ok(model)
    }

    /// Remove a node together with its actions and every dependency on it.
    pub async fn remove_node(&self, model_id: &ModelId, node_id: &NodeId, user: &UserId) -> Result<FunctionModel> {
        let mut model = self.load_for_edit(model_id, user).await?;
        let dropped: Vec<ActionId> = model.actions_of(node_id).map(|a| a.id.clone()).collect();
        model.remove_node(node_id)?;
        self.models.save(model.clone()).await?;

        self.record(ops::NODE_REMOVED, node_id.as_str(), model_id, user, json!({ "dropped_actions": dropped }))
            .await;
        self.event_bus.publish(DomainEvent::ContainerNodeRemoved {
            model_id: model_id.clone(),
            node_id: node_id.clone(),
        });
        Ok(model)
    }

    pub async fn add_action(&self, model_id: &ModelId, action: ActionNode, user: &UserId) -> Result<FunctionModel> {
        let mut model = self.load_for_edit(model_id, user).await?;
        let (action_id, node_id, action_type) = (action.id.clone(), action.node_id.clone(), action.kind.label());
        model.add_action(action)?;
        self.models.save(model.clone()).await?;

        self.record(
            ops::ACTION_ADDED,
            action_id.as_str(),
            model_id,
            user,
            json!({ "node_id": node_id, "action_type": action_type }),
        )
        .await;
        self.event_bus.publish(DomainEvent::ActionNodeAdded {
            model_id: model_id.clone(),
            node_id,
            action_id,
            action_type: action_type.to_string(),
        });
        Ok(model)
    }

    pub async fn remove_action(&self, model_id: &ModelId, action_id: &ActionId, user: &UserId) -> Result<FunctionModel> {
        let mut model = self.load_for_edit(model_id, user).await?;
        model.remove_action(action_id)?;
        self.models.save(model.clone()).await?;

        self.record(ops::ACTION_REMOVED, action_id.as_str(), model_id, user, Value::Null).await;
        self.event_bus.publish(DomainEvent::ActionNodeRemoved {
            model_id: model_id.clone(),
            action_id: action_id.clone(),
        });
        Ok(model)
    }

    pub async fn set_dependencies(
        &self,
        model_id: &ModelId,
        node_id: &NodeId,
        dependencies: Vec<NodeId>,
        user: &UserId,
    ) -> Result<FunctionModel> {
        let mut model = self.load_for_edit(model_id, user).await?;
        model.set_dependencies(node_id, dependencies)?;
        self.models.save(model.clone()).await?;
        Ok(model)
    }

    pub async fn add_recovery_policy(
        &self,
        model_id: &ModelId,
        policy: RecoveryPolicy,
        user: &UserId,
    ) -> Result<FunctionModel> {
        let mut model = self.load_for_edit(model_id, user).await?;
        if let Some(problem) = policy.configuration_problem() {
            return Err(TesseraError::InvalidModel(problem));
        }
        model.add_recovery_policy(policy)?;
        self.models.save(model.clone()).await?;
        Ok(model)
    }

    pub async fn validate(&self, model_id: &ModelId, level: ValidationLevel, user: &UserId) -> Result<ValidationReport> {
        let model = self.get_model(model_id, user).await?;
        Ok(self.validation.validate(&model, level, Some(user)).await)
    }

    /// Draft -> Published, gated on structural validity.
    pub async fn publish(&self, model_id: &ModelId, user: &UserId) -> Result<FunctionModel> {
        let mut model = self.load_for_edit(model_id, user).await?;
        let gate = validate_workflow(&model);
        if !gate.is_valid() {
            warn!(model_id = %model_id, errors = gate.errors.len(), "Publish rejected");
            return Err(TesseraError::InvalidWorkflow(gate.error_summary()));
        }
        model.publish()?;
        self.models.save(model.clone()).await?;

        let version = model.version.to_string();
        info!(model_id = %model_id, version = %version, "Function model published");
        self.record(ops::MODEL_PUBLISHED, model_id.as_str(), model_id, user, json!({ "version": version }))
            .await;
        self.event_bus.publish(DomainEvent::FunctionModelPublished {
            model_id: model_id.clone(),
            version,
        });
        Ok(model)
    }

    pub async fn archive(&self, model_id: &ModelId, user: &UserId) -> Result<FunctionModel> {
        let mut model = self.load_for_edit(model_id, user).await?;
        model.archive()?;
        self.models.save(model.clone()).await?;

        self.record(ops::MODEL_ARCHIVED, model_id.as_str(), model_id, user, Value::Null).await;
        self.event_bus.publish(DomainEvent::FunctionModelArchived {
            model_id: model_id.clone(),
        });
        Ok(model)
    }

    /// New draft derived from a published or archived model.
    pub async fn create_version(&self, model_id: &ModelId, user: &UserId) -> Result<FunctionModel> {
        let current = self.load_for_edit(model_id, user).await?;
        let next = current.next_version()?;
        self.models.save(next.clone()).await?;

        let version = next.version.to_string();
        self.record(
            ops::MODEL_VERSIONED,
            next.id.as_str(),
            &next.id,
            user,
            json!({ "previous_model_id": model_id, "version": version }),
        )
        .await;
        self.event_bus.publish(DomainEvent::FunctionModelVersionCreated {
            model_id: next.id.clone(),
            previous_model_id: model_id.clone(),
            version,
        });
        Ok(next)
    }

    /// Soft delete. The model stays readable in the store but can no
    /// longer be edited or executed.
    pub async fn delete(&self, model_id: &ModelId, user: &UserId) -> Result<()> {
        let mut model = self.load_for_edit(model_id, user).await?;
        model.soft_delete();
        self.models.save(model).await?;

        self.record(ops::MODEL_DELETED, model_id.as_str(), model_id, user, Value::Null).await;
        self.event_bus.publish(DomainEvent::FunctionModelDeleted {
            model_id: model_id.clone(),
        });
        Ok(())
    }

    /// Execute a published model; `mode` falls back to the configured default.
    pub async fn execute(
        &self,
        model_id: &ModelId,
        mode: Option<RunMode>,
        input: Map<String, Value>,
        user: &UserId,
    ) -> Result<ExecutionRecord> {
        self.orchestrator
            .execute(model_id, mode.unwrap_or(self.default_mode), input, user)
            .await
    }

    pub async fn audit_trail(&self, query: AuditQuery) -> Result<Vec<AuditEntry>> {
        self.audit.query(query).await
    }

    /// Enabled agents ranked for `capabilities`.
    pub async fn discover_agents(&self, capabilities: &[String], limit: usize) -> Result<Vec<AiAgent>> {
        self.agents.discover(capabilities, limit).await
    }

    async fn find(&self, id: &ModelId) -> Result<FunctionModel> {
        let model = self
            .models
            .find_by_id(id)
            .await?
            .ok_or_else(|| TesseraError::ModelNotFound(id.to_string()))?;
        if model.deleted {
            return Err(TesseraError::ModelDeleted(id.to_string()));
        }
        Ok(model)
    }

    async fn load_for_edit(&self, id: &ModelId, user: &UserId) -> Result<FunctionModel> {
        let model = self.find(id).await?;
        if !model.permissions.can_edit(user) {
            return Err(denied(user, "edit"));
        }
        Ok(model)
    }

    async fn record(&self, op: &str, entity: &str, model_id: &ModelId, user: &UserId, details: Value) {
        let entry = AuditEntry::new(op, entity, user)
            .for_model(model_id)
            .with_details(details);
        if let Err(e) = self.audit.save(entry).await {
            warn!(model_id = %model_id, op, error = %e, "Failed to write audit entry");
        }
    }
}

fn denied(user: &UserId, operation: &str) -> TesseraError {
    TesseraError::PermissionDenied {
        user: user.to_string(),
        operation: operation.to_string(),
    }
}
