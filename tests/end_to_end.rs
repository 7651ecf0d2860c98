use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Map};

use tessera_core::audit::AuditQuery;
use tessera_core::config::EngineConfig;
use tessera_core::error::{ErrorType, TesseraError};
use tessera_core::event::{DomainEvent, EventBus};
use tessera_core::model::{
    ActionNode, ContextBinding, FeatureRef, LinkType, ModelStatus, NestedModelConfig, Node, RecoveryPolicy,
};
use tessera_core::types::{AgentId, ExecutionState, ModelId, RunMode, UserId};
use tessera_engine::{FunctionModelService, HandlerSet, Stores};
use tessera_links::{StrengthOptions, StrengthSignals};
use tessera_memory::{InMemoryAgentRegistry, InMemoryLinkRepository, InMemoryModelRepository, MemoryAuditLog};
use tessera_test_utils::{agent, RoutingHandler, ScriptedHandler};
use tessera_validator::ValidationLevel;

struct Engine {
    service: FunctionModelService,
    audit: Arc<MemoryAuditLog>,
    agents: Arc<InMemoryAgentRegistry>,
    events: Arc<Mutex<Vec<DomainEvent>>>,
}

fn engine(handlers: HandlerSet) -> Engine {
    let bus = Arc::new(EventBus::default());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    bus.subscribe_to("*", move |e| {
        if let Ok(mut events) = sink.lock() {
            events.push(e.clone());
        }
    });

    let audit = Arc::new(MemoryAuditLog::new());
    let agents = Arc::new(InMemoryAgentRegistry::with_agents(vec![
        agent("primary", &["classify"]),
        agent("backup", &["classify"]),
    ]));
    let stores = Stores {
        models: Arc::new(InMemoryModelRepository::new()),
        links: Arc::new(InMemoryLinkRepository::new()),
        agents: agents.clone(),
        audit: audit.clone(),
    };
    Engine {
        service: FunctionModelService::new(&EngineConfig::default(), stores, handlers, bus),
        audit,
        agents,
        events,
    }
}

impl Engine {
    fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.name()).collect()
    }
}

/// in -> stage(action) -> out, authored through the service.
async fn author(svc: &FunctionModelService, name: &str, user: &UserId, action: ActionNode) -> ModelId {
    let id = svc.create_model(name, Some("end to end".into()), user).await.unwrap().id;
    svc.add_node(&id, Node::input("in", "Input", vec![ContextBinding::new("testInput")]), user)
        .await
        .unwrap();
    svc.add_node(&id, Node::stage("stage", "Stage").depends_on("in"), user).await.unwrap();
    svc.add_action(&id, action, user).await.unwrap();
    svc.add_node(&id, Node::output("out", "Output", vec![]).depends_on("stage"), user)
        .await
        .unwrap();
    id
}

fn position(names: &[&str], name: &str) -> usize {
    names
        .iter()
        .position(|n| *n == name)
        .unwrap_or_else(|| panic!("{} not emitted: {:?}", name, names))
}

#[tokio::test]
async fn test_author_validate_publish_execute() {
    let e = engine(HandlerSet::new().with_tether(Arc::new(ScriptedHandler::echo())));
    let user = UserId::from("alice");
    let id = author(&e.service, "Orders", &user, ActionNode::tether("call", "stage", "https://api.example.com/run")).await;

    let report = e.service.validate(&id, ValidationLevel::Full, &user).await.unwrap();
    assert!(report.overall_valid, "{:?}", report.errors().collect::<Vec<_>>());
    let model = e.service.publish(&id, &user).await.unwrap();
    assert_eq!(model.status, ModelStatus::Published);

    let mut input = Map::new();
    input.insert("testInput".into(), json!("x"));
    let record = e.service.execute(&id, None, input, &user).await.unwrap();
    assert_eq!(record.state, ExecutionState::Completed);
    assert_eq!(record.outputs["testInput"], "x");

    let names = e.names();
    assert_eq!(names.iter().filter(|n| **n == "ContainerNodeAdded").count(), 3);
    let created = position(&names, "FunctionModelCreated");
    let first_node = position(&names, "ContainerNodeAdded");
    let action = position(&names, "ActionNodeAdded");
    let published = position(&names, "FunctionModelPublished");
    let executed = position(&names, "FunctionModelExecuted");
    assert!(created < first_node && first_node < action && action < published && published < executed);
}

#[tokio::test]
async fn test_unpublished_execution_has_no_side_effects() {
    let e = engine(HandlerSet::new().with_tether(Arc::new(ScriptedHandler::echo())));
    let user = UserId::from("alice");
    let id = author(&e.service, "Draft", &user, ActionNode::tether("call", "stage", "https://api.example.com/run")).await;
    let before = e.audit.entries().len();
    let events_before = e.names().len();

    let err = e.service.execute(&id, Some(RunMode::Parallel), Map::new(), &user).await.unwrap_err();
    assert!(matches!(err, TesseraError::NotPublished(_)));
    assert!(err.to_string().contains("must be published"));
    assert_eq!(e.audit.entries().len(), before);
    assert_eq!(e.names().len(), events_before);
}

#[tokio::test]
async fn test_publish_requires_io_boundaries() {
    let e = engine(HandlerSet::new());
    let user = UserId::from("alice");
    let id = e.service.create_model("Stages only", None, &user).await.unwrap().id;
    e.service.add_node(&id, Node::stage("a", "A"), &user).await.unwrap();
    e.service
        .add_action(&id, ActionNode::tether("t", "a", "https://api.example.com/run"), &user)
        .await
        .unwrap();

    let err = e.service.publish(&id, &user).await.unwrap_err();
    assert!(err.to_string().starts_with("Cannot publish invalid workflow"));
}

#[tokio::test]
async fn test_fallback_emits_single_event_and_audits_both_agents() {
    let router = RoutingHandler::new(Arc::new(ScriptedHandler::succeed(json!({"label": "ok"}))))
        .route_agent("primary", Arc::new(ScriptedHandler::always_fail(ErrorType::AgentFailure)));
    let e = engine(HandlerSet::new().with_ai_agent(Arc::new(router)));
    let user = UserId::from("alice");
    let id = author(&e.service, "Triage", &user, ActionNode::agent_task("classify", "stage", "primary", "classify")).await;
    e.service
        .add_recovery_policy(&id, RecoveryPolicy::fallback(ErrorType::AgentFailure, "backup"), &user)
        .await
        .unwrap();
    e.service.publish(&id, &user).await.unwrap();

    let record = e.service.execute(&id, None, Map::new(), &user).await.unwrap();
    assert_eq!(record.state, ExecutionState::CompletedWithFallback);

    let fallbacks: Vec<(AgentId, AgentId)> = e
        .events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|ev| match ev {
            DomainEvent::AiAgentFallbackTriggered {
                original_agent,
                fallback_agent,
                ..
            } => Some((original_agent.clone(), fallback_agent.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(fallbacks, vec![(AgentId::from("primary"), AgentId::from("backup"))]);

    let trail = e
        .service
        .audit_trail(AuditQuery {
            action: Some("RECOVERY_FALLBACK_AGENT".into()),
            ..AuditQuery::for_model(&id)
        })
        .await
        .unwrap();
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].details["original_agent"], "primary");
    assert_eq!(trail[0].details["fallback_agent"], "backup");

    // Both agents carry statistics from the run
    use tessera_core::traits::AgentRegistry;
    let primary = e.agents.find(&AgentId::from("primary")).await.unwrap().unwrap();
    let backup = e.agents.find(&AgentId::from("backup")).await.unwrap().unwrap();
    assert_eq!(primary.stats.failure_count, 1);
    assert_eq!(backup.stats.success_count, 1);
}

#[tokio::test]
async fn test_nested_execution_keeps_scopes_apart() {
    let inner = Arc::new(ScriptedHandler::succeed(json!({"total": 10, "internal": "hidden"})));
    let router = RoutingHandler::new(Arc::new(ScriptedHandler::echo())).route_action("compute", inner.clone());
    let e = engine(HandlerSet::new().with_tether(Arc::new(router)));
    let user = UserId::from("alice");

    let child = e.service.create_model("Child", None, &user).await.unwrap().id;
    e.service
        .add_node(&child, Node::input("in", "In", vec![ContextBinding::new("payload")]), &user)
        .await
        .unwrap();
    e.service
        .add_node(&child, Node::stage("work", "Work").depends_on("in"), &user)
        .await
        .unwrap();
    e.service
        .add_action(&child, ActionNode::tether("compute", "work", "https://api.example.com/total"), &user)
        .await
        .unwrap();
    e.service
        .add_node(&child, Node::output("out", "Out", vec![ContextBinding::new("total")]).depends_on("work"), &user)
        .await
        .unwrap();
    e.service.publish(&child, &user).await.unwrap();

    let nested = ActionNode::nested(
        "sub",
        "stage",
        NestedModelConfig {
            model_id: child.clone(),
            input_mapping: BTreeMap::from([("testInput".to_string(), "payload".to_string())]),
            output_mapping: BTreeMap::from([("total".to_string(), "grandTotal".to_string())]),
        },
    );
    let parent = author(&e.service, "Parent", &user, nested).await;
    e.service.publish(&parent, &user).await.unwrap();

    let mut input = Map::new();
    input.insert("testInput".into(), json!("x"));
    input.insert("secret".into(), json!("parent only"));
    let record = e.service.execute(&parent, None, input, &user).await.unwrap();
    assert_eq!(record.state, ExecutionState::Completed);

    let seen = &inner.requests()[0].inputs;
    assert_eq!(seen["payload"], "x");
    assert!(!seen.contains_key("secret"));
    assert!(!seen.contains_key("testInput"));

    assert_eq!(record.outputs["grandTotal"], 10);
    assert!(!record.outputs.contains_key("total"));
    assert!(!record.outputs.contains_key("internal"));
    assert_eq!(record.children.len(), 1);
}

#[tokio::test]
async fn test_reference_link_strength_recompute() {
    let e = engine(HandlerSet::new());
    let user = UserId::from("alice");
    let links = e.service.links();

    let link = links
        .create_link(
            FeatureRef::model("orders"),
            FeatureRef::model("billing"),
            LinkType::References,
            0.75,
            None,
            &user,
        )
        .await
        .unwrap();
    for _ in 0..5 {
        links.record_interaction(&link.id);
    }

    let options = StrengthOptions {
        frequency: true,
        semantic: true,
        context: false,
    };
    let signals = StrengthSignals {
        interaction_count: 0,
        semantic_similarity: 0.6,
        context_relevance: 0.0,
    };
    let breakdown = links.recalculate_strength(&link.id, options, signals.clone(), &user).await.unwrap();
    assert!(breakdown.final_strength >= 0.75);
    assert!(breakdown.final_strength <= 1.0);
    assert!(breakdown.frequency_bonus > 0.0);

    let stored = links.get_link(&link.id).await.unwrap();
    assert_eq!(stored.strength, breakdown.final_strength);
    assert!(e.names().contains(&"LinkStrengthUpdated"));

    let again = links.recalculate_strength(&link.id, options, signals, &user).await.unwrap();
    assert_eq!(again.final_strength, breakdown.final_strength);
}

#[tokio::test]
async fn test_empty_link_graph_has_no_cycles() {
    let e = engine(HandlerSet::new());
    let report = e.service.links().detect_cycles().await.unwrap();
    assert_eq!(report.total_cycles, 0);
    assert!(report.cycles.is_empty());
    assert_eq!(report.average_cycle_length, 0.0);
    assert!(e.names().contains(&"CyclesDetected"));
}
