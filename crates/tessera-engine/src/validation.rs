use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::{info, warn};

use tessera_core::error::{Result, TesseraError};
use tessera_core::event::{DomainEvent, EventBus};
use tessera_core::model::FunctionModel;
use tessera_core::traits::{AgentRegistry, LinkRepository, ModelRepository};
use tessera_core::types::{AgentId, ModelId, UserId};
use tessera_validator::{
    ModelSummary, PassKind, PassReport, ReferenceCatalog, ValidationContext, ValidationLevel,
    ValidationPass, ValidationPipeline, ValidationReport,
};

/// Stand-in cross-feature pass used when the reference catalog could not
/// be assembled; reports the lookup error as a failed pass.
struct CatalogUnavailable(String);

impl ValidationPass for CatalogUnavailable {
    fn kind(&self) -> PassKind {
        PassKind::CrossFeature
    }

    fn run(&self, _model: &FunctionModel, _ctx: &ValidationContext) -> Result<PassReport> {
        Err(TesseraError::Database(self.0.clone()))
    }
}

/// Runs the validation pipeline against a model with references resolved
/// from the stores.
pub struct ValidationService {
    models: Arc<dyn ModelRepository>,
    links: Arc<dyn LinkRepository>,
    agents: Arc<dyn AgentRegistry>,
    event_bus: Arc<EventBus>,
    max_cycle_length: usize,
}

impl ValidationService {
    pub fn new(
        models: Arc<dyn ModelRepository>,
        links: Arc<dyn LinkRepository>,
        agents: Arc<dyn AgentRegistry>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            models,
            links,
            agents,
            event_bus,
            max_cycle_length: ValidationContext::default().max_cycle_length,
        }
    }

    pub fn with_max_cycle_length(mut self, max: usize) -> Self {
        self.max_cycle_length = max;
        self
    }

    /// Everything `model` refers to: nested models (transitively, so
    /// nesting cycles are visible), agents named by actions or fallback
    /// policies, and all links.
    pub async fn catalog_for(&self, model: &FunctionModel) -> Result<ReferenceCatalog> {
        let mut catalog = ReferenceCatalog::new();

        let mut seen: HashSet<ModelId> = HashSet::from([model.id.clone()]);
        let mut queue: VecDeque<ModelId> = ModelSummary::of(model).nested.into_iter().collect();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(child) = self.models.find_by_id(&id).await? {
                queue.extend(ModelSummary::of(&child).nested);
                catalog.add_model(&child);
            }
        }

        let mut agent_ids: Vec<AgentId> = model
            .actions
            .iter()
            .filter_map(|a| a.kind.agent_id().cloned())
            .collect();
        agent_ids.extend(model.recovery_policies.iter().filter_map(|p| p.fallback_agent.clone()));
        agent_ids.sort();
        agent_ids.dedup();
        for id in &agent_ids {
            if let Some(agent) = self.agents.find(id).await? {
                catalog.add_agent(agent);
            }
        }

        for link in self.links.find_all().await? {
            catalog.add_link(link);
        }
        Ok(catalog)
    }

    /// Validate `model` at `level`. Never fails: store errors while
    /// resolving references surface as a failed cross-feature pass.
    pub async fn validate(
        &self,
        model: &FunctionModel,
        level: ValidationLevel,
        user: Option<&UserId>,
    ) -> ValidationReport {
        let (catalog, pipeline) = match self.catalog_for(model).await {
            Ok(catalog) => (catalog, ValidationPipeline::standard()),
            Err(e) => {
                warn!(model_id = %model.id, error = %e, "Could not resolve model references");
                (
                    ReferenceCatalog::new(),
                    ValidationPipeline::standard().with_pass(CatalogUnavailable(e.to_string())),
                )
            }
        };
        let ctx = ValidationContext {
            user: user.cloned(),
            catalog,
            max_cycle_length: self.max_cycle_length,
        };

        let report = pipeline.run(model, level, &ctx);
        info!(
            model_id = %model.id,
            level = level.as_str(),
            valid = report.overall_valid,
            errors = report.error_count(),
            warnings = report.warning_count(),
            "Validation completed"
        );
        self.event_bus.publish(DomainEvent::ValidationCompleted {
            model_id: model.id.clone(),
            level: level.as_str().to_string(),
            valid: report.overall_valid,
            error_count: report.error_count(),
            warning_count: report.warning_count(),
        });
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use futures::future::BoxFuture;
    use tessera_core::error::ErrorType;
    use tessera_core::model::{ActionNode, CrossFeatureLink, FeatureRef, NestedModelConfig, RecoveryPolicy};
    use tessera_memory::{InMemoryAgentRegistry, InMemoryLinkRepository, InMemoryModelRepository};
    use tessera_test_utils::{agent, linear_model, pipeline_model, published, with_actions};

    fn nested(id: &str, node: &str, child: &str) -> ActionNode {
        ActionNode::nested(
            id,
            node,
            NestedModelConfig {
                model_id: ModelId::from(child),
                input_mapping: BTreeMap::new(),
                output_mapping: BTreeMap::new(),
            },
        )
    }

    fn service(models: Vec<FunctionModel>, bus: Arc<EventBus>) -> ValidationService {
        ValidationService::new(
            Arc::new(InMemoryModelRepository::with_models(models)),
            Arc::new(InMemoryLinkRepository::new()),
            Arc::new(InMemoryAgentRegistry::with_agents(vec![agent("writer", &["draft"])])),
            bus,
        )
    }

    #[tokio::test]
    async fn test_catalog_follows_nesting_transitively() {
        let c = published(pipeline_model("c"));
        let b = published(with_actions(pipeline_model("b"), vec![nested("to_c", "stage", "c")]));
        let a = with_actions(
            pipeline_model("a"),
            vec![
                nested("to_b", "stage", "b"),
                ActionNode::agent_task("w", "stage", "writer", "draft"),
            ],
        );
        let a = {
            let mut a = a;
            a.add_recovery_policy(RecoveryPolicy::fallback(ErrorType::AgentFailure, "ghost")).unwrap();
            a
        };
        let svc = service(vec![b, c], Arc::new(EventBus::default()));

        let catalog = svc.catalog_for(&a).await.unwrap();
        assert!(catalog.model(&ModelId::from("b")).is_some());
        assert!(catalog.model(&ModelId::from("c")).is_some());
        assert!(catalog.agent(&AgentId::from("writer")).is_some());
        assert!(catalog.agent(&AgentId::from("ghost")).is_none());
    }

    #[tokio::test]
    async fn test_validate_publishes_summary() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let svc = service(vec![], bus.clone());

        let report = svc
            .validate(&linear_model("m1"), ValidationLevel::Full, Some(&UserId::from("tester")))
            .await;
        assert!(report.overall_valid, "{:?}", report.errors().collect::<Vec<_>>());

        match rx.try_recv().unwrap() {
            DomainEvent::ValidationCompleted { model_id, level, valid, .. } => {
                assert_eq!(model_id, ModelId::from("m1"));
                assert_eq!(level, "full");
                assert!(valid);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unresolved_nested_model_reported() {
        let svc = service(vec![], Arc::new(EventBus::default()));
        let model = with_actions(pipeline_model("m1"), vec![nested("sub", "stage", "nowhere")]);
        let report = svc.validate(&model, ValidationLevel::CrossFeature, None).await;
        assert!(!report.overall_valid);
        assert!(report.cross_feature.unwrap().has_code("UNRESOLVED_MODEL"));
    }

    struct BrokenLinks;

    impl LinkRepository for BrokenLinks {
        fn find_by_id<'a>(
            &'a self,
            _id: &'a tessera_core::types::LinkId,
        ) -> BoxFuture<'a, Result<Option<CrossFeatureLink>>> {
            Box::pin(async { Ok(None) })
        }

        fn save(&self, _link: CrossFeatureLink) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn delete<'a>(&'a self, _id: &'a tessera_core::types::LinkId) -> BoxFuture<'a, Result<bool>> {
            Box::pin(async { Ok(false) })
        }

        fn find_all(&self) -> BoxFuture<'_, Result<Vec<CrossFeatureLink>>> {
            Box::pin(async { Err(TesseraError::Database("link store offline".into())) })
        }

        fn find_by_entity<'a>(&'a self, _entity: &'a FeatureRef) -> BoxFuture<'a, Result<Vec<CrossFeatureLink>>> {
            Box::pin(async { Err(TesseraError::Database("link store offline".into())) })
        }
    }

    #[tokio::test]
    async fn test_store_failure_becomes_failed_pass() {
        let svc = ValidationService::new(
            Arc::new(InMemoryModelRepository::new()),
            Arc::new(BrokenLinks),
            Arc::new(InMemoryAgentRegistry::new()),
            Arc::new(EventBus::default()),
        );
        let report = svc.validate(&linear_model("m1"), ValidationLevel::Full, None).await;
        assert!(!report.overall_valid);
        assert!(report.structural.as_ref().unwrap().is_valid());
        let cross = report.cross_feature.unwrap();
        assert!(cross.errors.iter().any(|e| e.message.contains("link store offline")));
    }
}
