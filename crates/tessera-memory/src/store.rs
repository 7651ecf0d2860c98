use std::collections::HashMap;

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::debug;

use tessera_core::error::{Result, TesseraError};
use tessera_core::model::{AiAgent, CrossFeatureLink, ExecutionStats, FeatureRef, FunctionModel};
use tessera_core::traits::{AgentRegistry, LinkRepository, ModelRepository};
use tessera_core::types::{AgentId, LinkId, ModelId};

/// Function models held in process memory.
#[derive(Default)]
pub struct InMemoryModelRepository {
    models: RwLock<HashMap<ModelId, FunctionModel>>,
}

impl InMemoryModelRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the repository (fixtures, CLI file loading).
    pub fn with_models(models: impl IntoIterator<Item = FunctionModel>) -> Self {
        Self {
            models: RwLock::new(models.into_iter().map(|m| (m.id.clone(), m)).collect()),
        }
    }
}

impl ModelRepository for InMemoryModelRepository {
    fn find_by_id<'a>(&'a self, id: &'a ModelId) -> BoxFuture<'a, Result<Option<FunctionModel>>> {
        Box::pin(async move { Ok(self.models.read().await.get(id).cloned()) })
    }

    fn save(&self, model: FunctionModel) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            debug!(model_id = %model.id, status = %model.status, "Saving model");
            self.models.write().await.insert(model.id.clone(), model);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, id: &'a ModelId) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { Ok(self.models.write().await.remove(id).is_some()) })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<FunctionModel>>> {
        Box::pin(async move {
            let mut models: Vec<_> = self.models.read().await.values().cloned().collect();
            models.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
            Ok(models)
        })
    }
}

/// Cross-feature links held in process memory, in creation order.
#[derive(Default)]
pub struct InMemoryLinkRepository {
    links: RwLock<Vec<CrossFeatureLink>>,
}

impl InMemoryLinkRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_links(links: impl IntoIterator<Item = CrossFeatureLink>) -> Self {
        Self {
            links: RwLock::new(links.into_iter().collect()),
        }
    }
}

impl LinkRepository for InMemoryLinkRepository {
    fn find_by_id<'a>(&'a self, id: &'a LinkId) -> BoxFuture<'a, Result<Option<CrossFeatureLink>>> {
        Box::pin(async move { Ok(self.links.read().await.iter().find(|l| &l.id == id).cloned()) })
    }

    fn save(&self, link: CrossFeatureLink) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut links = self.links.write().await;
            match links.iter_mut().find(|l| l.id == link.id) {
                Some(existing) => *existing = link,
                None => links.push(link),
            }
            Ok(())
        })
    }

    fn delete<'a>(&'a self, id: &'a LinkId) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let mut links = self.links.write().await;
            let before = links.len();
            links.retain(|l| &l.id != id);
            Ok(links.len() != before)
        })
    }

    fn find_all(&self) -> BoxFuture<'_, Result<Vec<CrossFeatureLink>>> {
        Box::pin(async move { Ok(self.links.read().await.clone()) })
    }

    fn find_by_entity<'a>(
        &'a self,
        entity: &'a FeatureRef,
    ) -> BoxFuture<'a, Result<Vec<CrossFeatureLink>>> {
        Box::pin(async move {
            Ok(self
                .links
                .read()
                .await
                .iter()
                .filter(|l| l.touches(entity))
                .cloned()
                .collect())
        })
    }
}

/// Agent registry held in process memory.
#[derive(Default)]
pub struct InMemoryAgentRegistry {
    agents: RwLock<HashMap<AgentId, AiAgent>>,
}

impl InMemoryAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agents(agents: impl IntoIterator<Item = AiAgent>) -> Self {
        Self {
            agents: RwLock::new(agents.into_iter().map(|a| (a.id.clone(), a)).collect()),
        }
    }
}

impl AgentRegistry for InMemoryAgentRegistry {
    fn find<'a>(&'a self, id: &'a AgentId) -> BoxFuture<'a, Result<Option<AiAgent>>> {
        Box::pin(async move { Ok(self.agents.read().await.get(id).cloned()) })
    }

    fn register(&self, agent: AiAgent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            debug!(agent_id = %agent.id, name = %agent.name, "Registering agent");
            self.agents.write().await.insert(agent.id.clone(), agent);
            Ok(())
        })
    }

    fn record_execution<'a>(
        &'a self,
        id: &'a AgentId,
        success: bool,
        duration_ms: u64,
    ) -> BoxFuture<'a, Result<ExecutionStats>> {
        Box::pin(async move {
            let mut agents = self.agents.write().await;
            let agent = agents
                .get_mut(id)
                .ok_or_else(|| TesseraError::AgentNotFound(id.to_string()))?;
            agent.record_execution(success, duration_ms);
            Ok(agent.stats)
        })
    }

    fn discover<'a>(
        &'a self,
        required_capabilities: &'a [String],
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<AiAgent>>> {
        Box::pin(async move {
            let agents = self.agents.read().await;
            let mut ranked: Vec<(f64, &AiAgent)> = agents
                .values()
                .filter(|a| a.enabled)
                .filter(|a| {
                    required_capabilities.is_empty()
                        || required_capabilities.iter().any(|c| {
                            a.capabilities.iter().any(|own| own.eq_ignore_ascii_case(c))
                        })
                })
                .map(|a| (a.match_score(required_capabilities), a))
                .collect();

            ranked.sort_by(|a, b| {
                b.0.partial_cmp(&a.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.1.id.cmp(&b.1.id))
            });
            Ok(ranked
                .into_iter()
                .take(limit)
                .map(|(_, a)| a.clone())
                .collect())
        })
    }
}
