use std::collections::HashMap;

use tessera_core::model::{AiAgent, CrossFeatureLink, FeatureRef, FunctionModel, LinkType, ModelStatus};
use tessera_core::types::{AgentId, LinkId, ModelId};
use tessera_links::{LinkEdge, LinkGraph};

/// What cross-feature validation needs to know about another model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSummary {
    pub id: ModelId,
    pub name: String,
    pub status: ModelStatus,
    pub deleted: bool,
    /// Models this one nests through function-model actions.
    pub nested: Vec<ModelId>,
}

impl ModelSummary {
    pub fn of(model: &FunctionModel) -> Self {
        let mut nested: Vec<ModelId> = model
            .actions
            .iter()
            .filter_map(|a| a.kind.nested_model().map(|n| n.model_id.clone()))
            .collect();
        nested.sort();
        nested.dedup();
        Self {
            id: model.id.clone(),
            name: model.name.clone(),
            status: model.status,
            deleted: model.deleted,
            nested,
        }
    }
}

/// Snapshot of everything a model may reference: other models, agents and
/// links. Validation passes read only from this; the engine fills it from
/// its repositories.
#[derive(Debug, Clone, Default)]
pub struct ReferenceCatalog {
    models: HashMap<ModelId, ModelSummary>,
    agents: HashMap<AgentId, AiAgent>,
    links: Vec<CrossFeatureLink>,
}

impl ReferenceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_model(&mut self, model: &FunctionModel) {
        self.models.insert(model.id.clone(), ModelSummary::of(model));
    }

    pub fn add_agent(&mut self, agent: AiAgent) {
        self.agents.insert(agent.id.clone(), agent);
    }

    pub fn add_link(&mut self, link: CrossFeatureLink) {
        if !self.links.iter().any(|l| l.id == link.id) {
            self.links.push(link);
        }
    }

    pub fn with_models<'a>(mut self, models: impl IntoIterator<Item = &'a FunctionModel>) -> Self {
        for model in models {
            self.add_model(model);
        }
        self
    }

    pub fn with_agents(mut self, agents: impl IntoIterator<Item = AiAgent>) -> Self {
        for agent in agents {
            self.add_agent(agent);
        }
        self
    }

    pub fn with_links(mut self, links: impl IntoIterator<Item = CrossFeatureLink>) -> Self {
        for link in links {
            self.add_link(link);
        }
        self
    }

    pub fn model(&self, id: &ModelId) -> Option<&ModelSummary> {
        self.models.get(id)
    }

    pub fn agent(&self, id: &AgentId) -> Option<&AiAgent> {
        self.agents.get(id)
    }

    pub fn link(&self, id: &LinkId) -> Option<&CrossFeatureLink> {
        self.links.iter().find(|l| &l.id == id)
    }

    pub fn links(&self) -> &[CrossFeatureLink] {
        &self.links
    }

    /// Model-nesting graph over every known model plus `model`, with NESTED
    /// links folded in. Edges from nesting actions carry full strength.
    pub fn nesting_graph(&self, model: &FunctionModel) -> LinkGraph {
        let mut summaries: Vec<ModelSummary> = self
            .models
            .values()
            .filter(|s| s.id != model.id)
            .cloned()
            .collect();
        summaries.push(ModelSummary::of(model));
        summaries.sort_by(|a, b| a.id.cmp(&b.id));

        let mut links: Vec<CrossFeatureLink> = self
            .links
            .iter()
            .filter(|l| l.link_type == LinkType::Nested)
            .cloned()
            .collect();
        links.sort_by(|a, b| a.id.cmp(&b.id));

        let mut graph = LinkGraph::from_links(&links);
        for summary in &summaries {
            for child in &summary.nested {
                graph.add_edge(
                    FeatureRef::model(summary.id.as_str()),
                    FeatureRef::model(child.as_str()),
                    LinkEdge {
                        link_id: LinkId::from(format!("nested:{}->{}", summary.id, child)),
                        link_type: LinkType::Nested,
                        strength: 1.0,
                    },
                );
            }
        }
        graph
    }
}
