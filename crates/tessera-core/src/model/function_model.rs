use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};
use crate::model::action::ActionNode;
use crate::model::node::Node;
use crate::model::recovery::RecoveryPolicy;
use crate::types::{ActionId, ModelId, NodeId, UserId};

/// Lifecycle status of a function model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelStatus {
    #[default]
    Draft,
    Published,
    Archived,
}

impl ModelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Published => "PUBLISHED",
            Self::Archived => "ARCHIVED",
        }
    }
}

impl std::fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owner, editors, and viewers of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permissions {
    pub owner: UserId,
    #[serde(default)]
    pub editors: Vec<UserId>,
    #[serde(default)]
    pub viewers: Vec<UserId>,
}

impl Permissions {
    pub fn owned_by(owner: impl Into<UserId>) -> Self {
        Self {
            owner: owner.into(),
            editors: vec![],
            viewers: vec![],
        }
    }

    pub fn can_edit(&self, user: &UserId) -> bool {
        &self.owner == user || self.editors.contains(user)
    }

    pub fn can_view(&self, user: &UserId) -> bool {
        self.can_edit(user) || self.viewers.contains(user)
    }
}

/// A user-authored workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionModel {
    pub id: ModelId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: ModelStatus,
    /// Soft-delete flag, independent of `status`.
    #[serde(default)]
    pub deleted: bool,
    pub version: Version,
    /// Container nodes in declaration order.
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub actions: Vec<ActionNode>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub permissions: Permissions,
    /// Ordered error-type to recovery-action mapping.
    #[serde(default)]
    pub recovery_policies: Vec<RecoveryPolicy>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FunctionModel {
    pub fn new(name: impl Into<String>, owner: impl Into<UserId>) -> Self {
        Self::with_id(ModelId::new(), name, owner)
    }

    pub fn with_id(id: impl Into<ModelId>, name: impl Into<String>, owner: impl Into<UserId>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            status: ModelStatus::Draft,
            deleted: false,
            version: Version::new(1, 0, 0),
            nodes: vec![],
            actions: vec![],
            metadata: HashMap::new(),
            permissions: Permissions::owned_by(owner),
            recovery_policies: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_editable(&self) -> bool {
        self.status == ModelStatus::Draft && !self.deleted
    }

    fn ensure_editable(&self) -> Result<()> {
        if self.deleted {
            return Err(TesseraError::ModelDeleted(self.id.to_string()));
        }
        if self.status != ModelStatus::Draft {
            return Err(TesseraError::ModelLocked {
                status: self.status.to_string(),
            });
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn action(&self, id: &ActionId) -> Option<&ActionNode> {
        self.actions.iter().find(|a| &a.id == id)
    }

    /// Actions owned by a container, in declaration order.
    pub fn actions_of<'a>(&'a self, node: &'a NodeId) -> impl Iterator<Item = &'a ActionNode> + 'a {
        self.actions.iter().filter(move |a| &a.node_id == node)
    }

    /// Nodes that list `node` as a dependency.
    pub fn dependents_of<'a>(&'a self, node: &'a NodeId) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes.iter().filter(move |n| n.dependencies.contains(node))
    }

    pub fn add_node(&mut self, node: Node) -> Result<()> {
        self.ensure_editable()?;
        if self.node(&node.id).is_some() {
            return Err(TesseraError::DuplicateId(node.id.to_string()));
        }
        self.nodes.push(node);
        self.touch();
        Ok(())
    }

    /// Remove a node, its actions, and any dependency references to it.
    pub fn remove_node(&mut self, id: &NodeId) -> Result<Node> {
        self.ensure_editable()?;
        let pos = self
            .nodes
            .iter()
            .position(|n| &n.id == id)
            .ok_or_else(|| TesseraError::NodeNotFound(id.to_string()))?;
        let removed = self.nodes.remove(pos);
        self.actions.retain(|a| &a.node_id != id);
        for node in &mut self.nodes {
            node.dependencies.retain(|d| d != id);
        }
        self.touch();
        Ok(removed)
    }

    pub fn add_action(&mut self, action: ActionNode) -> Result<()> {
        self.ensure_editable()?;
        if self.node(&action.node_id).is_none() {
            return Err(TesseraError::NodeNotFound(action.node_id.to_string()));
        }
        if self.action(&action.id).is_some() {
            return Err(TesseraError::DuplicateId(action.id.to_string()));
        }
        self.actions.push(action);
        self.touch();
        Ok(())
    }

    pub fn remove_action(&mut self, id: &ActionId) -> Result<ActionNode> {
        self.ensure_editable()?;
        let pos = self
            .actions
            .iter()
            .position(|a| &a.id == id)
            .ok_or_else(|| TesseraError::ActionNotFound(id.to_string()))?;
        self.touch();
        Ok(self.actions.remove(pos))
    }

    /// Replace the dependency list of a node.
    pub fn set_dependencies(&mut self, id: &NodeId, dependencies: Vec<NodeId>) -> Result<()> {
        self.ensure_editable()?;
        let node = self
            .nodes
            .iter_mut()
            .find(|n| &n.id == id)
            .ok_or_else(|| TesseraError::NodeNotFound(id.to_string()))?;
        node.dependencies = dependencies;
        self.touch();
        Ok(())
    }

    pub fn add_recovery_policy(&mut self, policy: RecoveryPolicy) -> Result<()> {
        self.ensure_editable()?;
        self.recovery_policies.push(policy);
        self.touch();
        Ok(())
    }

    /// Draft -> Published. Callers validate before calling this.
    pub fn publish(&mut self) -> Result<()> {
        if self.deleted {
            return Err(TesseraError::ModelDeleted(self.id.to_string()));
        }
        if self.status != ModelStatus::Draft {
            return Err(TesseraError::InvalidTransition {
                from: self.status.to_string(),
                to: ModelStatus::Published.to_string(),
            });
        }
        self.status = ModelStatus::Published;
        self.touch();
        Ok(())
    }

    pub fn archive(&mut self) -> Result<()> {
        if self.status == ModelStatus::Archived {
            return Err(TesseraError::InvalidTransition {
                from: self.status.to_string(),
                to: ModelStatus::Archived.to_string(),
            });
        }
        self.status = ModelStatus::Archived;
        self.touch();
        Ok(())
    }

    pub fn soft_delete(&mut self) {
        self.deleted = true;
        self.touch();
    }

    /// New editable draft of a published or archived model, minor version bumped.
    pub fn next_version(&self) -> Result<FunctionModel> {
        if self.status == ModelStatus::Draft {
            return Err(TesseraError::InvalidTransition {
                from: self.status.to_string(),
                to: "new version".into(),
            });
        }
        let now = Utc::now();
        let mut next = self.clone();
        next.id = ModelId::new();
        next.status = ModelStatus::Draft;
        next.version = Version::new(self.version.major, self.version.minor + 1, 0);
        next.metadata.insert(
            "previous_version_id".into(),
            serde_json::Value::String(self.id.to_string()),
        );
        next.created_at = now;
        next.updated_at = now;
        Ok(next)
    }

    /// Ids that appear more than once among nodes or actions.
    pub fn duplicate_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut dups = Vec::new();
        for id in self.nodes.iter().map(|n| n.id.as_str()) {
            if !seen.insert(("node", id)) {
                dups.push(id.to_string());
            }
        }
        for id in self.actions.iter().map(|a| a.id.as_str()) {
            if !seen.insert(("action", id)) {
                dups.push(id.to_string());
            }
        }
        dups
    }
}
