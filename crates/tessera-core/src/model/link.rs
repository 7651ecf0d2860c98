use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};
use crate::types::{LinkId, NodeId};

/// Feature an entity belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeatureType {
    FunctionModel,
    KnowledgeBase,
    Spindle,
    EventStorm,
}

impl FeatureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FunctionModel => "function-model",
            Self::KnowledgeBase => "knowledge-base",
            Self::Spindle => "spindle",
            Self::EventStorm => "event-storm",
        }
    }
}

impl std::fmt::Display for FeatureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entity addressed by feature and id; a vertex of the link graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeatureRef {
    pub feature: FeatureType,
    pub entity_id: String,
}

impl FeatureRef {
    pub fn new(feature: FeatureType, entity_id: impl Into<String>) -> Self {
        Self {
            feature,
            entity_id: entity_id.into(),
        }
    }

    pub fn model(entity_id: impl Into<String>) -> Self {
        Self::new(FeatureType::FunctionModel, entity_id)
    }
}

impl std::fmt::Display for FeatureRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.feature, self.entity_id)
    }
}

/// Semantic type of a cross-feature link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkType {
    Documents,
    Implements,
    References,
    Supports,
    Nested,
    Triggers,
    Consumes,
    Produces,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Documents => "DOCUMENTS",
            Self::Implements => "IMPLEMENTS",
            Self::References => "REFERENCES",
            Self::Supports => "SUPPORTS",
            Self::Nested => "NESTED",
            Self::Triggers => "TRIGGERS",
            Self::Consumes => "CONSUMES",
            Self::Produces => "PRODUCES",
        }
    }

    /// Fixed compatibility matrix between link types and feature pairs.
    pub fn is_compatible(&self, source: FeatureType, target: FeatureType) -> bool {
        use FeatureType::*;
        match self {
            Self::References => true,
            Self::Documents => source == KnowledgeBase,
            Self::Supports => source == KnowledgeBase && matches!(target, FunctionModel | Spindle),
            Self::Implements => matches!(
                (source, target),
                (FunctionModel, Spindle) | (FunctionModel, EventStorm) | (Spindle, FunctionModel)
            ),
            Self::Nested => source == FunctionModel && target == FunctionModel,
            Self::Triggers => {
                matches!(source, FunctionModel | Spindle | EventStorm)
                    && matches!(target, FunctionModel | Spindle)
            }
            Self::Consumes | Self::Produces => {
                matches!(source, FunctionModel | Spindle)
                    && matches!(target, EventStorm | KnowledgeBase)
            }
        }
    }
}

impl std::fmt::Display for LinkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node-level context attached to a link.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeLinkContext {
    #[serde(default)]
    pub source_node_id: Option<NodeId>,
    #[serde(default)]
    pub target_node_id: Option<NodeId>,
    #[serde(default)]
    pub context_type: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// A directed, typed, weighted edge between entities of possibly different features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossFeatureLink {
    pub id: LinkId,
    pub source: FeatureRef,
    pub target: FeatureRef,
    pub link_type: LinkType,
    /// Effective strength: the base plus any bonuses last applied.
    pub strength: f64,
    /// Strength assigned at creation. Absent on records that predate it,
    /// in which case `strength` stands in.
    #[serde(default)]
    pub base_strength: Option<f64>,
    #[serde(default)]
    pub node_context: Option<NodeLinkContext>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CrossFeatureLink {
    /// Create a link, enforcing the self-link, strength-range and compatibility invariants.
    pub fn new(
        source: FeatureRef,
        target: FeatureRef,
        link_type: LinkType,
        strength: f64,
    ) -> Result<Self> {
        Self::with_id(LinkId::new(), source, target, link_type, strength)
    }

    pub fn with_id(
        id: impl Into<LinkId>,
        source: FeatureRef,
        target: FeatureRef,
        link_type: LinkType,
        strength: f64,
    ) -> Result<Self> {
        if source == target {
            return Err(TesseraError::InvalidLink(format!(
                "self-link on {}",
                source
            )));
        }
        check_strength(strength)?;
        if !link_type.is_compatible(source.feature, target.feature) {
            return Err(TesseraError::InvalidLink(format!(
                "{} is not allowed from {} to {}",
                link_type, source.feature, target.feature
            )));
        }
        let now = Utc::now();
        Ok(Self {
            id: id.into(),
            source,
            target,
            link_type,
            strength,
            base_strength: Some(strength),
            node_context: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_node_context(mut self, context: NodeLinkContext) -> Self {
        self.node_context = Some(context);
        self
    }

    /// The strength bonuses are scored from.
    pub fn base_strength(&self) -> f64 {
        self.base_strength.unwrap_or(self.strength)
    }

    /// Replace the effective strength. The base is left alone.
    pub fn set_strength(&mut self, strength: f64) -> Result<()> {
        check_strength(strength)?;
        self.strength = strength;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// The (source, target, feature-pair) combination that must be unique.
    pub fn uniqueness_key(&self) -> (FeatureRef, FeatureRef) {
        (self.source.clone(), self.target.clone())
    }

    pub fn touches(&self, entity: &FeatureRef) -> bool {
        &self.source == entity || &self.target == entity
    }
}

fn check_strength(strength: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&strength) || strength.is_nan() {
        return Err(TesseraError::InvalidLink(format!(
            "strength {} outside [0, 1]",
            strength
        )));
    }
    Ok(())
}
