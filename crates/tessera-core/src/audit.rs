use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ModelId, UserId};

/// Operation tags written to the audit log.
pub mod ops {
    pub const MODEL_CREATED: &str = "MODEL_CREATED";
    pub const NODE_ADDED: &str = "NODE_ADDED";
    pub const NODE_REMOVED: &str = "NODE_REMOVED";
    pub const ACTION_ADDED: &str = "ACTION_ADDED";
    pub const ACTION_REMOVED: &str = "ACTION_REMOVED";
    pub const MODEL_PUBLISHED: &str = "MODEL_PUBLISHED";
    pub const MODEL_ARCHIVED: &str = "MODEL_ARCHIVED";
    pub const MODEL_VERSIONED: &str = "MODEL_VERSIONED";
    pub const MODEL_DELETED: &str = "MODEL_DELETED";
    pub const EXECUTION_STARTED: &str = "EXECUTION_STARTED";
    pub const NODE_STARTED: &str = "NODE_STARTED";
    pub const NODE_COMPLETED: &str = "NODE_COMPLETED";
    pub const ACTION_COMPLETED: &str = "ACTION_COMPLETED";
    pub const ACTION_FAILED: &str = "ACTION_FAILED";
    pub const RECOVERY_RETRY: &str = "RECOVERY_RETRY";
    pub const RECOVERY_FALLBACK_AGENT: &str = "RECOVERY_FALLBACK_AGENT";
    pub const RECOVERY_ISOLATE: &str = "RECOVERY_ISOLATE";
    pub const RECOVERY_DEGRADE: &str = "RECOVERY_DEGRADE";
    pub const RECOVERY_PROPAGATE: &str = "RECOVERY_PROPAGATE";
    pub const RECOVERY_SHUTDOWN: &str = "RECOVERY_SHUTDOWN";
    pub const RECOVERY_SCALE_DOWN: &str = "RECOVERY_SCALE_DOWN";
    pub const RECOVERY_UNHANDLED: &str = "RECOVERY_UNHANDLED";
    pub const EXECUTION_FINISHED: &str = "EXECUTION_FINISHED";
    pub const LINK_CREATED: &str = "LINK_CREATED";
    pub const LINK_DELETED: &str = "LINK_DELETED";
    pub const LINK_STRENGTH_UPDATED: &str = "LINK_STRENGTH_UPDATED";
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    /// Operation tag, see [`ops`].
    pub action: String,
    /// Entity the operation touched (model, node, action, link, execution).
    pub entity_id: String,
    /// Model the operation belongs to, when there is one.
    #[serde(default)]
    pub model_id: Option<ModelId>,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl AuditEntry {
    pub fn new(action: &str, entity_id: impl Into<String>, user_id: &UserId) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action: action.to_string(),
            entity_id: entity_id.into(),
            model_id: None,
            user_id: user_id.clone(),
            timestamp: Utc::now(),
            details: serde_json::Value::Null,
        }
    }

    pub fn for_model(mut self, model_id: &ModelId) -> Self {
        self.model_id = Some(model_id.clone());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Filter for reading the audit log back. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub model_id: Option<ModelId>,
    pub user_id: Option<UserId>,
    pub action: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn for_model(model_id: &ModelId) -> Self {
        Self {
            model_id: Some(model_id.clone()),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.model_id
            .as_ref()
            .map_or(true, |m| entry.model_id.as_ref() == Some(m))
            && self.user_id.as_ref().map_or(true, |u| &entry.user_id == u)
            && self.action.as_ref().map_or(true, |a| &entry.action == a)
            && self.since.map_or(true, |s| entry.timestamp >= s)
            && self.until.map_or(true, |u| entry.timestamp <= u)
    }
}
