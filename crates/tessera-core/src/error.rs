use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TesseraError {
    // Lookup errors
    #[error("Function model not found: {0}")]
    ModelNotFound(String),

    #[error("Container node not found: {0}")]
    NodeNotFound(String),

    #[error("Action node not found: {0}")]
    ActionNotFound(String),

    #[error("Cross-feature link not found: {0}")]
    LinkNotFound(String),

    #[error("AI agent not found: {0}")]
    AgentNotFound(String),

    // Model lifecycle errors
    #[error("Model is {status} and cannot be modified")]
    ModelLocked { status: String },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error("Cannot publish invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Permission denied: {user} cannot {operation}")]
    PermissionDenied { user: String, operation: String },

    // Execution errors
    #[error("Model must be published before execution: {0}")]
    NotPublished(String),

    #[error("Model has been deleted: {0}")]
    ModelDeleted(String),

    #[error("Dependency cycle detected: {0}")]
    CycleDetected(String),

    #[error("Nested execution exceeded max depth ({0})")]
    NestingTooDeep(usize),

    #[error("Context error: {0}")]
    Context(String),

    #[error("Action failed: {action}: {failure}")]
    ActionFailed { action: String, failure: ActionFailure },

    #[error("Run cancelled")]
    Cancelled,

    // Link errors
    #[error("Invalid link: {0}")]
    InvalidLink(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TesseraError>;

/// Error-type tag carried by an action failure; recovery policies match on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Timeout,
    ResourceExhaustion,
    AgentFailure,
    CascadeFailure,
    ExternalService,
    Configuration,
    Unknown,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ResourceExhaustion => "resource_exhaustion",
            Self::AgentFailure => "agent_failure",
            Self::CascadeFailure => "cascade_failure",
            Self::ExternalService => "external_service",
            Self::Configuration => "configuration",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure reported by an action handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionFailure {
    pub error_type: ErrorType,
    pub message: String,
    /// Whether the action's own retry policy may re-invoke it.
    pub retryable: bool,
}

impl ActionFailure {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        let retryable = matches!(
            error_type,
            ErrorType::Timeout | ErrorType::ResourceExhaustion | ErrorType::ExternalService
        );
        Self {
            error_type,
            message: message.into(),
            retryable,
        }
    }

    pub fn fatal(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Timeout, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::fatal(ErrorType::Configuration, message)
    }
}

impl std::fmt::Display for ActionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.error_type, self.message)
    }
}
