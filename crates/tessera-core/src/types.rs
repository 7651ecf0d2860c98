use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Identity of a function model.
    ModelId
);
string_id!(
    /// Identity of a container node.
    NodeId
);
string_id!(
    /// Identity of an action node.
    ActionId
);
string_id!(
    /// Identity of a cross-feature link.
    LinkId
);
string_id!(
    /// Identity of an AI agent.
    AgentId
);
string_id!(
    /// Identity of one execution run (nested runs get their own).
    ExecutionId
);
string_id!(
    /// Identity of a user acting on the system.
    UserId
);

/// How container nodes of a run are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// One node at a time, in topological order.
    #[default]
    Sequential,
    /// Every node starts as soon as its dependencies are terminal.
    Parallel,
    /// Parallel, bounded, and scaled down after resource recoveries.
    AdaptiveParallel,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::AdaptiveParallel => "adaptive_parallel",
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            "adaptive_parallel" => Ok(Self::AdaptiveParallel),
            other => Err(format!("unknown execution mode: {}", other)),
        }
    }
}

/// Terminal state of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Completed,
    CompletedWithRecovery,
    CompletedWithFallback,
    FailedWithPropagation,
    Failed,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::CompletedWithRecovery => "completed_with_recovery",
            Self::CompletedWithFallback => "completed_with_fallback",
            Self::FailedWithPropagation => "failed_with_propagation",
            Self::Failed => "failed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithRecovery | Self::CompletedWithFallback
        )
    }

    /// Combine two outcomes, keeping the more severe one.
    pub fn escalate(self, other: Self) -> Self {
        self.max(other)
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
