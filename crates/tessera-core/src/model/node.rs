use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Declared value type of a context binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl ValueType {
    /// Whether a producer of `self` may feed a consumer expecting `other`.
    pub fn accepts(&self, other: ValueType) -> bool {
        *self == ValueType::Any || other == ValueType::Any || *self == other
    }

    /// Whether a runtime value conforms to this type.
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            Self::Any => true,
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

/// A named, optionally typed context key read or written by a node or action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBinding {
    pub key: String,
    #[serde(default = "default_value_type")]
    pub value_type: ValueType,
}

fn default_value_type() -> ValueType {
    ValueType::Any
}

impl ContextBinding {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value_type: ValueType::Any,
        }
    }

    pub fn typed(key: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            key: key.into(),
            value_type,
        }
    }
}

/// Direction of an IO boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoDirection {
    Input,
    Output,
    Both,
}

impl IoDirection {
    pub fn accepts_input(&self) -> bool {
        matches!(self, Self::Input | Self::Both)
    }

    pub fn emits_output(&self) -> bool {
        matches!(self, Self::Output | Self::Both)
    }
}

/// Declared type of a container node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Boundary where run data enters or leaves the model.
    IoBoundary {
        direction: IoDirection,
        /// Input boundaries write these keys from the run input; output
        /// boundaries collect them into the run result.
        #[serde(default)]
        fields: Vec<ContextBinding>,
    },
    /// Processing stage holding action nodes.
    Stage,
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::IoBoundary {
                direction: IoDirection::Input,
                ..
            } => "io_input",
            Self::IoBoundary {
                direction: IoDirection::Output,
                ..
            } => "io_output",
            Self::IoBoundary {
                direction: IoDirection::Both,
                ..
            } => "io_both",
            Self::Stage => "stage",
        }
    }
}

/// Lifecycle status of a container node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Active,
    Inactive,
    Deprecated,
}

/// Layout position. Not used by execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A container node in a function model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    #[serde(default)]
    pub position: Position,
    pub kind: NodeKind,
    /// Nodes that must complete before this one starts.
    #[serde(default)]
    pub dependencies: Vec<NodeId>,
    #[serde(default)]
    pub status: NodeStatus,
    /// Free-form per-type configuration payload.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            position: Position::default(),
            kind,
            dependencies: vec![],
            status: NodeStatus::Active,
            config: serde_json::Value::Null,
        }
    }

    /// An input boundary writing the given fields.
    pub fn input(id: impl Into<NodeId>, name: impl Into<String>, fields: Vec<ContextBinding>) -> Self {
        Self::new(
            id,
            name,
            NodeKind::IoBoundary {
                direction: IoDirection::Input,
                fields,
            },
        )
    }

    /// An output boundary collecting the given fields.
    pub fn output(id: impl Into<NodeId>, name: impl Into<String>, fields: Vec<ContextBinding>) -> Self {
        Self::new(
            id,
            name,
            NodeKind::IoBoundary {
                direction: IoDirection::Output,
                fields,
            },
        )
    }

    pub fn stage(id: impl Into<NodeId>, name: impl Into<String>) -> Self {
        Self::new(id, name, NodeKind::Stage)
    }

    /// Add a dependency.
    pub fn depends_on(mut self, node: impl Into<NodeId>) -> Self {
        self.dependencies.push(node.into());
        self
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Position { x, y };
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn io_direction(&self) -> Option<IoDirection> {
        match &self.kind {
            NodeKind::IoBoundary { direction, .. } => Some(*direction),
            NodeKind::Stage => None,
        }
    }

    pub fn is_input_capable(&self) -> bool {
        self.io_direction().is_some_and(|d| d.accepts_input())
    }

    pub fn is_output_capable(&self) -> bool {
        self.io_direction().is_some_and(|d| d.emits_output())
    }

    /// Boundary fields, empty for stages.
    pub fn fields(&self) -> &[ContextBinding] {
        match &self.kind {
            NodeKind::IoBoundary { fields, .. } => fields,
            NodeKind::Stage => &[],
        }
    }
}
