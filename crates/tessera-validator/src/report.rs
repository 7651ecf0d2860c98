use serde::{Deserialize, Serialize};

use tessera_core::types::ModelId;

/// One validation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PassKind {
    Structural,
    BusinessRules,
    ExecutionReadiness,
    Context,
    CrossFeature,
}

impl PassKind {
    pub const ALL: [PassKind; 5] = [
        Self::Structural,
        Self::BusinessRules,
        Self::ExecutionReadiness,
        Self::Context,
        Self::CrossFeature,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structural => "structural",
            Self::BusinessRules => "business-rules",
            Self::ExecutionReadiness => "execution-readiness",
            Self::Context => "context",
            Self::CrossFeature => "cross-feature",
        }
    }
}

impl std::fmt::Display for PassKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which passes a validation call runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationLevel {
    Structural,
    BusinessRules,
    ExecutionReadiness,
    Context,
    CrossFeature,
    #[default]
    Full,
}

impl ValidationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structural => "structural",
            Self::BusinessRules => "business-rules",
            Self::ExecutionReadiness => "execution-readiness",
            Self::Context => "context",
            Self::CrossFeature => "cross-feature",
            Self::Full => "full",
        }
    }

    pub fn includes(&self, pass: PassKind) -> bool {
        match self {
            Self::Full => true,
            Self::Structural => pass == PassKind::Structural,
            Self::BusinessRules => pass == PassKind::BusinessRules,
            Self::ExecutionReadiness => pass == PassKind::ExecutionReadiness,
            Self::Context => pass == PassKind::Context,
            Self::CrossFeature => pass == PassKind::CrossFeature,
        }
    }
}

impl std::fmt::Display for ValidationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ValidationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "structural" => Ok(Self::Structural),
            "business-rules" => Ok(Self::BusinessRules),
            "execution-readiness" => Ok(Self::ExecutionReadiness),
            "context" => Ok(Self::Context),
            "cross-feature" => Ok(Self::CrossFeature),
            "full" => Ok(Self::Full),
            other => Err(format!("unknown validation level: {}", other)),
        }
    }
}

/// A single finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Stable machine-readable code, e.g. `CIRCULAR_DEPENDENCY`.
    pub code: String,
    pub message: String,
    /// Node, action, policy or link the finding is about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
}

impl ValidationIssue {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            entity: None,
        }
    }

    pub fn on(mut self, entity: impl ToString) -> Self {
        self.entity = Some(entity.to_string());
        self
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.entity {
            Some(entity) => write!(f, "[{}] {} ({})", self.code, self.message, entity),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

/// Errors and warnings of one pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl PassReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A pass that could not run; its own failure is its only error.
    pub fn failed(kind: PassKind, reason: impl std::fmt::Display) -> Self {
        Self {
            errors: vec![ValidationIssue::new(
                "PASS_FAILED",
                format!("{} validation could not complete: {}", kind, reason),
            )],
            warnings: vec![],
        }
    }

    pub fn error(&mut self, issue: ValidationIssue) {
        self.errors.push(issue);
    }

    pub fn warn(&mut self, issue: ValidationIssue) {
        self.warnings.push(issue);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.errors.iter().chain(&self.warnings).any(|i| i.code == code)
    }

    /// `"msg; msg"` summary of the errors.
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Aggregated result of a validation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub model_id: ModelId,
    pub level: ValidationLevel,
    pub overall_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structural: Option<PassReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_rules: Option<PassReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_readiness: Option<PassReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<PassReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cross_feature: Option<PassReport>,
}

impl ValidationReport {
    pub fn new(model_id: ModelId, level: ValidationLevel) -> Self {
        Self {
            model_id,
            level,
            overall_valid: true,
            structural: None,
            business_rules: None,
            execution_readiness: None,
            context: None,
            cross_feature: None,
        }
    }

    /// Fold one pass result in.
    pub fn record(&mut self, kind: PassKind, report: PassReport) {
        self.overall_valid &= report.is_valid();
        *self.slot(kind) = Some(report);
    }

    fn slot(&mut self, kind: PassKind) -> &mut Option<PassReport> {
        match kind {
            PassKind::Structural => &mut self.structural,
            PassKind::BusinessRules => &mut self.business_rules,
            PassKind::ExecutionReadiness => &mut self.execution_readiness,
            PassKind::Context => &mut self.context,
            PassKind::CrossFeature => &mut self.cross_feature,
        }
    }

    pub fn pass(&self, kind: PassKind) -> Option<&PassReport> {
        match kind {
            PassKind::Structural => self.structural.as_ref(),
            PassKind::BusinessRules => self.business_rules.as_ref(),
            PassKind::ExecutionReadiness => self.execution_readiness.as_ref(),
            PassKind::Context => self.context.as_ref(),
            PassKind::CrossFeature => self.cross_feature.as_ref(),
        }
    }

    /// Passes that ran, in pipeline order.
    pub fn passes(&self) -> impl Iterator<Item = (PassKind, &PassReport)> {
        PassKind::ALL
            .into_iter()
            .filter_map(move |k| self.pass(k).map(|r| (k, r)))
    }

    pub fn error_count(&self) -> usize {
        self.passes().map(|(_, r)| r.errors.len()).sum()
    }

    pub fn warning_count(&self) -> usize {
        self.passes().map(|(_, r)| r.warnings.len()).sum()
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.passes().flat_map(|(_, r)| r.errors.iter())
    }
}
