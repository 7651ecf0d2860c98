use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::AgentId;

/// Running execution statistics for an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub execution_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub average_duration_ms: f64,
    #[serde(default)]
    pub last_executed_at: Option<DateTime<Utc>>,
}

impl ExecutionStats {
    /// Fold one execution into the statistics.
    ///
    /// The running average is recomputed from (count, average) so replaying
    /// the same sequence of records always yields the same numbers.
    pub fn record(&mut self, success: bool, duration_ms: u64) {
        let previous_total = self.average_duration_ms * self.execution_count as f64;
        self.execution_count += 1;
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.average_duration_ms = (previous_total + duration_ms as f64) / self.execution_count as f64;
        self.last_executed_at = Some(Utc::now());
    }

    /// Fraction of successful executions; agents with no history count as 0.5.
    pub fn success_rate(&self) -> f64 {
        if self.execution_count == 0 {
            0.5
        } else {
            self.success_count as f64 / self.execution_count as f64
        }
    }
}

/// An AI agent that action nodes can delegate tasks to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiAgent {
    pub id: AgentId,
    pub name: String,
    /// Capabilities this agent advertises (e.g., "summarize", "classify").
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Tool names this agent has access to.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub stats: ExecutionStats,
}

fn default_enabled() -> bool {
    true
}

impl AiAgent {
    pub fn new(id: impl Into<AgentId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capabilities: vec![],
            tools: vec![],
            enabled: true,
            stats: ExecutionStats::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn record_execution(&mut self, success: bool, duration_ms: u64) {
        self.stats.record(success, duration_ms);
    }

    /// Score how well this agent matches a set of required capabilities.
    /// Higher score = better match. Reliability breaks ties between equally capable agents.
    pub fn match_score(&self, required: &[String]) -> f64 {
        let mut score = 0.0;

        if !required.is_empty() {
            let matched = required
                .iter()
                .filter(|c| {
                    self.capabilities
                        .iter()
                        .any(|own| own.eq_ignore_ascii_case(c))
                })
                .count();
            if matched == required.len() {
                score += 20.0; // All required capabilities available
            } else {
                score += matched as f64 * 5.0;
            }
        }

        score + self.stats.success_rate() * 10.0
    }
}
