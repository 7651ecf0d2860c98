use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};
use crate::model::RetryPolicy;
use crate::types::RunMode;

/// Top-level Tessera configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Retry policy applied to actions that carry none.
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub links: LinkAnalysisConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn default_event_bus_capacity() -> usize { 1024 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            execution: ExecutionConfig::default(),
            retry: RetryConfig::default(),
            links: LinkAnalysisConfig::default(),
            audit: AuditConfig::default(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Fail-safe bound on nested model recursion.
    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: usize,
    #[serde(default)]
    pub default_mode: RunMode,
    /// Per-attempt action timeout.
    #[serde(default = "default_action_timeout")]
    pub action_timeout_secs: u64,
    /// Concurrency bound for `adaptive_parallel` runs.
    #[serde(default = "default_max_parallel_nodes")]
    pub max_parallel_nodes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_nesting_depth: default_max_nesting_depth(),
            default_mode: RunMode::default(),
            action_timeout_secs: default_action_timeout(),
            max_parallel_nodes: default_max_parallel_nodes(),
        }
    }
}

fn default_max_nesting_depth() -> usize { 8 }
fn default_action_timeout() -> u64 { 120 }
fn default_max_parallel_nodes() -> usize { 4 }

/// Retry defaults for actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay_ms: self.base_delay_ms,
            backoff_multiplier: self.backoff_multiplier,
            max_delay_ms: Some(self.max_delay_ms),
        }
    }
}

fn default_max_attempts() -> u32 { 1 }
fn default_base_delay() -> u64 { 500 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_max_delay() -> u64 { 30000 }

/// Link graph analysis limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkAnalysisConfig {
    #[serde(default = "default_max_cycle_length")]
    pub max_cycle_length: usize,
    #[serde(default = "default_frequency_cap")]
    pub frequency_bonus_cap: f64,
    #[serde(default = "default_semantic_cap")]
    pub semantic_bonus_cap: f64,
    #[serde(default = "default_context_cap")]
    pub context_bonus_cap: f64,
}

impl Default for LinkAnalysisConfig {
    fn default() -> Self {
        Self {
            max_cycle_length: default_max_cycle_length(),
            frequency_bonus_cap: default_frequency_cap(),
            semantic_bonus_cap: default_semantic_cap(),
            context_bonus_cap: default_context_cap(),
        }
    }
}

fn default_max_cycle_length() -> usize { 10 }
fn default_frequency_cap() -> f64 { 0.1 }
fn default_semantic_cap() -> f64 { 0.1 }
fn default_context_cap() -> f64 { 0.05 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    /// SQLite file for the audit log; in-memory when unset.
    #[serde(default)]
    pub path: Option<String>,
}

impl AuditConfig {
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path.as_deref().map(expand_home)
    }
}

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TesseraError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse TOML text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| TesseraError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.execution.max_nesting_depth == 0 {
            return Err(TesseraError::Config(
                "execution.max_nesting_depth must be at least 1".into(),
            ));
        }
        if self.execution.max_parallel_nodes == 0 {
            return Err(TesseraError::Config(
                "execution.max_parallel_nodes must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(TesseraError::Config("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
