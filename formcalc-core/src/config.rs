//! Configuration parsing and management.

use formcalc_data::OrchestratorConfig;
use formcalc_expr::EngineLimits;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}

/// Main configuration struct matching the formcalc.yml schema
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub evaluation: EvaluationConfig,

    #[serde(default)]
    pub external_data: ExternalDataConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_time_budget_ms")]
    pub time_budget_ms: u64,

    #[serde(default = "default_max_expression_length")]
    pub max_expression_length: usize,

    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Complexity limit, in AST nodes
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,

    #[serde(default = "default_max_steps")]
    pub max_steps: u64,

    #[serde(default = "default_parse_cache_capacity")]
    pub parse_cache_capacity: usize,
}

fn default_time_budget_ms() -> u64 {
    5_000
}

fn default_max_expression_length() -> usize {
    4_096
}

fn default_max_depth() -> usize {
    64
}

fn default_max_nodes() -> usize {
    1_000
}

fn default_max_steps() -> u64 {
    100_000
}

fn default_parse_cache_capacity() -> usize {
    512
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            time_budget_ms: default_time_budget_ms(),
            max_expression_length: default_max_expression_length(),
            max_depth: default_max_depth(),
            max_nodes: default_max_nodes(),
            max_steps: default_max_steps(),
            parse_cache_capacity: default_parse_cache_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalDataConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_fetch_timeout_ms() -> u64 {
    10_000
}

impl Default for ExternalDataConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        // An empty file is a valid, all-defaults configuration
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: EngineConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject limits that would make every evaluation fail
    pub fn validate(&self) -> Result<(), ConfigError> {
        let eval = &self.evaluation;
        let checks: [(&'static str, bool); 5] = [
            ("evaluation.max_expression_length", eval.max_expression_length > 0),
            ("evaluation.max_depth", eval.max_depth > 0),
            ("evaluation.max_nodes", eval.max_nodes > 0),
            ("evaluation.max_steps", eval.max_steps > 0),
            ("evaluation.parse_cache_capacity", eval.parse_cache_capacity > 0),
        ];
        for (field, ok) in checks {
            if !ok {
                return Err(ConfigError::InvalidValue {
                    field,
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        if self.external_data.fetch_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "external_data.fetch_timeout_ms",
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn engine_limits(&self) -> EngineLimits {
        let eval = &self.evaluation;
        EngineLimits {
            time_budget: Duration::from_millis(eval.time_budget_ms),
            max_expression_length: eval.max_expression_length,
            max_depth: eval.max_depth,
            max_nodes: eval.max_nodes,
            max_steps: eval.max_steps,
            parse_cache_capacity: eval.parse_cache_capacity,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            default_ttl: Duration::from_secs(self.external_data.cache_ttl_secs),
            fetch_timeout: Duration::from_millis(self.external_data.fetch_timeout_ms),
        }
    }
}
