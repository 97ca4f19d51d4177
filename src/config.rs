//! Run-time limits and policies

use serde::{Deserialize, Serialize};

use crate::error::SwarmError;

/// Limits applied to every run of a swarm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Max in-flight model calls across the whole run
    pub global_concurrency: usize,
    /// Max concurrent tool executions per agent instance
    pub local_concurrency: usize,
    /// Max model round-trips in a single ask
    pub max_turns: usize,
    /// Max swarm-stop reprompt cycles per run
    pub max_reprompts: usize,
    /// Context usage percentages that fire `context-warning`
    pub context_warning_thresholds: Vec<u8>,
    /// Context usage percentage that triggers compression
    pub compression_threshold: Option<u8>,
    /// Messages left untouched at the tail of history when compressing
    pub compression_keep_recent: usize,
    /// Context window assumed when a definition does not set one
    pub default_context_window: u64,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            global_concurrency: 50,
            local_concurrency: 10,
            max_turns: 100,
            max_reprompts: 10,
            context_warning_thresholds: vec![80, 90],
            compression_threshold: Some(60),
            compression_keep_recent: 10,
            default_context_window: 200_000,
        }
    }
}

impl SwarmConfig {
    /// Parse from JSON, filling unspecified fields with defaults
    pub fn from_json_str(json: &str) -> Result<Self, SwarmError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SwarmError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject limits that would deadlock or never trigger
    pub fn validate(&self) -> Result<(), SwarmError> {
        if self.global_concurrency == 0 {
            return Err(SwarmError::InvalidConfig(
                "global_concurrency must be at least 1".into(),
            ));
        }
        if self.local_concurrency == 0 {
            return Err(SwarmError::InvalidConfig(
                "local_concurrency must be at least 1".into(),
            ));
        }
        if self.max_turns == 0 {
            return Err(SwarmError::InvalidConfig("max_turns must be at least 1".into()));
        }
        if let Some(bad) = self
            .context_warning_thresholds
            .iter()
            .chain(self.compression_threshold.iter())
            .find(|pct| **pct == 0 || **pct > 100)
        {
            return Err(SwarmError::InvalidConfig(format!(
                "threshold {bad} is not a percentage in 1..=100"
            )));
        }
        Ok(())
    }
}

/// Limits applied to a workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Total node executions allowed in one run, loops included
    pub max_node_visits: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_node_visits: 1000,
        }
    }
}

impl WorkflowConfig {
    /// Parse from JSON, filling unspecified fields with defaults
    pub fn from_json_str(json: &str) -> Result<Self, SwarmError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SwarmError::InvalidConfig(e.to_string()))?;
        if config.max_node_visits == 0 {
            return Err(SwarmError::InvalidConfig(
                "max_node_visits must be at least 1".into(),
            ));
        }
        Ok(config)
    }
}
