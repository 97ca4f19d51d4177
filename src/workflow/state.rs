//! Workflow state snapshots

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::NodeResult;
use crate::error::WorkflowError;
use crate::message::Message;

/// Format version written into every snapshot
pub const STATE_VERSION: u32 = 1;

/// Everything a workflow carries between runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub version: u32,
    /// Histories of agents bound with preserved context
    #[serde(default)]
    pub agents: BTreeMap<String, Vec<Message>>,
    /// Results of the most recent run
    #[serde(default)]
    pub results: BTreeMap<String, NodeResult>,
}

/// Opaque encoded state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateBlob(pub Vec<u8>);

impl StateBlob {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Encodes and decodes workflow state
pub trait StatePersistence: Send + Sync {
    fn encode(&self, state: &WorkflowState) -> Result<StateBlob, WorkflowError>;
    fn decode(&self, blob: &StateBlob) -> Result<WorkflowState, WorkflowError>;
}

/// JSON encoding
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPersistence;

impl StatePersistence for JsonPersistence {
    fn encode(&self, state: &WorkflowState) -> Result<StateBlob, WorkflowError> {
        serde_json::to_vec(state)
            .map(StateBlob)
            .map_err(|e| WorkflowError::Persistence(e.to_string()))
    }

    fn decode(&self, blob: &StateBlob) -> Result<WorkflowState, WorkflowError> {
        let state: WorkflowState =
            serde_json::from_slice(blob.as_bytes()).map_err(|e| WorkflowError::Persistence(e.to_string()))?;
        if state.version > STATE_VERSION {
            return Err(WorkflowError::Persistence(format!(
                "state version {} is newer than supported version {STATE_VERSION}",
                state.version
            )));
        }
        Ok(state)
    }
}

/// Per-agent outcome of a restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RestoreStatus {
    Restored,
    Skipped { reason: String },
}

/// Report returned by `Workflow::restore`; never an error for partial restores
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreResult {
    pub agents: BTreeMap<String, RestoreStatus>,
    /// Node results carried over
    pub nodes_restored: usize,
    /// Node results dropped because the node no longer exists
    pub nodes_skipped: usize,
}

impl RestoreResult {
    pub fn restored(&self) -> Vec<&str> {
        self.agents
            .iter()
            .filter(|(_, s)| **s == RestoreStatus::Restored)
            .map(|(a, _)| a.as_str())
            .collect()
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.agents
            .iter()
            .filter(|(_, s)| matches!(s, RestoreStatus::Skipped { .. }))
            .map(|(a, _)| a.as_str())
            .collect()
    }

    /// Whether everything in the snapshot was restored
    pub fn is_complete(&self) -> bool {
        self.nodes_skipped == 0 && self.skipped().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_persistence_round() {
        let mut state = WorkflowState {
            version: STATE_VERSION,
            ..Default::default()
        };
        state
            .agents
            .insert("coder".into(), vec![Message::user("hi"), Message::assistant("hello", vec![])]);
        state
            .results
            .insert("plan".into(), NodeResult::completed("plan", "steps"));

        let blob = JsonPersistence.encode(&state).unwrap();
        assert_eq!(JsonPersistence.decode(&blob).unwrap(), state);
    }

    #[test]
    fn test_rejects_garbage_and_future_versions() {
        assert!(matches!(
            JsonPersistence.decode(&StateBlob(b"not json".to_vec())),
            Err(WorkflowError::Persistence(_))
        ));
        let future = StateBlob(br#"{"version": 99}"#.to_vec());
        assert!(JsonPersistence.decode(&future).is_err());
    }

    #[test]
    fn test_restore_result_partitions() {
        let mut result = RestoreResult::default();
        result.agents.insert("a".into(), RestoreStatus::Restored);
        result.agents.insert(
            "gone".into(),
            RestoreStatus::Skipped {
                reason: "not configured".into(),
            },
        );
        assert_eq!(result.restored(), vec!["a"]);
        assert_eq!(result.skipped(), vec!["gone"]);
        assert!(!result.is_complete());
    }
}
