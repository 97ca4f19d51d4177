//! Error types for swarms and workflows

use thiserror::Error;

use crate::hooks::HookEvent;

/// Errors that can occur while assembling or running a swarm
#[derive(Debug, Clone, Error)]
pub enum SwarmError {
    /// Two agent definitions share a name
    #[error("Duplicate agent: {0}")]
    DuplicateAgent(String),

    /// Agent referenced but never defined
    #[error("Agent not found: {0}")]
    UnknownAgent(String),

    /// Delegation target that is not a defined agent
    #[error("Agent '{agent}' delegates to unknown agent '{target}'")]
    UnknownDelegationTarget { agent: String, target: String },

    /// Tool listed on a definition but missing from the catalog
    #[error("Agent '{agent}' declares unknown tool '{tool}'")]
    UnknownTool { agent: String, tool: String },

    /// Named hook referenced by a definition but never registered
    #[error("Unknown named hook: {0}")]
    UnknownNamedHook(String),

    /// Matcher pattern that does not compile
    #[error("Invalid matcher '{pattern}': {reason}")]
    InvalidMatcher { pattern: String, reason: String },

    /// Static cycle among primary agent names
    #[error("Circular delegation: {}", path.join(" -> "))]
    DelegationCycle { path: Vec<String> },

    /// Runtime delegation loop on the active call stack
    #[error("Delegation loop: {} -> {target}", stack.join(" -> "))]
    DynamicDelegationCycle { stack: Vec<String>, target: String },

    /// Configuration value out of range
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    /// A hook halted execution
    #[error("Halted by {event} hook: {message}")]
    HookHalted { event: HookEvent, message: String },

    /// Language model call failed
    #[error("Model error for agent '{agent}': {message}")]
    Model { agent: String, message: String },

    /// Tool execution failed
    #[error("Tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    /// Agent exceeded its turn budget for one ask
    #[error("Agent '{agent}' exceeded {limit} turns")]
    TurnLimitExceeded { agent: String, limit: usize },

    /// Run was cancelled
    #[error("Run cancelled")]
    Cancelled,
}

impl SwarmError {
    /// Whether this error must abort the whole run instead of being
    /// handed back to a delegator as a tool error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SwarmError::DynamicDelegationCycle { .. } | SwarmError::Cancelled
        )
    }

    /// Whether this error is raised at setup time
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SwarmError::DuplicateAgent(_)
                | SwarmError::UnknownAgent(_)
                | SwarmError::UnknownDelegationTarget { .. }
                | SwarmError::UnknownTool { .. }
                | SwarmError::UnknownNamedHook(_)
                | SwarmError::InvalidMatcher { .. }
                | SwarmError::DelegationCycle { .. }
                | SwarmError::InvalidConfig(_)
        )
    }

    /// Recover a `SwarmError` that travelled through an `anyhow` boundary
    pub fn from_anyhow(err: &anyhow::Error) -> Option<&SwarmError> {
        err.downcast_ref::<SwarmError>()
    }
}

/// Errors raised while building or running a workflow
#[derive(Debug, Clone, Error)]
pub enum WorkflowError {
    /// Node referenced (dependency or goto target) but never defined
    #[error("Node not found: {0}")]
    UnknownNode(String),

    /// Configured start node does not exist
    #[error("Start node not found: {0}")]
    MissingStartNode(String),

    /// Configured start node is not a root
    #[error("Start node '{0}' has dependencies")]
    StartNodeHasDependencies(String),

    /// Two nodes share a name
    #[error("Duplicate node: {0}")]
    DuplicateNode(String),

    /// Static dependency edges form a cycle
    #[error("Dependency cycle among nodes: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    /// Control signal built without content
    #[error("{0} requires content, got none")]
    NullControlContent(&'static str),

    /// Node executions exceeded the configured bound
    #[error("Workflow exceeded {limit} node visits")]
    VisitLimitExceeded { limit: usize },

    /// Node reached before its dependencies finished
    #[error("Node '{node}' is waiting on '{dependency}'")]
    DependencyNotReady { node: String, dependency: String },

    /// Transformer failed
    #[error("Transformer for node '{node}' failed: {message}")]
    Transformer { node: String, message: String },

    /// State could not be encoded or decoded
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error(transparent)]
    Swarm(#[from] SwarmError),
}

impl WorkflowError {
    /// Whether this error is raised at setup time
    pub fn is_configuration(&self) -> bool {
        match self {
            WorkflowError::UnknownNode(_)
            | WorkflowError::MissingStartNode(_)
            | WorkflowError::StartNodeHasDependencies(_)
            | WorkflowError::DuplicateNode(_)
            | WorkflowError::DependencyCycle(_) => true,
            WorkflowError::Swarm(e) => e.is_configuration(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let cycle = SwarmError::DynamicDelegationCycle {
            stack: vec!["a".into(), "b@a".into()],
            target: "a@b@a".into(),
        };
        assert!(cycle.is_fatal());
        assert!(SwarmError::Cancelled.is_fatal());

        let model = SwarmError::Model {
            agent: "a".into(),
            message: "boom".into(),
        };
        assert!(!model.is_fatal());
    }

    #[test]
    fn test_cycle_display() {
        let err = SwarmError::DelegationCycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Circular delegation: a -> b -> a");
        assert!(err.is_configuration());
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err = anyhow::Error::new(SwarmError::Cancelled);
        assert!(matches!(
            SwarmError::from_anyhow(&err),
            Some(SwarmError::Cancelled)
        ));
    }

    #[test]
    fn test_workflow_error_wraps_swarm_error() {
        let err: WorkflowError = SwarmError::DuplicateAgent("a".into()).into();
        assert!(err.is_configuration());
        assert_eq!(err.to_string(), "Duplicate agent: a");

        let null = WorkflowError::NullControlContent("goto_node");
        assert_eq!(null.to_string(), "goto_node requires content, got none");
        assert!(!null.is_configuration());
    }
}
