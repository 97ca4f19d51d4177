//! Workflow nodes and their results

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::Transformer;
use crate::definition::DelegationTarget;

/// Agent bound to a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAgent {
    pub name: String,
    /// Replaces the definition's delegation targets for this node
    pub delegates_to: Option<Vec<DelegationTarget>>,
    /// Start from an empty history on every visit (default)
    pub reset_context: bool,
}

impl NodeAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delegates_to: None,
            reset_context: true,
        }
    }

    pub fn with_delegates(mut self, targets: Vec<DelegationTarget>) -> Self {
        self.delegates_to = Some(targets);
        self
    }

    /// Keep history across visits of this node and across runs
    pub fn preserve_context(mut self) -> Self {
        self.reset_context = false;
        self
    }
}

/// One stage of a workflow
#[derive(Clone)]
pub struct Node {
    pub name: String,
    pub agents: Vec<NodeAgent>,
    /// Entry agent when several are bound (defaults to the first)
    pub lead: Option<String>,
    pub depends_on: Vec<String>,
    pub input: Option<Arc<dyn Transformer>>,
    pub output: Option<Arc<dyn Transformer>>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agents: Vec::new(),
            lead: None,
            depends_on: Vec::new(),
            input: None,
            output: None,
        }
    }

    /// Bind an agent with default settings
    pub fn agent(self, name: impl Into<String>) -> Self {
        self.with_agent(NodeAgent::new(name))
    }

    pub fn with_agent(mut self, agent: NodeAgent) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn lead(mut self, name: impl Into<String>) -> Self {
        self.lead = Some(name.into());
        self
    }

    pub fn depends_on(mut self, node: impl Into<String>) -> Self {
        self.depends_on.push(node.into());
        self
    }

    pub fn input_transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.input = Some(transformer);
        self
    }

    pub fn output_transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.output = Some(transformer);
        self
    }

    /// Agent that receives the node's prompt
    pub fn lead_agent(&self) -> Option<&str> {
        self.lead
            .as_deref()
            .or_else(|| self.agents.first().map(|a| a.name.as_str()))
    }

    pub fn is_agentless(&self) -> bool {
        self.agents.is_empty()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("agents", &self.agents)
            .field("depends_on", &self.depends_on)
            .field("input", &self.input.is_some())
            .field("output", &self.output.is_some())
            .finish()
    }
}

/// Node lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Skipped,
    Failed,
}

impl NodeStatus {
    /// Finished, so dependents may start
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Skipped | NodeStatus::Failed)
    }
}

/// Recorded outcome of a node visit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node: String,
    pub status: NodeStatus,
    pub content: Option<String>,
    pub error: Option<String>,
}

impl NodeResult {
    pub fn completed(node: &str, content: impl Into<String>) -> Self {
        Self {
            node: node.to_string(),
            status: NodeStatus::Completed,
            content: Some(content.into()),
            error: None,
        }
    }

    pub fn skipped(node: &str, content: impl Into<String>) -> Self {
        Self {
            node: node.to_string(),
            status: NodeStatus::Skipped,
            content: Some(content.into()),
            error: None,
        }
    }

    pub fn failed(node: &str, error: impl Into<String>) -> Self {
        Self {
            node: node.to_string(),
            status: NodeStatus::Failed,
            content: None,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lead_defaults_to_first_agent() {
        let node = Node::new("build").agent("frontend").agent("backend");
        assert_eq!(node.lead_agent(), Some("frontend"));
        assert_eq!(node.clone().lead("backend").lead_agent(), Some("backend"));
        assert!(Node::new("merge").is_agentless());
    }

    #[test]
    fn test_node_agent_defaults() {
        let agent = NodeAgent::new("coder");
        assert!(agent.reset_context);
        assert!(!agent.preserve_context().reset_context);
    }

    #[test]
    fn test_terminal_states() {
        assert!(NodeStatus::Failed.is_terminal());
        assert!(NodeStatus::Skipped.is_terminal());
        assert!(!NodeStatus::Running.is_terminal());
        assert!(NodeResult::failed("n", "boom").is_error());
    }
}
