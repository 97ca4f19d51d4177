//! Agent definitions - immutable per-role configuration

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::hooks::HookEvent;

/// How delegation instances are materialized for a target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// One private instance per delegator (`base@delegator`)
    #[default]
    Isolated,
    /// A single instance shared by every delegator
    Shared,
}

/// One delegation edge declared on an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationTarget {
    /// Primary name of the agent delegated to
    pub agent: String,
    /// Tool name exposed to the delegator (defaults to `delegate_to_<agent>`)
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub isolation: Isolation,
}

impl DelegationTarget {
    pub fn isolated(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            tool_name: None,
            isolation: Isolation::Isolated,
        }
    }

    pub fn shared(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            tool_name: None,
            isolation: Isolation::Shared,
        }
    }

    /// Override the tool name shown to the delegator
    pub fn with_tool_name(mut self, name: impl Into<String>) -> Self {
        self.tool_name = Some(name.into());
        self
    }

    /// Tool name registered on the delegator
    pub fn resolved_tool_name(&self) -> String {
        self.tool_name
            .clone()
            .unwrap_or_else(|| format!("delegate_to_{}", self.agent))
    }
}

/// Permission rule for a single tool, checked against one parameter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPermission {
    /// Parameter whose string value is checked (e.g. `path`, `command`)
    pub parameter: String,
    /// Regex patterns; when non-empty one must match
    #[serde(default)]
    pub allow: Vec<String>,
    /// Regex patterns; any match denies the call
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Binds a named hook from the registry to one of this agent's events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookBinding {
    pub event: HookEvent,
    #[serde(default)]
    pub matcher: Option<String>,
    #[serde(default)]
    pub priority: i32,
    /// Identifier passed to `HookRegistry::register_named`
    pub hook: String,
}

/// Immutable configuration for one agent role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub system_prompt: String,
    /// Tool names resolved against the swarm's tool catalog
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub delegates_to: Vec<DelegationTarget>,
    /// Overrides the swarm-wide local tool concurrency
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// Tokens; falls back to `SwarmConfig::default_context_window`
    #[serde(default)]
    pub context_window: Option<u64>,
    /// Keyed by tool name
    #[serde(default)]
    pub permissions: BTreeMap<String, ToolPermission>,
    #[serde(default)]
    pub hooks: Vec<HookBinding>,
    /// Opaque plugin configuration keyed by plugin name
    #[serde(default)]
    pub plugins: BTreeMap<String, serde_json::Value>,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            provider: None,
            description: String::new(),
            system_prompt: String::new(),
            tools: Vec::new(),
            delegates_to: Vec::new(),
            concurrency: None,
            directory: None,
            context_window: None,
            permissions: BTreeMap::new(),
            hooks: Vec::new(),
            plugins: BTreeMap::new(),
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tools.push(tool.into());
        self
    }

    pub fn delegates_to(mut self, target: DelegationTarget) -> Self {
        self.delegates_to.push(target);
        self
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    pub fn with_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.directory = Some(dir.into());
        self
    }

    pub fn with_context_window(mut self, tokens: u64) -> Self {
        self.context_window = Some(tokens);
        self
    }

    pub fn with_permission(mut self, tool: impl Into<String>, rule: ToolPermission) -> Self {
        self.permissions.insert(tool.into(), rule);
        self
    }

    pub fn with_hook(mut self, binding: HookBinding) -> Self {
        self.hooks.push(binding);
        self
    }

    pub fn with_plugin(mut self, plugin: impl Into<String>, config: serde_json::Value) -> Self {
        self.plugins.insert(plugin.into(), config);
        self
    }

    /// Delegation edge to `target`, if declared
    pub fn delegation(&self, target: &str) -> Option<&DelegationTarget> {
        self.delegates_to.iter().find(|d| d.agent == target)
    }
}

/// Split an instance name into its base agent and delegator chain.
///
/// `"b@a"` → `("b", Some("a"))`, `"a@b@a"` → `("a", Some("b@a"))`.
pub fn split_instance_name(instance: &str) -> (&str, Option<&str>) {
    match instance.split_once('@') {
        Some((base, delegator)) => (base, Some(delegator)),
        None => (instance, None),
    }
}

/// Instance name for `target` when invoked by `delegator`
pub fn delegation_instance_name(target: &DelegationTarget, delegator: &str) -> String {
    match target.isolation {
        Isolation::Isolated => format!("{}@{}", target.agent, delegator),
        Isolation::Shared => target.agent.clone(),
    }
}
