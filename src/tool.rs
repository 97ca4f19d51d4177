//! Tool boundary - callables routed by the agent loop
//!
//! Concrete tools (file I/O, shells, search) live outside this crate. The
//! core only routes calls, wraps them with permission checks and feeds the
//! output back into history.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::definition::ToolPermission;
use crate::error::SwarmError;
use crate::hierarchy::CallStack;
use crate::model::ToolSpec;
use crate::session::Session;
use crate::storage::{AgentMemory, Scratchpad};

/// Tool execution result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    pub success: bool,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: true,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: false,
        }
    }
}

/// Everything a tool may need about its caller
#[derive(Clone)]
pub struct ToolContext {
    /// Calling instance name
    pub agent: String,
    pub base_agent: String,
    pub directory: PathBuf,
    pub call_stack: CallStack,
    pub session: Arc<Session>,
    pub memory: Arc<AgentMemory>,
}

impl ToolContext {
    pub fn cancel_token(&self) -> &CancellationToken {
        self.session.cancel_token()
    }

    pub fn scratchpad(&self) -> &Arc<Scratchpad> {
        self.session.scratchpad()
    }
}

/// A callable exposed to agents
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// JSON schema for the parameters
    fn parameters(&self) -> Value {
        json!({ "type": "object" })
    }

    /// Errors are reported to the model as failed outputs unless they wrap
    /// a fatal [`SwarmError`].
    async fn execute(&self, params: Value, ctx: &ToolContext) -> anyhow::Result<ToolOutput>;

    /// Release external connections; called once when a run ends
    async fn shutdown(&self) {}

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Catalog of tools available to agent definitions
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; a tool with the same name is replaced
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            warn!(tool = %name, "Replaced tool in registry");
        }
    }

    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Shut every tool down
    pub async fn shutdown_all(&self) {
        for (name, tool) in &self.tools {
            debug!(tool = %name, "Shutting down tool");
            tool.shutdown().await;
        }
    }
}

/// Compile a rule's allow and deny patterns
pub(crate) fn compile_permission(rule: &ToolPermission) -> Result<(Vec<Regex>, Vec<Regex>), SwarmError> {
    let compile = |patterns: &[String]| -> Result<Vec<Regex>, SwarmError> {
        patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| SwarmError::InvalidMatcher {
                    pattern: p.clone(),
                    reason: e.to_string(),
                })
            })
            .collect()
    };
    Ok((compile(&rule.allow)?, compile(&rule.deny)?))
}

/// Tool wrapped with an agent's permission rule
pub struct PermissionedTool {
    inner: Arc<dyn Tool>,
    parameter: String,
    allow: Vec<Regex>,
    deny: Vec<Regex>,
}

impl PermissionedTool {
    pub fn new(inner: Arc<dyn Tool>, rule: &ToolPermission) -> Result<Self, SwarmError> {
        let (allow, deny) = compile_permission(rule)?;
        Ok(Self {
            parameter: rule.parameter.clone(),
            allow,
            deny,
            inner,
        })
    }

    /// Reason the call is refused, if any
    fn denial(&self, params: &Value) -> Option<String> {
        let Some(value) = params.get(&self.parameter).and_then(Value::as_str) else {
            if self.allow.is_empty() {
                return None;
            }
            return Some(format!(
                "Permission denied: missing string parameter '{}' required by the allowed list",
                self.parameter
            ));
        };
        if let Some(re) = self.deny.iter().find(|re| re.is_match(value)) {
            return Some(format!(
                "Permission denied: {} '{}' matches denied pattern '{}'",
                self.parameter,
                value,
                re.as_str()
            ));
        }
        if !self.allow.is_empty() && !self.allow.iter().any(|re| re.is_match(value)) {
            return Some(format!(
                "Permission denied: {} '{}' is not in the allowed list",
                self.parameter, value
            ));
        }
        None
    }
}

#[async_trait]
impl Tool for PermissionedTool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn parameters(&self) -> Value {
        self.inner.parameters()
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        if let Some(reason) = self.denial(&params) {
            warn!(agent = %ctx.agent, tool = self.name(), "{reason}");
            return Ok(ToolOutput::error(reason));
        }
        self.inner.execute(params, ctx).await
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}
