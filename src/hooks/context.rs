//! Immutable snapshot handed to every hook callback
//!
//! Metadata keys by event:
//!
//! | event                        | metadata                                    |
//! |------------------------------|---------------------------------------------|
//! | `swarm_start`                | `prompt`                                    |
//! | `swarm_stop`                 | `content`, `success`, `reprompts`           |
//! | `first_message`/`user_prompt`| `prompt`                                    |
//! | `agent_step`                 | `content`, `tool_calls`, `turn`             |
//! | `agent_stop`                 | `content`                                   |
//! | `pre/post_delegation`        | `tool`, `target`, `instance`, `message` (+`result`) |
//! | `context_warning`            | `threshold`, `usage_percent`                |
//! | `breakpoint_*`               | `label`                                     |
//!
//! Tool events carry `tool_call` and, after execution, `tool_result`.

use serde::Serialize;
use serde_json::{Map, Value};

use super::HookEvent;
use crate::definition::split_instance_name;
use crate::message::ToolCall;
use crate::tool::ToolOutput;

#[derive(Debug, Clone, Serialize)]
pub struct HookContext {
    pub event: HookEvent,
    /// Instance name (`base@delegator` for isolated delegations)
    pub agent: String,
    pub base_agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolOutput>,
    pub metadata: Map<String, Value>,
}

impl HookContext {
    pub fn new(event: HookEvent, agent: impl Into<String>) -> Self {
        let agent = agent.into();
        let base_agent = split_instance_name(&agent).0.to_string();
        Self {
            event,
            agent,
            base_agent,
            tool_call: None,
            tool_result: None,
            metadata: Map::new(),
        }
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_call = Some(call);
        self
    }

    pub fn with_tool_result(mut self, output: ToolOutput) -> Self {
        self.tool_result = Some(output);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Name tested against hook matchers; delegation events use the
    /// `delegate_to_*` tool name from metadata
    pub fn tool_name(&self) -> Option<&str> {
        self.tool_call
            .as_ref()
            .map(|c| c.name.as_str())
            .or_else(|| self.meta_str("tool"))
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}
