//! Delegation tools wired onto delegating agents

use std::sync::Weak;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::channel::EventKind;
use crate::definition::{delegation_instance_name, DelegationTarget};
use crate::graph::AgentGraph;
use crate::hooks::{HookContext, HookEvent, HookResult};
use crate::tool::{Tool, ToolContext, ToolOutput};

/// Tool that hands a message to another agent and returns its answer
pub(crate) struct DelegationTool {
    graph: Weak<AgentGraph>,
    delegator: String,
    target: DelegationTarget,
    tool_name: String,
    description: String,
}

impl DelegationTool {
    pub(crate) fn new(
        graph: Weak<AgentGraph>,
        delegator: impl Into<String>,
        target: DelegationTarget,
        target_description: &str,
    ) -> Self {
        let description = if target_description.is_empty() {
            format!("Delegate a task to the {} agent", target.agent)
        } else {
            format!("Delegate a task to {}: {}", target.agent, target_description)
        };
        Self {
            graph,
            delegator: delegator.into(),
            tool_name: target.resolved_tool_name(),
            target,
            description,
        }
    }

    /// Instance the call lands on
    pub(crate) fn instance_name(&self) -> String {
        delegation_instance_name(&self.target, &self.delegator)
    }
}

#[async_trait]
impl Tool for DelegationTool {
    fn name(&self) -> &str {
        &self.tool_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "Task or question for the delegate"
                }
            },
            "required": ["message"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let Some(message) = params.get("message").and_then(Value::as_str) else {
            return Ok(ToolOutput::error("Missing required parameter 'message'"));
        };
        let graph = self
            .graph
            .upgrade()
            .ok_or_else(|| anyhow!("agent graph dropped during delegation"))?;
        let session = &ctx.session;
        let instance = self.instance_name();

        // loops abort the whole run rather than returning to the delegator
        ctx.call_stack.check(&instance)?;

        let delegator = graph.get_or_create(&self.delegator).await?;
        let pre = HookContext::new(HookEvent::PreDelegation, &self.delegator)
            .with_metadata("tool", self.tool_name.as_str())
            .with_metadata("target", self.target.agent.as_str())
            .with_metadata("instance", instance.as_str())
            .with_metadata("message", message);
        match delegator.fire(session, pre).await? {
            HookResult::Halt(reason) => return Ok(ToolOutput::error(reason)),
            HookResult::Replace(content) => return Ok(ToolOutput::success(content)),
            HookResult::FinishSwarm(content) => {
                session.request_finish(content.as_str());
                return Ok(ToolOutput::success(content));
            }
            _ => {}
        }

        info!(delegator = %self.delegator, target = %instance, "Delegating");
        session.emit(
            EventKind::DelegationStart,
            &self.delegator,
            json!({ "target": self.target.agent, "instance": instance, "message": message }),
        );

        let output = match graph.get_or_create(&instance).await {
            Ok(target) => match target.ask(message, session, &ctx.call_stack.push(instance.as_str())).await {
                Ok(content) => ToolOutput::success(content),
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!(delegator = %self.delegator, target = %instance, error = %e, "Delegation failed");
                    ToolOutput::error(e.to_string())
                }
            },
            Err(e) => ToolOutput::error(e.to_string()),
        };

        let post = HookContext::new(HookEvent::PostDelegation, &self.delegator)
            .with_metadata("tool", self.tool_name.as_str())
            .with_metadata("target", self.target.agent.as_str())
            .with_metadata("instance", instance.as_str())
            .with_metadata("message", message)
            .with_metadata("result", output.content.as_str());
        let output = match delegator.fire(session, post).await? {
            HookResult::Replace(content) => ToolOutput {
                content,
                success: output.success,
            },
            HookResult::Halt(reason) => ToolOutput::error(reason),
            HookResult::FinishSwarm(content) => {
                session.request_finish(content);
                output
            }
            _ => output,
        };

        info!(delegator = %self.delegator, target = %instance, success = output.success, "Delegation complete");
        session.emit(
            EventKind::DelegationComplete,
            &self.delegator,
            json!({ "target": self.target.agent, "instance": instance, "success": output.success }),
        );
        Ok(output)
    }
}
