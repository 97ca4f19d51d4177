//! Lifecycle events that hooks can intercept

use serde::{Deserialize, Serialize};

/// Fixed set of interception points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    SwarmStart,
    SwarmStop,
    FirstMessage,
    UserPrompt,
    AgentStep,
    AgentStop,
    PreToolUse,
    PostToolUse,
    PreDelegation,
    PostDelegation,
    ContextWarning,
    BreakpointEnter,
    BreakpointExit,
}

impl HookEvent {
    /// Every event, in lifecycle order
    pub fn all() -> &'static [HookEvent] {
        &[
            HookEvent::SwarmStart,
            HookEvent::SwarmStop,
            HookEvent::FirstMessage,
            HookEvent::UserPrompt,
            HookEvent::AgentStep,
            HookEvent::AgentStop,
            HookEvent::PreToolUse,
            HookEvent::PostToolUse,
            HookEvent::PreDelegation,
            HookEvent::PostDelegation,
            HookEvent::ContextWarning,
            HookEvent::BreakpointEnter,
            HookEvent::BreakpointExit,
        ]
    }

    /// Configuration name
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::SwarmStart => "swarm_start",
            HookEvent::SwarmStop => "swarm_stop",
            HookEvent::FirstMessage => "first_message",
            HookEvent::UserPrompt => "user_prompt",
            HookEvent::AgentStep => "agent_step",
            HookEvent::AgentStop => "agent_stop",
            HookEvent::PreToolUse => "pre_tool_use",
            HookEvent::PostToolUse => "post_tool_use",
            HookEvent::PreDelegation => "pre_delegation",
            HookEvent::PostDelegation => "post_delegation",
            HookEvent::ContextWarning => "context_warning",
            HookEvent::BreakpointEnter => "breakpoint_enter",
            HookEvent::BreakpointExit => "breakpoint_exit",
        }
    }

    /// Parse from configuration name
    pub fn parse(s: &str) -> Option<Self> {
        Self::all().iter().copied().find(|event| event.as_str() == s)
    }

    /// Whether a matcher on this event is tested against a tool name
    pub fn carries_tool(&self) -> bool {
        matches!(
            self,
            HookEvent::PreToolUse
                | HookEvent::PostToolUse
                | HookEvent::PreDelegation
                | HookEvent::PostDelegation
        )
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trips_names() {
        for event in HookEvent::all() {
            assert_eq!(HookEvent::parse(event.as_str()), Some(*event));
        }
        assert_eq!(HookEvent::parse("on_whatever"), None);
    }

    #[test]
    fn test_serde_name_matches_display() {
        let json = serde_json::to_value(HookEvent::PreToolUse).unwrap();
        assert_eq!(json, serde_json::Value::String(HookEvent::PreToolUse.to_string()));
    }
}
