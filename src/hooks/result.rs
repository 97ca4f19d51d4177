//! The single decision produced for each hook firing

use serde::{Deserialize, Serialize};

/// Outcome of a hook callback.
///
/// Interpretation belongs to the caller: a `Halt` on `pre_tool_use` becomes
/// the tool's output, a `Reprompt` only means something on `swarm_stop`, and
/// `FinishSwarm` ends the run from any event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "message", rename_all = "snake_case")]
pub enum HookResult {
    /// No opinion
    #[default]
    Continue,
    /// Abort the current action with a message
    Halt(String),
    /// Substitute the content or output being produced
    Replace(String),
    /// Resubmit the run with a new prompt (swarm_stop only)
    Reprompt(String),
    /// End the current agent turn with this content
    FinishAgent(String),
    /// End the whole run with this content
    FinishSwarm(String),
}

impl HookResult {
    pub fn is_continue(&self) -> bool {
        matches!(self, HookResult::Continue)
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            HookResult::Continue => None,
            HookResult::Halt(m)
            | HookResult::Replace(m)
            | HookResult::Reprompt(m)
            | HookResult::FinishAgent(m)
            | HookResult::FinishSwarm(m) => Some(m),
        }
    }

    /// Short name for logs and events
    pub fn decision(&self) -> &'static str {
        match self {
            HookResult::Continue => "continue",
            HookResult::Halt(_) => "halt",
            HookResult::Replace(_) => "replace",
            HookResult::Reprompt(_) => "reprompt",
            HookResult::FinishAgent(_) => "finish_agent",
            HookResult::FinishSwarm(_) => "finish_swarm",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shape() {
        let halt: HookResult =
            serde_json::from_str(r#"{"decision": "halt", "message": "nope"}"#).unwrap();
        assert_eq!(halt, HookResult::Halt("nope".into()));

        let cont: HookResult = serde_json::from_str(r#"{"decision": "continue"}"#).unwrap();
        assert!(cont.is_continue());
        assert_eq!(cont.message(), None);
    }

    #[test]
    fn test_decision_names() {
        assert_eq!(HookResult::FinishSwarm("x".into()).decision(), "finish_swarm");
        assert_eq!(HookResult::default().decision(), "continue");
    }
}
