//! Language model boundary
//!
//! The orchestration core never talks to a provider directly. It hands a
//! [`ModelRequest`] to a [`ModelClient`] implementation and records whether
//! the call ultimately succeeded.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::channel::EventKind;
use crate::message::{Message, ToolCall};
use crate::session::Session;

/// Token accounting for one or more model calls
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens = self.input_tokens + self.output_tokens;
    }
}

/// Tool schema advertised to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Lets a retrying model client surface its attempts as run events
#[derive(Clone)]
pub struct RetryReporter {
    session: Arc<Session>,
    agent: String,
}

impl RetryReporter {
    pub(crate) fn new(session: Arc<Session>, agent: impl Into<String>) -> Self {
        Self {
            session,
            agent: agent.into(),
        }
    }

    /// A failed attempt that will be retried
    pub fn attempt(&self, attempt: u32, error: &str) {
        self.session.emit(
            EventKind::LlmRetry,
            &self.agent,
            json!({ "attempt": attempt, "error": error }),
        );
    }

    /// Retries are exhausted; the call will fail
    pub fn exhausted(&self, attempts: u32, error: &str) {
        self.session.emit(
            EventKind::LlmRetryExhausted,
            &self.agent,
            json!({ "attempts": attempts, "error": error }),
        );
    }
}

/// Everything a model client needs for one completion
pub struct ModelRequest {
    /// Instance name of the calling agent
    pub agent: String,
    pub model: String,
    pub provider: Option<String>,
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub retries: RetryReporter,
    /// Cancelled when the run is cancelled; long calls should observe it
    pub cancel: CancellationToken,
}

/// A single model completion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub cost: f64,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

/// External language model collaborator
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: ModelRequest) -> anyhow::Result<ModelResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_accumulates() {
        let mut usage = TokenUsage::default();
        usage.add(&TokenUsage::new(10, 5));
        usage.add(&TokenUsage::new(1, 2));
        assert_eq!(usage, TokenUsage::new(11, 7));
        assert_eq!(usage.total_tokens, 18);
    }

    #[test]
    fn test_retry_reporter_emits_events() {
        let session = Arc::new(Session::new(None));
        let reporter = RetryReporter::new(Arc::clone(&session), "lead");
        reporter.attempt(1, "rate limited");
        reporter.exhausted(3, "rate limited");

        let kinds: Vec<_> = session.events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::LlmRetry, EventKind::LlmRetryExhausted]);
    }
}
