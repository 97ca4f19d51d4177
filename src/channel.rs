//! Event stream for observing runs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Kinds of lifecycle events recorded during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SwarmStart,
    SwarmStop,
    UserPrompt,
    AgentStep,
    AgentStop,
    ToolCall,
    ToolResult,
    DelegationStart,
    DelegationComplete,
    ContextWarning,
    ContextCompressed,
    LlmRetry,
    LlmRetryExhausted,
    HookDecision,
    NodeStart,
    NodeStop,
    WorkflowStart,
    WorkflowStop,
    BreakpointEnter,
    BreakpointExit,
    Cancelled,
    Teardown,
}

/// A flat event record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmEvent {
    pub kind: EventKind,
    /// Instance name of the agent, or the node/swarm name for run-level events
    pub agent: String,
    pub timestamp: DateTime<Utc>,
    /// Monotonic within a run
    pub sequence: u64,
    #[serde(default)]
    pub metadata: Value,
}

/// Sending half handed to a swarm or workflow
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SwarmEvent>,
}

impl EventSink {
    /// Forward an event; a dropped receiver is not an error
    pub fn send(&self, event: SwarmEvent) {
        let _ = self.tx.send(event);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half for observers
pub struct EventChannel {
    rx: mpsc::UnboundedReceiver<SwarmEvent>,
}

impl EventChannel {
    /// Create a connected sink/channel pair
    pub fn new() -> (EventSink, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink { tx }, Self { rx })
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv(&mut self) -> Option<SwarmEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next event; `None` once every sink is dropped
    pub async fn recv(&mut self) -> Option<SwarmEvent> {
        self.rx.recv().await
    }

    /// Drain whatever is buffered right now
    pub fn drain(&mut self) -> Vec<SwarmEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, sequence: u64) -> SwarmEvent {
        SwarmEvent {
            kind,
            agent: "lead".into(),
            timestamp: Utc::now(),
            sequence,
            metadata: Value::Null,
        }
    }

    #[test]
    fn test_channel_creation() {
        let (sink, _channel) = EventChannel::new();
        assert!(!sink.is_closed());
    }

    #[test]
    fn test_drain_preserves_order() {
        let (sink, mut channel) = EventChannel::new();
        sink.send(event(EventKind::SwarmStart, 0));
        sink.send(event(EventKind::SwarmStop, 1));

        let drained = channel.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].kind, EventKind::SwarmStart);
        assert!(channel.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_recv_ends_when_sink_dropped() {
        let (sink, mut channel) = EventChannel::new();
        sink.send(event(EventKind::ToolCall, 0));
        drop(sink);

        assert!(channel.recv().await.is_some());
        assert!(channel.recv().await.is_none());
    }

    #[test]
    fn test_event_kind_serializes_snake_case() {
        let json = serde_json::to_value(EventKind::DelegationStart).unwrap();
        assert_eq!(json, Value::String("delegation_start".into()));
    }
}
