//! Per-run session state
//!
//! A [`Session`] is created for every top-level run (and a child session for
//! each workflow node). It owns the cancellation token threaded through every
//! child task, the ordered event log, the finish-swarm flag and run totals.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::channel::{EventKind, EventSink, SwarmEvent};
use crate::model::TokenUsage;
use crate::storage::Scratchpad;

/// Usage and cost accumulated over a run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunTotals {
    pub usage: TokenUsage,
    pub cost: f64,
}

/// State shared by every task in one run
pub struct Session {
    /// Run identifier
    pub id: Uuid,
    cancel: CancellationToken,
    sink: Option<EventSink>,
    sequence: Arc<AtomicU64>,
    events: Mutex<Vec<SwarmEvent>>,
    finish: Mutex<Option<String>>,
    totals: Mutex<RunTotals>,
    participants: Mutex<BTreeSet<String>>,
    scratchpad: Arc<Scratchpad>,
}

impl Session {
    /// Create a root session
    pub fn new(sink: Option<EventSink>) -> Self {
        Self::with_cancel(CancellationToken::new(), sink)
    }

    /// Create a root session bound to an existing token
    pub fn with_cancel(cancel: CancellationToken, sink: Option<EventSink>) -> Self {
        let id = Uuid::new_v4();
        debug!(session_id = %id, "Creating run session");

        Self {
            id,
            cancel,
            sink,
            sequence: Arc::new(AtomicU64::new(0)),
            events: Mutex::new(Vec::new()),
            finish: Mutex::new(None),
            totals: Mutex::new(RunTotals::default()),
            participants: Mutex::new(BTreeSet::new()),
            scratchpad: Arc::new(Scratchpad::new()),
        }
    }

    /// Nested session: cancelled with its parent, shares the sink, sequence
    /// counter and scratchpad, but has its own log and finish flag.
    pub fn child(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            cancel: self.cancel.child_token(),
            sink: self.sink.clone(),
            sequence: Arc::clone(&self.sequence),
            events: Mutex::new(Vec::new()),
            finish: Mutex::new(None),
            totals: Mutex::new(RunTotals::default()),
            participants: Mutex::new(BTreeSet::new()),
            scratchpad: Arc::clone(&self.scratchpad),
        }
    }

    /// Merge a finished child's log, totals and participants
    pub fn absorb(&self, child: &Session) {
        self.events.lock().extend(child.events());
        let child_totals = child.totals();
        {
            let mut totals = self.totals.lock();
            totals.usage.add(&child_totals.usage);
            totals.cost += child_totals.cost;
        }
        self.participants.lock().extend(child.participants());
    }

    /// Record an event and forward it to the sink
    pub fn emit(&self, kind: EventKind, agent: &str, metadata: Value) {
        let event = SwarmEvent {
            kind,
            agent: agent.to_string(),
            timestamp: Utc::now(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            metadata,
        };
        if let Some(sink) = &self.sink {
            sink.send(event.clone());
        }
        self.events.lock().push(event);
    }

    /// Snapshot of the ordered event log
    pub fn events(&self) -> Vec<SwarmEvent> {
        self.events.lock().clone()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        info!(session_id = %self.id, "Cancelling run");
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Ask the whole run to stop with `content`; the first request wins
    pub fn request_finish(&self, content: impl Into<String>) {
        let mut guard = self.finish.lock();
        if guard.is_none() {
            *guard = Some(content.into());
        }
    }

    pub fn finish_requested(&self) -> Option<String> {
        self.finish.lock().clone()
    }

    pub fn record_usage(&self, usage: &TokenUsage, cost: f64) {
        let mut totals = self.totals.lock();
        totals.usage.add(usage);
        totals.cost += cost;
    }

    pub fn totals(&self) -> RunTotals {
        self.totals.lock().clone()
    }

    pub fn mark_participant(&self, agent: &str) {
        self.participants.lock().insert(agent.to_string());
    }

    /// Agent names that took part, sorted
    pub fn participants(&self) -> Vec<String> {
        self.participants.lock().iter().cloned().collect()
    }

    pub fn scratchpad(&self) -> &Arc<Scratchpad> {
        &self.scratchpad
    }
}
