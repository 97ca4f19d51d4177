//! Scripted collaborators for unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::agent::RunResources;
use crate::config::SwarmConfig;
use crate::definition::split_instance_name;
use crate::hierarchy::CallStack;
use crate::message::Message;
use crate::model::{ModelClient, ModelRequest, ModelResponse};
use crate::session::Session;
use crate::storage::AgentMemory;
use crate::tool::{Tool, ToolContext, ToolOutput};

#[derive(Clone)]
enum Step {
    Respond(ModelResponse),
    Fail(String),
    /// Block until the run is cancelled
    Hang,
}

/// Model client answering from per-agent scripts.
///
/// Scripts are looked up by instance name first, then by base name. An
/// agent without a script answers `"<instance> done"`.
#[derive(Default)]
pub(crate) struct ScriptedModel {
    queued: Mutex<HashMap<String, VecDeque<Step>>>,
    always: Mutex<HashMap<String, Step>>,
    requests: Mutex<Vec<(String, Vec<Message>)>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, agent: &str, response: ModelResponse) -> Self {
        self.push(agent, Step::Respond(response))
    }

    pub fn fail(self, agent: &str, message: &str) -> Self {
        self.push(agent, Step::Fail(message.to_string()))
    }

    pub fn hang(self, agent: &str) -> Self {
        self.always.lock().insert(agent.to_string(), Step::Hang);
        self
    }

    /// Answer every call of `agent` once the queue is empty
    pub fn respond_always(self, agent: &str, response: ModelResponse) -> Self {
        self.always
            .lock()
            .insert(agent.to_string(), Step::Respond(response));
        self
    }

    /// Sleep inside every call so concurrency can be observed
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn push(self, agent: &str, step: Step) -> Self {
        self.queued
            .lock()
            .entry(agent.to_string())
            .or_default()
            .push_back(step);
        self
    }

    fn next_step(&self, agent: &str) -> Option<Step> {
        let base = split_instance_name(agent).0;
        for key in [agent, base] {
            if let Some(step) = self.queued.lock().get_mut(key).and_then(VecDeque::pop_front) {
                return Some(step);
            }
            if let Some(step) = self.always.lock().get(key) {
                return Some(step.clone());
            }
        }
        None
    }

    /// Number of calls made by `agent` (instance name)
    pub fn calls_for(&self, agent: &str) -> usize {
        self.requests.lock().iter().filter(|(a, _)| a == agent).count()
    }

    /// Message lists sent by `agent`, in call order
    pub fn requests_for(&self, agent: &str) -> Vec<Vec<Message>> {
        self.requests
            .lock()
            .iter()
            .filter(|(a, _)| a == agent)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn total_calls(&self) -> usize {
        self.requests.lock().len()
    }

    /// Highest number of calls observed in flight at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete(&self, request: ModelRequest) -> anyhow::Result<ModelResponse> {
        self.requests
            .lock()
            .push((request.agent.clone(), request.messages.clone()));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let step = self.next_step(&request.agent);
        let result = match step {
            Some(Step::Respond(response)) => Ok(response),
            Some(Step::Fail(message)) => Err(anyhow::anyhow!(message)),
            Some(Step::Hang) => {
                request.cancel.cancelled().await;
                Err(anyhow::anyhow!("cancelled"))
            }
            None => Ok(ModelResponse::text(format!("{} done", request.agent))),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Tool echoing its parameters back
pub(crate) struct EchoTool {
    name: String,
    delay: Option<Duration>,
    fail: bool,
    executions: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl EchoTool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            delay: None,
            fail: false,
            executions: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every execution returns an error
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            anyhow::bail!("{} exploded", self.name);
        }
        Ok(ToolOutput::success(params.to_string()))
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) fn resources(model: Arc<dyn ModelClient>, config: SwarmConfig) -> RunResources {
    RunResources {
        global: Arc::new(tokio::sync::Semaphore::new(config.global_concurrency)),
        config: Arc::new(config),
        model,
    }
}

pub(crate) fn tool_context(agent: &str) -> ToolContext {
    let base = split_instance_name(agent).0.to_string();
    ToolContext {
        agent: agent.to_string(),
        memory: Arc::new(AgentMemory::new(base.as_str())),
        base_agent: base,
        directory: std::env::temp_dir(),
        call_stack: CallStack::root(agent),
        session: Arc::new(Session::new(None)),
    }
}
