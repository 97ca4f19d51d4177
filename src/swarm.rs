//! Swarm executor - runs a prompt through the lead agent
//!
//! ```text
//!   execute(prompt)
//!        │
//!        ▼
//!   swarm_start ──halt──▶ error
//!        │
//!        ▼
//!   lead.ask ◀──────────────┐
//!        │                  │ reprompt (bounded)
//!        ▼                  │
//!   swarm_stop ─────────────┘
//!        │
//!        ▼
//!   teardown (always, once)
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::agent::until_cancelled;
use crate::channel::{EventKind, EventSink, SwarmEvent};
use crate::config::SwarmConfig;
use crate::definition::AgentDefinition;
use crate::error::SwarmError;
use crate::graph::{AgentGraph, GraphParts};
use crate::hierarchy::CallStack;
use crate::hooks::{HookContext, HookEvent, HookRegistry, HookResult};
use crate::model::{ModelClient, TokenUsage};
use crate::session::Session;
use crate::storage::MemoryStore;
use crate::tool::ToolRegistry;

/// Outcome of one swarm run
#[derive(Debug, Clone)]
pub struct SwarmResult {
    pub run_id: Uuid,
    /// Final content; `None` when the run failed before producing any
    pub content: Option<String>,
    /// Agent the run was addressed to
    pub agent: String,
    pub events: Vec<SwarmEvent>,
    pub duration: Duration,
    pub success: bool,
    pub error: Option<SwarmError>,
    pub usage: TokenUsage,
    pub cost: f64,
    /// Base names of every agent that took part, sorted
    pub agents: Vec<String>,
}

impl SwarmResult {
    pub fn was_cancelled(&self) -> bool {
        matches!(self.error, Some(SwarmError::Cancelled))
    }
}

/// Builder for [`Swarm`]
pub struct SwarmBuilder {
    definitions: Vec<AgentDefinition>,
    lead: Option<String>,
    hooks: Arc<HookRegistry>,
    tools: ToolRegistry,
    model: Option<Arc<dyn ModelClient>>,
    config: SwarmConfig,
    sink: Option<EventSink>,
}

impl SwarmBuilder {
    pub fn new() -> Self {
        Self {
            definitions: Vec::new(),
            lead: None,
            hooks: Arc::new(HookRegistry::new()),
            tools: ToolRegistry::new(),
            model: None,
            config: SwarmConfig::default(),
            sink: None,
        }
    }

    pub fn agent(mut self, definition: AgentDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Add a definition, failing on a duplicate name
    pub fn add_agent(&mut self, definition: AgentDefinition) -> Result<(), SwarmError> {
        if self.definitions.iter().any(|d| d.name == definition.name) {
            return Err(SwarmError::DuplicateAgent(definition.name));
        }
        self.definitions.push(definition);
        Ok(())
    }

    /// Entry agent (defaults to the first definition)
    pub fn lead(mut self, name: impl Into<String>) -> Self {
        self.lead = Some(name.into());
        self
    }

    pub fn hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn config(mut self, config: SwarmConfig) -> Self {
        self.config = config;
        self
    }

    /// Forward every lifecycle event to `sink`
    pub fn events(mut self, sink: EventSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validate the configuration; every setup error surfaces here
    pub fn build(self) -> Result<Swarm, SwarmError> {
        let model = self
            .model
            .ok_or_else(|| SwarmError::InvalidConfig("no model client configured".into()))?;
        let lead = self
            .lead
            .or_else(|| self.definitions.first().map(|d| d.name.clone()))
            .ok_or_else(|| SwarmError::InvalidConfig("swarm has no agents".into()))?;
        if !self.definitions.iter().any(|d| d.name == lead) {
            return Err(SwarmError::UnknownAgent(lead));
        }

        let graph = AgentGraph::build(GraphParts {
            definitions: self.definitions,
            hooks: self.hooks,
            tools: self.tools,
            model,
            config: self.config,
            memories: MemoryStore::new(),
        })?;

        Ok(Swarm::from_graph(graph, lead, self.sink))
    }
}

impl Default for SwarmBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A validated set of agents driven through one lead
#[derive(Clone)]
pub struct Swarm {
    graph: Arc<AgentGraph>,
    lead: String,
    sink: Option<EventSink>,
}

impl Swarm {
    pub fn builder() -> SwarmBuilder {
        SwarmBuilder::new()
    }

    pub(crate) fn from_graph(graph: Arc<AgentGraph>, lead: String, sink: Option<EventSink>) -> Self {
        Self { graph, lead, sink }
    }

    pub fn graph(&self) -> &Arc<AgentGraph> {
        &self.graph
    }

    pub fn lead(&self) -> &str {
        &self.lead
    }

    /// Run to completion
    pub async fn execute(&self, prompt: &str) -> SwarmResult {
        let session = Arc::new(Session::new(self.sink.clone()));
        self.execute_in(prompt, session).await
    }

    /// Start a run in the background
    pub fn spawn(&self, prompt: impl Into<String>) -> SwarmTask {
        let cancel = CancellationToken::new();
        let session = Arc::new(Session::with_cancel(cancel.clone(), self.sink.clone()));
        let swarm = self.clone();
        let prompt = prompt.into();
        let handle = tokio::spawn(async move { swarm.execute_in(&prompt, session).await });
        SwarmTask { handle, cancel }
    }

    #[instrument(skip(self, prompt, session), fields(run_id = %session.id, lead = %self.lead))]
    async fn execute_in(&self, prompt: &str, session: Arc<Session>) -> SwarmResult {
        let started = Instant::now();
        info!("Starting swarm run");

        let teardown = Teardown::new(self.graph.tools().clone(), Arc::clone(&session), &self.lead);
        let outcome = self.run_in(prompt, &session).await;

        // finalizer: runs on success, failure and cancellation alike
        teardown.run().await;

        let (content, error) = match outcome {
            Ok(content) => (Some(content), None),
            Err(e) => {
                if matches!(e, SwarmError::Cancelled) {
                    info!("Swarm run cancelled");
                    session.emit(EventKind::Cancelled, &self.lead, json!({}));
                } else {
                    error!(error = %e, "Swarm run failed");
                }
                (None, Some(e))
            }
        };

        let totals = session.totals();
        let duration = started.elapsed();
        info!(success = error.is_none(), ?duration, "Swarm run finished");

        SwarmResult {
            run_id: session.id,
            content,
            agent: self.lead.clone(),
            events: session.events(),
            duration,
            success: error.is_none(),
            error,
            usage: totals.usage,
            cost: totals.cost,
            agents: session.participants(),
        }
    }

    /// Drive the lead under an existing session; no teardown
    pub(crate) async fn run_in(&self, prompt: &str, session: &Arc<Session>) -> Result<String, SwarmError> {
        let cancel = session.cancel_token().clone();
        until_cancelled(&cancel, self.drive(prompt, session)).await?
    }

    async fn drive(&self, prompt: &str, session: &Arc<Session>) -> Result<String, SwarmError> {
        let lead = self.graph.get_or_create(&self.lead).await?;
        session.emit(EventKind::SwarmStart, &self.lead, json!({ "prompt": prompt }));

        let start = HookContext::new(HookEvent::SwarmStart, &self.lead).with_metadata("prompt", prompt);
        let mut prompt = prompt.to_string();
        match lead.fire(session, start).await? {
            HookResult::Halt(message) => {
                return Err(SwarmError::HookHalted {
                    event: HookEvent::SwarmStart,
                    message,
                })
            }
            HookResult::FinishSwarm(content) => return Ok(content),
            HookResult::Replace(content) => prompt = content,
            _ => {}
        }

        let max_reprompts = self.graph.config().max_reprompts;
        let mut reprompts = 0;
        loop {
            let outcome = lead.ask(&prompt, session, &CallStack::root(lead.name())).await;
            if let Some(content) = session.finish_requested() {
                info!("Swarm finished early by hook");
                self.emit_stop(session, Some(&content), true, reprompts);
                return Ok(content);
            }
            if matches!(outcome, Err(ref e) if e.is_fatal()) {
                return outcome;
            }

            let (content, success) = match &outcome {
                Ok(content) => (content.clone(), true),
                Err(e) => (e.to_string(), false),
            };
            let stop = HookContext::new(HookEvent::SwarmStop, &self.lead)
                .with_metadata("content", content.as_str())
                .with_metadata("success", success)
                .with_metadata("reprompts", reprompts);

            let decision = lead.fire(session, stop).await?;
            match decision {
                HookResult::FinishSwarm(content) | HookResult::Replace(content) => {
                    self.emit_stop(session, Some(&content), true, reprompts);
                    return Ok(content);
                }
                HookResult::Reprompt(next) if reprompts < max_reprompts => {
                    reprompts += 1;
                    info!(reprompts, "Reprompting swarm");
                    prompt = next;
                    continue;
                }
                HookResult::Reprompt(_) => {
                    warn!(max_reprompts, "Reprompt limit reached, returning last result");
                }
                HookResult::Halt(message) => {
                    self.emit_stop(session, None, false, reprompts);
                    return Err(SwarmError::HookHalted {
                        event: HookEvent::SwarmStop,
                        message,
                    });
                }
                _ => {}
            }

            self.emit_stop(session, outcome.as_deref().ok(), success, reprompts);
            return outcome;
        }
    }

    fn emit_stop(&self, session: &Session, content: Option<&str>, success: bool, reprompts: usize) {
        session.emit(
            EventKind::SwarmStop,
            &self.lead,
            json!({ "content": content, "success": success, "reprompts": reprompts }),
        );
    }
}

/// Shuts tools down once per run.
///
/// Awaiting [`Teardown::run`] is the normal path. Dropping the guard first,
/// as happens when a run future is dropped mid-flight, moves the shutdown
/// onto a background task.
pub(crate) struct Teardown {
    pending: Option<(ToolRegistry, Arc<Session>, String)>,
}

impl Teardown {
    pub(crate) fn new(tools: ToolRegistry, session: Arc<Session>, owner: &str) -> Self {
        Self {
            pending: Some((tools, session, owner.to_string())),
        }
    }

    pub(crate) async fn run(mut self) {
        if let Some((tools, session, owner)) = self.pending.take() {
            finish(tools, session, owner).await;
        }
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        let Some((tools, session, owner)) = self.pending.take() else {
            return;
        };
        warn!(owner = %owner, "Run dropped before teardown");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(finish(tools, session, owner));
            }
            Err(_) => error!(owner = %owner, "No runtime left to shut tools down"),
        }
    }
}

async fn finish(tools: ToolRegistry, session: Arc<Session>, owner: String) {
    tools.shutdown_all().await;
    session.emit(EventKind::Teardown, &owner, json!({}));
}

/// Handle to a background run
pub struct SwarmTask {
    handle: JoinHandle<SwarmResult>,
    cancel: CancellationToken,
}

impl SwarmTask {
    /// Cancel the run and every task it started
    pub fn cancel(&self) {
        info!("Cancelling swarm task");
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the run; `None` when it was cancelled
    pub async fn join(self) -> Option<SwarmResult> {
        match self.handle.await {
            Ok(result) if result.was_cancelled() => None,
            Ok(result) => Some(result),
            Err(e) => {
                error!(error = %e, "Swarm task panicked");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::EventChannel;
    use crate::definition::DelegationTarget;
    use crate::hooks::FnHook;
    use crate::message::{Role, ToolCall};
    use crate::model::ModelResponse;
    use crate::testing::{EchoTool, ScriptedModel};
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn delegate(tool: &str, message: &str) -> ModelResponse {
        ModelResponse::text("").with_tool_call(ToolCall::new(tool, json!({ "message": message })))
    }

    fn kinds(result: &SwarmResult) -> Vec<EventKind> {
        result.events.iter().map(|e| e.kind).collect()
    }

    // === Builder Tests ===

    #[test]
    fn test_add_agent_rejects_duplicate() {
        let mut builder = Swarm::builder();
        assert_ok!(builder.add_agent(AgentDefinition::new("lead", "m")));
        assert_err!(builder.add_agent(AgentDefinition::new("lead", "m")));
    }

    #[test]
    fn test_build_requires_model_and_known_lead() {
        let no_model = Swarm::builder().agent(AgentDefinition::new("a", "m")).build();
        assert!(matches!(no_model.err(), Some(SwarmError::InvalidConfig(_))));

        let bad_lead = Swarm::builder()
            .agent(AgentDefinition::new("a", "m"))
            .lead("ghost")
            .model(Arc::new(ScriptedModel::new()))
            .build();
        assert!(matches!(bad_lead.err(), Some(SwarmError::UnknownAgent(_))));
    }

    // === Execution Tests ===

    #[tokio::test]
    async fn test_execute_simple() {
        let (sink, mut channel) = EventChannel::new();
        let model = Arc::new(
            ScriptedModel::new()
                .respond("lead", ModelResponse::text("answer").with_usage(TokenUsage::new(10, 5))),
        );
        let swarm = Swarm::builder()
            .agent(AgentDefinition::new("lead", "m"))
            .model(model)
            .events(sink)
            .build()
            .unwrap();

        let result = swarm.execute("question").await;
        assert!(result.success);
        assert_eq!(result.content.as_deref(), Some("answer"));
        assert_eq!(result.agent, "lead");
        assert_eq!(result.usage.total_tokens, 15);
        assert_eq!(result.agents, vec!["lead".to_string()]);

        let k = kinds(&result);
        assert_eq!(k.first(), Some(&EventKind::SwarmStart));
        assert!(k.contains(&EventKind::SwarmStop));
        assert_eq!(k.last(), Some(&EventKind::Teardown));
        assert_eq!(channel.drain().len(), result.events.len());
    }

    #[tokio::test]
    async fn test_swarm_start_halt_fails_run() {
        let hooks = Arc::new(HookRegistry::new());
        hooks
            .register_default(
                HookEvent::SwarmStart,
                None,
                0,
                Arc::new(FnHook::new("gate", |_| HookResult::Halt("closed".into()))),
            )
            .unwrap();
        let model = Arc::new(ScriptedModel::new());
        let swarm = Swarm::builder()
            .agent(AgentDefinition::new("lead", "m"))
            .hooks(hooks)
            .model(model.clone())
            .build()
            .unwrap();

        let result = swarm.execute("go").await;
        assert!(!result.success);
        assert!(matches!(result.error, Some(SwarmError::HookHalted { .. })));
        assert_eq!(model.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_reprompt_loops_until_satisfied() {
        let hooks = Arc::new(HookRegistry::new());
        hooks
            .register_default(
                HookEvent::SwarmStop,
                None,
                0,
                Arc::new(FnHook::new("verify", |ctx| {
                    if ctx.meta_str("content") == Some("draft") {
                        HookResult::Reprompt("try again".into())
                    } else {
                        HookResult::Continue
                    }
                })),
            )
            .unwrap();
        let model = Arc::new(
            ScriptedModel::new()
                .respond("lead", ModelResponse::text("draft"))
                .respond("lead", ModelResponse::text("final")),
        );
        let swarm = Swarm::builder()
            .agent(AgentDefinition::new("lead", "m"))
            .hooks(hooks)
            .model(model.clone())
            .build()
            .unwrap();

        let result = swarm.execute("write").await;
        assert_eq!(result.content.as_deref(), Some("final"));
        let second = &model.requests_for("lead")[1];
        assert_eq!(second.last().map(|m| m.content.as_str()), Some("try again"));
    }

    #[tokio::test]
    async fn test_reprompt_is_bounded() {
        let hooks = Arc::new(HookRegistry::new());
        hooks
            .register_default(
                HookEvent::SwarmStop,
                None,
                0,
                Arc::new(FnHook::new("never_happy", |_| HookResult::Reprompt("again".into()))),
            )
            .unwrap();
        let model = Arc::new(ScriptedModel::new());
        let swarm = Swarm::builder()
            .agent(AgentDefinition::new("lead", "m"))
            .hooks(hooks)
            .model(model.clone())
            .config(SwarmConfig {
                max_reprompts: 2,
                ..SwarmConfig::default()
            })
            .build()
            .unwrap();

        let result = swarm.execute("go").await;
        assert!(result.success);
        assert_eq!(model.calls_for("lead"), 3);
    }

    #[tokio::test]
    async fn test_finish_swarm_skips_reprompt() {
        let hooks = Arc::new(HookRegistry::new());
        hooks
            .register_default(
                HookEvent::AgentStop,
                None,
                0,
                Arc::new(FnHook::new("done", |_| HookResult::FinishSwarm("early".into()))),
            )
            .unwrap();
        hooks
            .register_default(
                HookEvent::SwarmStop,
                None,
                0,
                Arc::new(FnHook::new("reprompt", |_| HookResult::Reprompt("again".into()))),
            )
            .unwrap();
        let model = Arc::new(ScriptedModel::new());
        let swarm = Swarm::builder()
            .agent(AgentDefinition::new("lead", "m"))
            .hooks(hooks)
            .model(model.clone())
            .build()
            .unwrap();

        let result = swarm.execute("go").await;
        assert_eq!(result.content.as_deref(), Some("early"));
        assert_eq!(model.calls_for("lead"), 1);
    }

    // === Delegation Tests ===

    #[tokio::test]
    async fn test_isolated_histories_never_mix() {
        let model = Arc::new(
            ScriptedModel::new()
                .respond("a", delegate("delegate_to_worker", "from a"))
                .respond("a", ModelResponse::text("a done"))
                .respond("b", delegate("delegate_to_worker", "from b"))
                .respond("b", ModelResponse::text("b done"))
                .respond("lead", {
                    ModelResponse::text("")
                        .with_tool_call(ToolCall::new("delegate_to_a", json!({"message": "go a"})))
                        .with_tool_call(ToolCall::new("delegate_to_b", json!({"message": "go b"})))
                })
                .respond("lead", ModelResponse::text("all done")),
        );
        let swarm = Swarm::builder()
            .agent(
                AgentDefinition::new("lead", "m")
                    .delegates_to(DelegationTarget::isolated("a"))
                    .delegates_to(DelegationTarget::isolated("b")),
            )
            .agent(AgentDefinition::new("a", "m").delegates_to(DelegationTarget::isolated("worker")))
            .agent(AgentDefinition::new("b", "m").delegates_to(DelegationTarget::isolated("worker")))
            .agent(AgentDefinition::new("worker", "m"))
            .model(model.clone())
            .build()
            .unwrap();

        let result = swarm.execute("start").await;
        assert!(result.success, "{:?}", result.error);

        let via_a = swarm.graph().instance("worker@a@lead").unwrap().history().await;
        let via_b = swarm.graph().instance("worker@b@lead").unwrap().history().await;
        assert!(via_a.iter().all(|m| !m.content.contains("from b")));
        assert!(via_b.iter().all(|m| !m.content.contains("from a")));
        assert_eq!(result.agents, vec!["a", "b", "lead", "worker"]);
    }

    #[tokio::test]
    async fn test_shared_history_visible_to_all_delegators() {
        let model = Arc::new(
            ScriptedModel::new()
                .respond("a", delegate("delegate_to_notes", "note from a"))
                .respond("a", ModelResponse::text("a done"))
                .respond("b", delegate("delegate_to_notes", "note from b"))
                .respond("b", ModelResponse::text("b done"))
                .respond("lead", delegate("delegate_to_a", "go a"))
                .respond("lead", delegate("delegate_to_b", "go b"))
                .respond("lead", ModelResponse::text("done")),
        );
        let swarm = Swarm::builder()
            .agent(
                AgentDefinition::new("lead", "m")
                    .delegates_to(DelegationTarget::isolated("a"))
                    .delegates_to(DelegationTarget::isolated("b")),
            )
            .agent(AgentDefinition::new("a", "m").delegates_to(DelegationTarget::shared("notes")))
            .agent(AgentDefinition::new("b", "m").delegates_to(DelegationTarget::shared("notes")))
            .agent(AgentDefinition::new("notes", "m"))
            .model(model.clone())
            .build()
            .unwrap();

        let result = swarm.execute("start").await;
        assert!(result.success, "{:?}", result.error);

        let history = swarm.graph().instance("notes").unwrap().history().await;
        let prompts: Vec<_> = history
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(prompts, vec!["note from a", "note from b"]);

        // the second call saw the first exchange
        assert_eq!(model.requests_for("notes")[1].len(), 3);
    }

    #[tokio::test]
    async fn test_delegate_failure_is_tool_error() {
        let model = Arc::new(
            ScriptedModel::new()
                .respond("lead", delegate("delegate_to_worker", "do it"))
                .fail("worker", "provider down")
                .respond("lead", ModelResponse::text("handled")),
        );
        let swarm = Swarm::builder()
            .agent(AgentDefinition::new("lead", "m").delegates_to(DelegationTarget::isolated("worker")))
            .agent(AgentDefinition::new("worker", "m"))
            .model(model.clone())
            .build()
            .unwrap();

        let result = swarm.execute("go").await;
        assert!(result.success);
        assert_eq!(result.content.as_deref(), Some("handled"));

        let lead_second = &model.requests_for("lead")[1];
        let tool_message = lead_second.last().unwrap();
        assert!(tool_message.is_error);
        assert!(tool_message.content.contains("provider down"));
    }

    #[tokio::test]
    async fn test_mutual_isolated_setup_ok_but_runtime_loop_fails() {
        let model = Arc::new(
            ScriptedModel::new()
                .respond("a", delegate("delegate_to_b", "over to b"))
                .respond("b@a", delegate("delegate_to_a", "back to a")),
        );
        let swarm = Swarm::builder()
            .agent(AgentDefinition::new("a", "m").delegates_to(DelegationTarget::isolated("b")))
            .agent(AgentDefinition::new("b", "m").delegates_to(DelegationTarget::isolated("a")))
            .model(model.clone())
            .build()
            .unwrap();

        let result = swarm.execute("start").await;
        assert!(!result.success);
        match result.error {
            Some(SwarmError::DynamicDelegationCycle { stack, target }) => {
                assert_eq!(stack, vec!["a", "b@a"]);
                assert_eq!(target, "a@b@a");
            }
            other => panic!("expected dynamic cycle, got {other:?}"),
        }
        assert_eq!(model.calls_for("a@b@a"), 0);
    }

    #[tokio::test]
    async fn test_pre_delegation_halt_blocks_target() {
        let hooks = Arc::new(HookRegistry::new());
        hooks
            .register_default(
                HookEvent::PreDelegation,
                None,
                0,
                Arc::new(FnHook::new("deny", |ctx| {
                    HookResult::Halt(format!("{} is busy", ctx.meta_str("target").unwrap_or("?")))
                })),
            )
            .unwrap();
        let model = Arc::new(
            ScriptedModel::new()
                .respond("lead", delegate("delegate_to_worker", "x"))
                .respond("lead", ModelResponse::text("ok")),
        );
        let swarm = Swarm::builder()
            .agent(AgentDefinition::new("lead", "m").delegates_to(DelegationTarget::isolated("worker")))
            .agent(AgentDefinition::new("worker", "m"))
            .hooks(hooks)
            .model(model.clone())
            .build()
            .unwrap();

        let result = swarm.execute("go").await;
        assert!(result.success);
        assert_eq!(model.calls_for("worker@lead"), 0);
        assert_eq!(
            model.requests_for("lead")[1].last().map(|m| m.content.as_str()),
            Some("worker is busy")
        );
    }

    #[tokio::test]
    async fn test_delegation_hook_matcher_selects_target_tool() {
        let hooks = Arc::new(HookRegistry::new());
        hooks
            .register_default(
                HookEvent::PreDelegation,
                Some("delegate_to_reviewer"),
                0,
                Arc::new(FnHook::new("gate", |_| HookResult::Halt("reviewer offline".into()))),
            )
            .unwrap();
        let model = Arc::new(
            ScriptedModel::new()
                .respond(
                    "lead",
                    ModelResponse::text("")
                        .with_tool_call(ToolCall::new("delegate_to_coder", json!({"message": "code"})))
                        .with_tool_call(ToolCall::new("delegate_to_reviewer", json!({"message": "review"}))),
                )
                .respond("coder@lead", ModelResponse::text("coded"))
                .respond("lead", ModelResponse::text("ok")),
        );
        let swarm = Swarm::builder()
            .agent(
                AgentDefinition::new("lead", "m")
                    .delegates_to(DelegationTarget::isolated("coder"))
                    .delegates_to(DelegationTarget::isolated("reviewer")),
            )
            .agent(AgentDefinition::new("coder", "m"))
            .agent(AgentDefinition::new("reviewer", "m"))
            .hooks(hooks)
            .model(model.clone())
            .build()
            .unwrap();

        let result = swarm.execute("go").await;
        assert!(result.success);
        assert_eq!(model.calls_for("coder@lead"), 1);
        assert_eq!(model.calls_for("reviewer@lead"), 0);
        let contents: Vec<String> = model.requests_for("lead")[1]
            .iter()
            .map(|m| m.content.clone())
            .collect();
        assert!(contents.contains(&"coded".to_string()));
        assert!(contents.contains(&"reviewer offline".to_string()));
    }

    // === Concurrency Tests ===

    #[tokio::test]
    async fn test_global_limit_bounds_in_flight_model_calls() {
        let fan_out = (0..8).fold(ModelResponse::text(""), |r, i| {
            r.with_tool_call(ToolCall::new(format!("delegate_to_w{i}"), json!({"message": "work"})))
        });
        let mut lead = AgentDefinition::new("lead", "m").with_concurrency(8);
        let mut builder = Swarm::builder();
        for i in 0..8 {
            lead = lead.delegates_to(DelegationTarget::isolated(format!("w{i}")));
            builder = builder.agent(AgentDefinition::new(format!("w{i}"), "m"));
        }
        let model = Arc::new(
            ScriptedModel::new()
                .respond("lead", fan_out)
                .respond("lead", ModelResponse::text("merged"))
                .with_delay(Duration::from_millis(20)),
        );
        let swarm = builder
            .agent(lead)
            .lead("lead")
            .model(model.clone())
            .config(SwarmConfig {
                global_concurrency: 3,
                ..SwarmConfig::default()
            })
            .build()
            .unwrap();

        let result = swarm.execute("go").await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(model.total_calls(), 10);
        assert!(model.max_in_flight() <= 3);
        assert!(model.max_in_flight() >= 2);
    }

    // === Cancellation Tests ===

    #[tokio::test]
    async fn test_cancel_propagates_and_tears_down_once() {
        let echo = Arc::new(EchoTool::new("sensor"));
        let model = Arc::new(
            ScriptedModel::new()
                .respond("lead", delegate("delegate_to_worker", "long job"))
                .hang("worker"),
        );
        let swarm = Swarm::builder()
            .agent(
                AgentDefinition::new("lead", "m")
                    .with_tool("sensor")
                    .delegates_to(DelegationTarget::isolated("worker")),
            )
            .agent(AgentDefinition::new("worker", "m"))
            .tools(ToolRegistry::new().with(echo.clone()))
            .model(model.clone())
            .build()
            .unwrap();

        let task = swarm.spawn("go");
        while model.calls_for("worker@lead") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        task.cancel();

        assert!(task.join().await.is_none());
        assert_eq!(echo.shutdowns(), 1);
    }

    #[tokio::test]
    async fn test_teardown_runs_after_failure() {
        let echo = Arc::new(EchoTool::new("sensor"));
        let swarm = Swarm::builder()
            .agent(AgentDefinition::new("lead", "m").with_tool("sensor"))
            .tools(ToolRegistry::new().with(echo.clone()))
            .model(Arc::new(ScriptedModel::new().fail("lead", "boom")))
            .build()
            .unwrap();

        let result = swarm.execute("go").await;
        assert!(!result.success);
        assert!(result.content.is_none());
        assert_eq!(echo.shutdowns(), 1);
    }

    #[tokio::test]
    async fn test_dropped_run_still_tears_down_once() {
        let echo = Arc::new(EchoTool::new("sensor"));
        let swarm = Swarm::builder()
            .agent(AgentDefinition::new("lead", "m").with_tool("sensor"))
            .tools(ToolRegistry::new().with(echo.clone()))
            .model(Arc::new(ScriptedModel::new().hang("lead")))
            .build()
            .unwrap();

        let run = tokio::time::timeout(Duration::from_millis(20), swarm.execute("go")).await;
        assert!(run.is_err());

        for _ in 0..50 {
            if echo.shutdowns() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(echo.shutdowns(), 1);
    }

    #[tokio::test]
    async fn test_spawn_join_returns_result() {
        let swarm = Swarm::builder()
            .agent(AgentDefinition::new("lead", "m"))
            .model(Arc::new(ScriptedModel::new()))
            .build()
            .unwrap();

        let result = swarm.spawn("go").join().await.unwrap();
        assert_eq!(result.content.as_deref(), Some("lead done"));
    }
}
