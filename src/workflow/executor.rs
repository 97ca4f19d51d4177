//! Workflow assembly and execution

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{
    JsonPersistence, Node, NodeContext, NodeResult, NodeStatus, RestoreResult, RestoreStatus,
    StateBlob, StatePersistence, Transform, Transformer, WorkflowState, STATE_VERSION,
};
use crate::agent::until_cancelled;
use crate::channel::{EventKind, EventSink, SwarmEvent};
use crate::config::{SwarmConfig, WorkflowConfig};
use crate::definition::AgentDefinition;
use crate::error::{SwarmError, WorkflowError};
use crate::graph::{validate_definitions, AgentGraph, GraphParts};
use crate::hooks::HookRegistry;
use crate::message::Message;
use crate::model::{ModelClient, TokenUsage};
use crate::session::Session;
use crate::storage::MemoryStore;
use crate::swarm::{Swarm, Teardown};
use crate::tool::ToolRegistry;

/// Outcome of one workflow run
#[derive(Debug, Clone)]
pub struct WorkflowResult {
    pub run_id: Uuid,
    /// Halt content, or the last executed node's content
    pub content: Option<String>,
    /// Last node that recorded a result
    pub node: Option<String>,
    pub results: BTreeMap<String, NodeResult>,
    pub events: Vec<SwarmEvent>,
    pub duration: Duration,
    pub success: bool,
    pub error: Option<WorkflowError>,
    /// Stopped by `halt_workflow`
    pub halted: bool,
    /// Node executions, revisits included
    pub visits: usize,
    pub usage: TokenUsage,
    pub cost: f64,
    pub agents: Vec<String>,
}

impl WorkflowResult {
    pub fn was_cancelled(&self) -> bool {
        matches!(self.error, Some(WorkflowError::Swarm(SwarmError::Cancelled)))
    }
}

/// Builder for [`Workflow`]
pub struct WorkflowBuilder {
    name: String,
    definitions: Vec<AgentDefinition>,
    nodes: Vec<Node>,
    start_node: Option<String>,
    hooks: Arc<HookRegistry>,
    tools: ToolRegistry,
    model: Option<Arc<dyn ModelClient>>,
    config: SwarmConfig,
    limits: WorkflowConfig,
    sink: Option<EventSink>,
    persistence: Arc<dyn StatePersistence>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            definitions: Vec::new(),
            nodes: Vec::new(),
            start_node: None,
            hooks: Arc::new(HookRegistry::new()),
            tools: ToolRegistry::new(),
            model: None,
            config: SwarmConfig::default(),
            limits: WorkflowConfig::default(),
            sink: None,
            persistence: Arc::new(JsonPersistence),
        }
    }

    pub fn agent(mut self, definition: AgentDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Root visited first; defaults to the first node without dependencies.
    /// Every other root still runs.
    pub fn start_node(mut self, name: impl Into<String>) -> Self {
        self.start_node = Some(name.into());
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

    pub fn workflow_config(mut self, limits: WorkflowConfig) -> Self {
        self.limits = limits;
        self
    }

    pub fn events(mut self, sink: EventSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn StatePersistence>) -> Self {
        self.persistence = persistence;
        self
    }

    /// Validate agents and the node graph; every setup error surfaces here
    pub fn build(self) -> Result<Workflow, WorkflowError> {
        let model = self
            .model
            .ok_or_else(|| SwarmError::InvalidConfig("no model client configured".into()))?;
        self.config.validate()?;
        if self.limits.max_node_visits == 0 {
            return Err(SwarmError::InvalidConfig("max_node_visits must be at least 1".into()).into());
        }
        validate_definitions(&self.definitions, &self.tools, &self.hooks)?;

        let mut index = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if index.insert(node.name.clone(), i).is_some() {
                return Err(WorkflowError::DuplicateNode(node.name.clone()));
            }
        }

        for node in &self.nodes {
            if let Some(dep) = node.depends_on.iter().find(|d| !index.contains_key(*d)) {
                return Err(WorkflowError::UnknownNode(dep.clone()));
            }
            if let Some(agent) = node
                .agents
                .iter()
                .find(|a| !self.definitions.iter().any(|d| d.name == a.name))
            {
                return Err(SwarmError::UnknownAgent(agent.name.clone()).into());
            }
            if let Some(lead) = node.lead.as_ref().filter(|l| !node.agents.iter().any(|a| &a.name == *l)) {
                return Err(SwarmError::UnknownAgent(lead.clone()).into());
            }
            if node.agents.iter().any(|a| a.delegates_to.is_some()) {
                validate_definitions(&node_definitions(&self.definitions, node), &self.tools, &self.hooks)?;
            }
        }

        check_acyclic(&self.nodes)?;

        let start = match self.start_node {
            Some(start) => match index.get(&start).map(|i| &self.nodes[*i]) {
                None => return Err(WorkflowError::MissingStartNode(start)),
                Some(node) if !node.depends_on.is_empty() => {
                    return Err(WorkflowError::StartNodeHasDependencies(start))
                }
                Some(_) => start,
            },
            None => self
                .nodes
                .iter()
                .find(|n| n.depends_on.is_empty())
                .map(|n| n.name.clone())
                .ok_or_else(|| WorkflowError::MissingStartNode("(none)".into()))?,
        };

        info!(workflow = %self.name, nodes = self.nodes.len(), start = %start, "Built workflow");

        Ok(Workflow {
            inner: Arc::new(Inner {
                name: self.name,
                definitions: self.definitions,
                nodes: self.nodes,
                index,
                start,
                hooks: self.hooks,
                tools: self.tools,
                model,
                config: self.config,
                limits: self.limits,
                sink: self.sink,
                persistence: self.persistence,
                memories: MemoryStore::new(),
                state: Mutex::new(WorkflowState {
                    version: STATE_VERSION,
                    ..Default::default()
                }),
            }),
        })
    }
}

/// Kahn's algorithm over static dependency edges
fn check_acyclic(nodes: &[Node]) -> Result<(), WorkflowError> {
    let mut indegree: HashMap<&str, usize> = nodes
        .iter()
        .map(|n| {
            let unique: BTreeSet<&str> = n.depends_on.iter().map(String::as_str).collect();
            (n.name.as_str(), unique.len())
        })
        .collect();
    let mut ready: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();

    let mut visited = 0;
    while let Some(name) = ready.pop_front() {
        visited += 1;
        for node in nodes.iter().filter(|n| n.depends_on.iter().any(|d| d == name)) {
            if let Some(d) = indegree.get_mut(node.name.as_str()) {
                *d -= 1;
                if *d == 0 {
                    ready.push_back(node.name.as_str());
                }
            }
        }
    }

    if visited == nodes.len() {
        return Ok(());
    }
    let mut stuck: Vec<String> = indegree
        .into_iter()
        .filter(|(_, d)| *d > 0)
        .map(|(n, _)| n.to_string())
        .collect();
    stuck.sort();
    Err(WorkflowError::DependencyCycle(stuck))
}

/// Definitions as seen by one node: per-node delegation lists applied
fn node_definitions(definitions: &[AgentDefinition], node: &Node) -> Vec<AgentDefinition> {
    definitions
        .iter()
        .cloned()
        .map(|mut def| {
            if let Some(targets) = node
                .agents
                .iter()
                .find(|a| a.name == def.name)
                .and_then(|a| a.delegates_to.clone())
            {
                def.delegates_to = targets;
            }
            def
        })
        .collect()
}

/// Dependency results folded into a node's input and error
fn gather_input(prompt: &str, deps: &BTreeMap<String, NodeResult>) -> (Option<String>, Option<String>) {
    if deps.is_empty() {
        return (Some(prompt.to_string()), None);
    }
    if deps.len() == 1 {
        return deps
            .values()
            .next()
            .map(|r| (r.content.clone(), r.error.clone()))
            .unwrap_or_default();
    }

    let content = deps
        .iter()
        .filter_map(|(name, r)| r.content.as_ref().map(|c| format!("## {name}\n\n{c}")))
        .collect::<Vec<_>>()
        .join("\n\n");
    let errors: Vec<String> = deps
        .iter()
        .filter_map(|(name, r)| r.error.as_ref().map(|e| format!("{name}: {e}")))
        .collect();
    (Some(content), (!errors.is_empty()).then(|| errors.join("; ")))
}

enum Step {
    Next,
    Halt(String),
    Goto { node: String, content: String },
}

#[derive(Default)]
struct RunState {
    status: HashMap<String, NodeStatus>,
    results: BTreeMap<String, NodeResult>,
    visits: usize,
    node_visits: HashMap<String, usize>,
    last: Option<String>,
    halted: Option<String>,
    /// Nodes that redirected away; their dependents wait until a reset
    parked: BTreeSet<String>,
}

impl RunState {
    fn status_of(&self, node: &str) -> NodeStatus {
        self.status.get(node).copied().unwrap_or(NodeStatus::Pending)
    }

    fn settled(&self, node: &str) -> bool {
        self.status_of(node).is_terminal() && !self.parked.contains(node)
    }
}

struct Inner {
    name: String,
    definitions: Vec<AgentDefinition>,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    start: String,
    hooks: Arc<HookRegistry>,
    tools: ToolRegistry,
    model: Arc<dyn ModelClient>,
    config: SwarmConfig,
    limits: WorkflowConfig,
    sink: Option<EventSink>,
    persistence: Arc<dyn StatePersistence>,
    memories: MemoryStore,
    /// Preserved histories and the latest results
    state: Mutex<WorkflowState>,
}

/// A validated DAG of nodes over a set of agents
#[derive(Clone)]
pub struct Workflow {
    inner: Arc<Inner>,
}

impl Workflow {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn start_node(&self) -> &str {
        &self.inner.start
    }

    pub fn node_names(&self) -> Vec<&str> {
        self.inner.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    /// Preserved history of `agent`, if any
    pub fn preserved_history(&self, agent: &str) -> Option<Vec<Message>> {
        self.inner.state.lock().agents.get(agent).cloned()
    }

    /// Results recorded by the most recent run
    pub fn last_results(&self) -> BTreeMap<String, NodeResult> {
        self.inner.state.lock().results.clone()
    }

    /// Run to completion
    pub async fn execute(&self, prompt: &str) -> WorkflowResult {
        let session = Arc::new(Session::new(self.inner.sink.clone()));
        self.execute_in(prompt, session).await
    }

    /// Start a run in the background
    pub fn spawn(&self, prompt: impl Into<String>) -> WorkflowTask {
        let cancel = CancellationToken::new();
        let session = Arc::new(Session::with_cancel(cancel.clone(), self.inner.sink.clone()));
        let workflow = self.clone();
        let prompt = prompt.into();
        let handle = tokio::spawn(async move { workflow.execute_in(&prompt, session).await });
        WorkflowTask { handle, cancel }
    }

    /// Encode preserved histories and the latest results
    pub fn snapshot(&self) -> Result<StateBlob, WorkflowError> {
        let mut state = self.inner.state.lock().clone();
        state.version = STATE_VERSION;
        self.inner.persistence.encode(&state)
    }

    /// Restore from a snapshot, keeping whatever matches this workflow.
    ///
    /// Only an undecodable blob is an error; agents or nodes this workflow
    /// does not know are reported as skipped.
    pub fn restore(&self, blob: &StateBlob) -> Result<RestoreResult, WorkflowError> {
        let snapshot = self.inner.persistence.decode(blob)?;
        let mut report = RestoreResult::default();
        let mut state = WorkflowState {
            version: STATE_VERSION,
            ..Default::default()
        };

        for (agent, history) in snapshot.agents {
            if self.inner.definitions.iter().any(|d| d.name == agent) {
                state.agents.insert(agent.clone(), history);
                report.agents.insert(agent, RestoreStatus::Restored);
            } else {
                warn!(agent = %agent, "Skipping restore of unknown agent");
                report.agents.insert(
                    agent.clone(),
                    RestoreStatus::Skipped {
                        reason: format!("agent '{agent}' is not defined in this workflow"),
                    },
                );
            }
        }

        for (node, result) in snapshot.results {
            if self.inner.index.contains_key(&node) {
                state.results.insert(node, result);
                report.nodes_restored += 1;
            } else {
                warn!(node = %node, "Skipping restore of unknown node");
                report.nodes_skipped += 1;
            }
        }

        *self.inner.state.lock() = state;
        info!(
            restored = report.restored().len(),
            skipped = report.skipped().len(),
            "Restored workflow state"
        );
        Ok(report)
    }

    #[instrument(skip(self, prompt, session), fields(workflow = %self.inner.name, run_id = %session.id))]
    async fn execute_in(&self, prompt: &str, session: Arc<Session>) -> WorkflowResult {
        let started = Instant::now();
        let name = self.inner.name.as_str();
        info!("Starting workflow run");
        session.emit(
            EventKind::WorkflowStart,
            name,
            json!({ "prompt": prompt, "start": self.inner.start }),
        );

        let teardown = Teardown::new(self.inner.tools.clone(), Arc::clone(&session), name);
        let mut run = RunState::default();
        let cancel = session.cancel_token().clone();
        let outcome = until_cancelled(&cancel, self.walk(prompt, &session, &mut run)).await;
        let outcome = outcome.map_err(WorkflowError::from).and_then(|r| r);

        // finalizer: runs on success, failure and cancellation alike
        teardown.run().await;

        match &outcome {
            Err(WorkflowError::Swarm(SwarmError::Cancelled)) => {
                info!("Workflow run cancelled");
                session.emit(EventKind::Cancelled, name, json!({}));
            }
            Err(e) => error!(error = %e, "Workflow run failed"),
            Ok(()) => {}
        }

        self.inner.state.lock().results = run.results.clone();

        let last = run.last.as_ref().and_then(|n| run.results.get(n));
        let content = match &outcome {
            Ok(()) => run
                .halted
                .clone()
                .or_else(|| last.and_then(|r| r.content.clone())),
            Err(_) => None,
        };
        let last_failed = run.halted.is_none() && last.is_some_and(NodeResult::is_error);
        let error = outcome.err();
        let success = error.is_none() && !last_failed;

        session.emit(
            EventKind::WorkflowStop,
            name,
            json!({ "success": success, "visits": run.visits }),
        );
        let totals = session.totals();
        let duration = started.elapsed();
        info!(success, visits = run.visits, ?duration, "Workflow run finished");

        WorkflowResult {
            run_id: session.id,
            content,
            node: run.last.clone(),
            results: run.results,
            events: session.events(),
            duration,
            success,
            error,
            halted: run.halted.is_some(),
            visits: run.visits,
            usage: totals.usage,
            cost: totals.cost,
            agents: session.participants(),
        }
    }

    async fn walk(&self, prompt: &str, session: &Arc<Session>, run: &mut RunState) -> Result<(), WorkflowError> {
        let limit = self.inner.limits.max_node_visits;
        let mut queue: VecDeque<(String, Option<String>)> = VecDeque::new();
        run.status.insert(self.inner.start.clone(), NodeStatus::Ready);
        queue.push_back((self.inner.start.clone(), None));
        self.schedule(run, &mut queue);

        while let Some((name, injected)) = queue.pop_front() {
            if run.visits >= limit {
                warn!(limit, "Node visit limit reached");
                return Err(WorkflowError::VisitLimitExceeded { limit });
            }
            run.visits += 1;

            let node = self.node(&name)?;
            match self.visit(node, injected, prompt, session, run).await? {
                Step::Next => self.schedule(run, &mut queue),
                Step::Halt(content) => {
                    info!(node = %name, "Workflow halted");
                    run.halted = Some(content);
                    return Ok(());
                }
                Step::Goto { node: target, content } => {
                    self.node(&target)?;
                    info!(from = %name, to = %target, "Redirecting workflow");
                    run.parked.insert(name);
                    let reset = self.reset_downstream(&target, run);
                    queue.retain(|(queued, _)| !reset.contains(queued));
                    run.status.insert(target.clone(), NodeStatus::Ready);
                    queue.push_back((target, Some(content)));
                    self.schedule(run, &mut queue);
                }
            }
        }
        Ok(())
    }

    /// Queue every pending node whose dependencies have all settled,
    /// in declaration order
    fn schedule(&self, run: &mut RunState, queue: &mut VecDeque<(String, Option<String>)>) {
        for node in &self.inner.nodes {
            let ready = run.status_of(&node.name) == NodeStatus::Pending
                && !run.parked.contains(&node.name)
                && node.depends_on.iter().all(|d| run.settled(d));
            if ready {
                debug!(node = %node.name, "Node ready");
                run.status.insert(node.name.clone(), NodeStatus::Ready);
                queue.push_back((node.name.clone(), None));
            }
        }
    }

    /// Mark `target` and everything depending on it as pending again.
    /// Nodes outside that set keep their state and queue position.
    fn reset_downstream(&self, target: &str, run: &mut RunState) -> BTreeSet<String> {
        let mut stack = vec![target.to_string()];
        let mut seen = BTreeSet::new();
        while let Some(name) = stack.pop() {
            if !seen.insert(name.clone()) {
                continue;
            }
            run.status.insert(name.clone(), NodeStatus::Pending);
            run.parked.remove(&name);
            stack.extend(
                self.inner
                    .nodes
                    .iter()
                    .filter(|n| n.depends_on.contains(&name))
                    .map(|n| n.name.clone()),
            );
        }
        seen
    }

    async fn visit(
        &self,
        node: &Node,
        injected: Option<String>,
        prompt: &str,
        session: &Arc<Session>,
        run: &mut RunState,
    ) -> Result<Step, WorkflowError> {
        let name = node.name.as_str();
        let visit = {
            let count = run.node_visits.entry(name.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        if injected.is_none() {
            if let Some(dep) = node.depends_on.iter().find(|d| !run.settled(d)) {
                return Err(WorkflowError::DependencyNotReady {
                    node: name.to_string(),
                    dependency: dep.clone(),
                });
            }
        }

        run.status.insert(name.to_string(), NodeStatus::Running);
        info!(node = %name, visit, "Node started");
        session.emit(EventKind::NodeStart, name, json!({ "visit": visit }));

        let dependencies: BTreeMap<String, NodeResult> = node
            .depends_on
            .iter()
            .filter_map(|d| run.results.get(d).map(|r| (d.clone(), r.clone())))
            .collect();
        let (mut input, mut input_error) = match injected {
            Some(content) => (Some(content), None),
            None => gather_input(prompt, &dependencies),
        };

        let mut skipped = None;
        if let Some(transformer) = &node.input {
            let ctx = NodeContext::new(
                name,
                prompt,
                input.clone(),
                input_error.clone(),
                dependencies.clone(),
                run.results.clone(),
            );
            match self.apply(name, transformer.as_ref(), &ctx).await? {
                Transform::Content(content) => {
                    input = Some(content);
                    input_error = None;
                }
                Transform::Skip(content) => skipped = Some(content),
                Transform::Halt(content) => {
                    run.status.insert(name.to_string(), NodeStatus::Skipped);
                    self.emit_stop(session, name, visit, "halted", None);
                    return Ok(Step::Halt(content));
                }
                Transform::Goto { node: target, content } => {
                    // stays pending; the walk parks it
                    run.status.insert(name.to_string(), NodeStatus::Pending);
                    self.emit_stop(session, name, visit, "goto", None);
                    return Ok(Step::Goto { node: target, content });
                }
            }
        }

        let mut result = match (skipped, input) {
            (Some(content), _) => {
                debug!(node = %name, "Skipping agent execution");
                NodeResult::skipped(name, content)
            }
            (None, None) => NodeResult::failed(
                name,
                format!(
                    "dependency failed: {}",
                    input_error.as_deref().unwrap_or("no content")
                ),
            ),
            (None, Some(input)) if node.is_agentless() => NodeResult::completed(name, input),
            (None, Some(input)) => match self.run_agents(node, &input, session).await {
                Ok(content) => NodeResult::completed(name, content),
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!(node = %name, error = %e, "Node agent failed");
                    NodeResult::failed(name, e.to_string())
                }
            },
        };

        if let Some(transformer) = &node.output {
            let ctx = NodeContext::new(
                name,
                prompt,
                result.content.clone(),
                result.error.clone(),
                dependencies,
                run.results.clone(),
            );
            match self.apply(name, transformer.as_ref(), &ctx).await? {
                Transform::Content(content) => {
                    if result.status == NodeStatus::Failed {
                        result = NodeResult::completed(name, content);
                    } else {
                        result.content = Some(content);
                    }
                }
                Transform::Skip(content) => result = NodeResult::skipped(name, content),
                Transform::Halt(content) => {
                    self.record(session, visit, result, "halted", run);
                    return Ok(Step::Halt(content));
                }
                Transform::Goto { node: target, content } => {
                    self.record(session, visit, result, "goto", run);
                    return Ok(Step::Goto { node: target, content });
                }
            }
        }

        let outcome = match result.status {
            NodeStatus::Skipped => "skipped",
            NodeStatus::Failed => "failed",
            _ => "completed",
        };
        self.record(session, visit, result, outcome, run);
        Ok(Step::Next)
    }

    /// Nested swarm run for a node's agents under a child session
    async fn run_agents(&self, node: &Node, input: &str, session: &Arc<Session>) -> Result<String, SwarmError> {
        let lead = node
            .lead_agent()
            .ok_or_else(|| SwarmError::InvalidConfig(format!("node '{}' has no agents", node.name)))?;
        let graph = AgentGraph::build(GraphParts {
            definitions: node_definitions(&self.inner.definitions, node),
            hooks: Arc::clone(&self.inner.hooks),
            tools: self.inner.tools.clone(),
            model: Arc::clone(&self.inner.model),
            config: self.inner.config.clone(),
            memories: self.inner.memories.clone(),
        })?;

        let preserved: Vec<&str> = node
            .agents
            .iter()
            .filter(|a| !a.reset_context)
            .map(|a| a.name.as_str())
            .collect();
        for agent in &preserved {
            let history = self.inner.state.lock().agents.get(*agent).cloned();
            if let Some(history) = history {
                debug!(agent = %agent, messages = history.len(), "Re-seeding preserved context");
                graph.get_or_create(agent).await?.replace_history(history).await;
            }
        }

        let child = Arc::new(session.child());
        let swarm = Swarm::from_graph(Arc::clone(&graph), lead.to_string(), None);
        let outcome = swarm.run_in(input, &child).await;

        for agent in &preserved {
            if let Some(instance) = graph.instance(agent) {
                let history = instance.history().await;
                self.inner.state.lock().agents.insert(agent.to_string(), history);
            }
        }
        session.absorb(&child);
        outcome
    }

    async fn apply(
        &self,
        node: &str,
        transformer: &dyn Transformer,
        ctx: &NodeContext,
    ) -> Result<Transform, WorkflowError> {
        match transformer.transform(ctx).await {
            Ok(transform) => {
                debug!(node = %node, signal = transform.signal(), "Transformer returned");
                Ok(transform)
            }
            Err(e) => match e.downcast::<WorkflowError>() {
                Ok(err) => Err(err),
                Err(e) => Err(WorkflowError::Transformer {
                    node: node.to_string(),
                    message: format!("{e:#}"),
                }),
            },
        }
    }

    fn record(&self, session: &Session, visit: usize, result: NodeResult, outcome: &str, run: &mut RunState) {
        let name = result.node.clone();
        info!(node = %name, outcome, "Node finished");
        self.emit_stop(session, &name, visit, outcome, result.error.as_deref());
        run.status.insert(name.clone(), result.status);
        run.last = Some(name.clone());
        run.results.insert(name, result);
    }

    fn emit_stop(&self, session: &Session, node: &str, visit: usize, outcome: &str, error: Option<&str>) {
        session.emit(
            EventKind::NodeStop,
            node,
            json!({ "visit": visit, "outcome": outcome, "error": error }),
        );
    }

    fn node(&self, name: &str) -> Result<&Node, WorkflowError> {
        self.inner
            .index
            .get(name)
            .map(|i| &self.inner.nodes[*i])
            .ok_or_else(|| WorkflowError::UnknownNode(name.to_string()))
    }
}

/// Handle to a background workflow run
pub struct WorkflowTask {
    handle: JoinHandle<WorkflowResult>,
    cancel: CancellationToken,
}

impl WorkflowTask {
    /// Cancel the run, including in-flight node executions
    pub fn cancel(&self) {
        info!("Cancelling workflow task");
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the run; `None` when it was cancelled
    pub async fn join(self) -> Option<WorkflowResult> {
        match self.handle.await {
            Ok(result) if result.was_cancelled() => None,
            Ok(result) => Some(result),
            Err(e) => {
                error!(error = %e, "Workflow task panicked");
                None
            }
        }
    }
}
