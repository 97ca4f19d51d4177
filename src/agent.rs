//! Agent instance - a live conversation bound to one definition

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::channel::EventKind;
use crate::config::SwarmConfig;
use crate::context::{compress_history, ContextState, TODO_TOOL};
use crate::definition::{split_instance_name, AgentDefinition};
use crate::error::SwarmError;
use crate::hierarchy::CallStack;
use crate::hooks::{HookContext, HookEvent, HookPipeline, HookResult};
use crate::message::{Message, ToolCall};
use crate::model::{ModelClient, ModelRequest, RetryReporter};
use crate::session::Session;
use crate::storage::AgentMemory;
use crate::tool::{Tool, ToolContext, ToolOutput};

/// Collaborators shared by every instance of one graph
#[derive(Clone)]
pub(crate) struct RunResources {
    pub model: Arc<dyn ModelClient>,
    pub config: Arc<SwarmConfig>,
    /// Bounds in-flight model calls across the whole run
    pub global: Arc<Semaphore>,
}

/// Await `fut` unless the run is cancelled first
pub(crate) async fn until_cancelled<F: Future>(
    token: &CancellationToken,
    fut: F,
) -> Result<F::Output, SwarmError> {
    tokio::select! {
        _ = token.cancelled() => Err(SwarmError::Cancelled),
        out = fut => Ok(out),
    }
}

/// A live agent: history, wired tools and hooks
pub struct AgentInstance {
    /// Instance name (`base@delegator` for isolated delegations)
    name: String,
    base: String,
    definition: Arc<AgentDefinition>,
    resources: RunResources,
    tools: BTreeMap<String, Arc<dyn Tool>>,
    hooks: HookPipeline,
    /// Bounds concurrent tool executions started by this instance
    local: Arc<Semaphore>,
    /// Held for a whole ask so history is never interleaved
    history: AsyncMutex<Vec<Message>>,
    context: Mutex<ContextState>,
    memory: Arc<AgentMemory>,
}

impl AgentInstance {
    pub(crate) fn new(
        name: impl Into<String>,
        definition: Arc<AgentDefinition>,
        resources: RunResources,
        tools: BTreeMap<String, Arc<dyn Tool>>,
        hooks: HookPipeline,
        memory: Arc<AgentMemory>,
    ) -> Self {
        let name = name.into();
        let base = split_instance_name(&name).0.to_string();
        let local = definition
            .concurrency
            .unwrap_or(resources.config.local_concurrency)
            .max(1);

        info!(
            agent = %name,
            model = %definition.model,
            tools = tools.len(),
            "Creating agent instance"
        );

        Self {
            name,
            base,
            definition,
            resources,
            tools,
            hooks,
            local: Arc::new(Semaphore::new(local)),
            history: AsyncMutex::new(Vec::new()),
            context: Mutex::new(ContextState::new()),
            memory,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Primary agent name
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn definition(&self) -> &AgentDefinition {
        &self.definition
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn memory(&self) -> &Arc<AgentMemory> {
        &self.memory
    }

    pub fn context_state(&self) -> ContextState {
        self.context.lock().clone()
    }

    /// Copy of the history; waits for an in-progress ask to finish
    pub async fn history(&self) -> Vec<Message> {
        self.history.lock().await.clone()
    }

    /// Overwrite the history, e.g. when restoring preserved context
    pub async fn replace_history(&self, messages: Vec<Message>) {
        *self.history.lock().await = messages;
    }

    /// Run one prompt to completion: model turns, tool calls, hooks.
    ///
    /// Returns the final content. A `finish_swarm` decision anywhere in the
    /// call tree is recorded on the session and ends this ask immediately.
    #[instrument(skip(self, prompt, session, stack), fields(agent = %self.name))]
    pub async fn ask(
        &self,
        prompt: &str,
        session: &Arc<Session>,
        stack: &CallStack,
    ) -> Result<String, SwarmError> {
        session.mark_participant(&self.base);
        let cancel = session.cancel_token().clone();
        let mut history = until_cancelled(&cancel, self.history.lock()).await?;

        let event = if history.is_empty() {
            HookEvent::FirstMessage
        } else {
            HookEvent::UserPrompt
        };
        let mut prompt = prompt.to_string();
        match self
            .fire(session, HookContext::new(event, &self.name).with_metadata("prompt", prompt.as_str()))
            .await?
        {
            HookResult::Halt(message) => return Err(SwarmError::HookHalted { event, message }),
            HookResult::Replace(content) => prompt = content,
            HookResult::FinishAgent(content) => return Ok(content),
            HookResult::FinishSwarm(content) => {
                session.request_finish(content.as_str());
                return Ok(content);
            }
            _ => {}
        }

        session.emit(EventKind::UserPrompt, &self.name, json!({ "prompt": prompt }));
        history.push(Message::user(prompt));

        let tool_ctx = self.tool_context(session, stack);
        let max_turns = self.resources.config.max_turns;

        for turn in 1..=max_turns {
            if let Some(content) = session.finish_requested() {
                return Ok(content);
            }

            let request = ModelRequest {
                agent: self.name.clone(),
                model: self.definition.model.clone(),
                provider: self.definition.provider.clone(),
                system_prompt: self.definition.system_prompt.clone(),
                messages: history.clone(),
                tools: self.tools.values().map(|t| t.spec()).collect(),
                retries: RetryReporter::new(Arc::clone(session), self.name.as_str()),
                cancel: cancel.clone(),
            };

            let response = {
                let _permit = until_cancelled(&cancel, self.resources.global.acquire())
                    .await?
                    .map_err(|_| SwarmError::Cancelled)?;
                until_cancelled(&cancel, self.resources.model.complete(request)).await?
            };
            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    if let Some(err) = SwarmError::from_anyhow(&e).filter(|err| err.is_fatal()) {
                        return Err(err.clone());
                    }
                    warn!(agent = %self.name, error = %e, "Model call failed");
                    return Err(SwarmError::Model {
                        agent: self.name.clone(),
                        message: e.to_string(),
                    });
                }
            };

            session.record_usage(&response.usage, response.cost);
            history.push(Message::assistant(
                response.content.as_str(),
                response.tool_calls.clone(),
            ));
            self.track_context(session, &mut history, response.usage.input_tokens)
                .await?;

            debug!(
                agent = %self.name,
                turn,
                tool_calls = response.tool_calls.len(),
                "Agent step"
            );
            session.emit(
                EventKind::AgentStep,
                &self.name,
                json!({ "turn": turn, "tool_calls": response.tool_calls.len() }),
            );
            let step = HookContext::new(HookEvent::AgentStep, &self.name)
                .with_metadata("content", response.content.as_str())
                .with_metadata("tool_calls", response.tool_calls.len())
                .with_metadata("turn", turn);
            match self.fire(session, step).await? {
                HookResult::Halt(message) => {
                    return Err(SwarmError::HookHalted {
                        event: HookEvent::AgentStep,
                        message,
                    })
                }
                HookResult::FinishAgent(content) => return Ok(content),
                HookResult::FinishSwarm(content) => {
                    session.request_finish(content.as_str());
                    return Ok(content);
                }
                _ => {}
            }

            if response.tool_calls.is_empty() {
                return self.finish(session, response.content).await;
            }

            let outputs = join_all(
                response
                    .tool_calls
                    .iter()
                    .map(|call| self.run_tool(call, &tool_ctx)),
            )
            .await;

            // appended in call order regardless of completion order; every
            // call gets a result even when one of them aborts the ask
            let mut fatal = None;
            for (call, output) in response.tool_calls.iter().zip(outputs) {
                let output = match output {
                    Ok(output) => output,
                    Err(e) => {
                        let output = ToolOutput::error(e.to_string());
                        fatal.get_or_insert(e);
                        output
                    }
                };
                history.push(Message::tool_result(
                    call.id.as_str(),
                    output.content,
                    !output.success,
                ));
                if call.name == TODO_TOOL {
                    self.context.lock().mark_todo_update(history.len() - 1);
                }
            }
            if let Some(err) = fatal {
                warn!(agent = %self.name, error = %err, "Tool call aborted the ask");
                return Err(err);
            }
        }

        warn!(agent = %self.name, max_turns, "Turn limit reached");
        Err(SwarmError::TurnLimitExceeded {
            agent: self.name.clone(),
            limit: max_turns,
        })
    }

    /// Fire breakpoint-enter then breakpoint-exit for an attached debugger
    pub async fn breakpoint(&self, label: &str, session: &Arc<Session>) -> Result<(), SwarmError> {
        session.emit(EventKind::BreakpointEnter, &self.name, json!({ "label": label }));
        let enter = HookContext::new(HookEvent::BreakpointEnter, &self.name).with_metadata("label", label);
        let decision = self.fire(session, enter).await?;

        let exit = HookContext::new(HookEvent::BreakpointExit, &self.name).with_metadata("label", label);
        self.fire(session, exit).await?;
        session.emit(EventKind::BreakpointExit, &self.name, json!({ "label": label }));

        match decision {
            HookResult::Halt(message) => Err(SwarmError::HookHalted {
                event: HookEvent::BreakpointEnter,
                message,
            }),
            HookResult::FinishSwarm(content) => {
                session.request_finish(content);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn hooks(&self) -> &HookPipeline {
        &self.hooks
    }

    /// Fire through this instance's pipeline, abandoning on cancellation
    pub(crate) async fn fire(
        &self,
        session: &Session,
        context: HookContext,
    ) -> Result<HookResult, SwarmError> {
        let event = context.event;
        let result = until_cancelled(session.cancel_token(), self.hooks.fire(&context)).await?;
        if !result.is_continue() {
            session.emit(
                EventKind::HookDecision,
                &self.name,
                json!({ "event": event.as_str(), "decision": result.decision(), "message": result.message() }),
            );
        }
        Ok(result)
    }

    async fn finish(&self, session: &Session, content: String) -> Result<String, SwarmError> {
        let stop = HookContext::new(HookEvent::AgentStop, &self.name).with_metadata("content", content.as_str());
        let content = match self.fire(session, stop).await? {
            HookResult::Halt(message) => {
                return Err(SwarmError::HookHalted {
                    event: HookEvent::AgentStop,
                    message,
                })
            }
            HookResult::Replace(content) | HookResult::FinishAgent(content) => content,
            HookResult::FinishSwarm(content) => {
                session.request_finish(content.as_str());
                content
            }
            _ => content,
        };

        session.emit(EventKind::AgentStop, &self.name, json!({ "content": content }));
        debug!(agent = %self.name, "Agent finished");
        Ok(content)
    }

    /// Run one tool call. Only fatal errors come back as `Err`; everything
    /// else is folded into a failed output for the model to see.
    async fn run_tool(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolOutput, SwarmError> {
        let session = &ctx.session;
        let _permit = until_cancelled(session.cancel_token(), self.local.acquire())
            .await?
            .map_err(|_| SwarmError::Cancelled)?;

        session.emit(
            EventKind::ToolCall,
            &self.name,
            json!({ "tool": call.name, "id": call.id, "arguments": call.arguments }),
        );

        let pre = HookContext::new(HookEvent::PreToolUse, &self.name).with_tool_call(call.clone());
        let output = match self.fire(session, pre).await? {
            HookResult::Halt(message) => ToolOutput::error(message),
            HookResult::Replace(content) => ToolOutput::success(content),
            HookResult::FinishSwarm(content) => {
                session.request_finish(content.as_str());
                ToolOutput::success(content)
            }
            _ => self.execute_tool(call, ctx).await?,
        };

        let post = HookContext::new(HookEvent::PostToolUse, &self.name)
            .with_tool_call(call.clone())
            .with_tool_result(output.clone());
        let output = match self.fire(session, post).await? {
            HookResult::Halt(message) => ToolOutput::error(message),
            HookResult::Replace(content) => ToolOutput {
                content,
                success: output.success,
            },
            HookResult::FinishSwarm(content) => {
                session.request_finish(content);
                output
            }
            _ => output,
        };

        session.emit(
            EventKind::ToolResult,
            &self.name,
            json!({ "tool": call.name, "id": call.id, "success": output.success }),
        );
        Ok(output)
    }

    async fn execute_tool(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolOutput, SwarmError> {
        let Some(tool) = self.tools.get(&call.name) else {
            warn!(agent = %self.name, tool = %call.name, "Model called an unknown tool");
            return Ok(ToolOutput::error(format!("Unknown tool: {}", call.name)));
        };

        match until_cancelled(ctx.cancel_token(), tool.execute(call.arguments.clone(), ctx)).await? {
            Ok(output) => Ok(output),
            Err(e) => {
                if let Some(err) = SwarmError::from_anyhow(&e).filter(|err| err.is_fatal()) {
                    return Err(err.clone());
                }
                warn!(agent = %self.name, tool = %call.name, error = %e, "Tool failed");
                Ok(ToolOutput::error(
                    SwarmError::Tool {
                        tool: call.name.clone(),
                        message: format!("{e:#}"),
                    }
                    .to_string(),
                ))
            }
        }
    }

    async fn track_context(
        &self,
        session: &Session,
        history: &mut [Message],
        input_tokens: u64,
    ) -> Result<(), SwarmError> {
        let config = &self.resources.config;
        let window = self
            .definition
            .context_window
            .unwrap_or(config.default_context_window);
        let percent = ContextState::usage_percent(input_tokens, window);
        let actions = self.context.lock().observe(
            percent,
            &config.context_warning_thresholds,
            config.compression_threshold,
        );

        for threshold in actions.warnings {
            info!(agent = %self.name, threshold, percent, "Context usage warning");
            session.emit(
                EventKind::ContextWarning,
                &self.name,
                json!({ "threshold": threshold, "usage_percent": percent }),
            );
            let warning = HookContext::new(HookEvent::ContextWarning, &self.name)
                .with_metadata("threshold", threshold)
                .with_metadata("usage_percent", percent);
            if let HookResult::FinishSwarm(content) = self.fire(session, warning).await? {
                session.request_finish(content);
            }
        }

        if actions.compress {
            let shortened = compress_history(history, config.compression_keep_recent);
            session.emit(
                EventKind::ContextCompressed,
                &self.name,
                json!({ "usage_percent": percent, "shortened": shortened }),
            );
        }
        Ok(())
    }

    fn tool_context(&self, session: &Arc<Session>, stack: &CallStack) -> ToolContext {
        ToolContext {
            agent: self.name.clone(),
            base_agent: self.base.clone(),
            directory: self
                .definition
                .directory
                .clone()
                .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))),
            call_stack: stack.clone(),
            session: Arc::clone(session),
            memory: Arc::clone(&self.memory),
        }
    }
}

impl std::fmt::Debug for AgentInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentInstance")
            .field("name", &self.name)
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
