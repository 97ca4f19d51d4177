//! # Warband
//!
//! Agent orchestration engine - a band of model-backed agents that hand
//! work to each other.
//!
//! A swarm is a delegation graph of agent definitions. Instances are created
//! lazily the first time they are asked for, and delegation edges become
//! tools on the delegating agent. Hooks intercept every lifecycle point, and
//! a workflow strings swarm runs together as a DAG of nodes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         WORKFLOW (optional)                         │
//! │    node ──▶ node ──▶ node        transformers: skip / halt / goto    │
//! └────────────────────────────┬────────────────────────────────────────┘
//!                              │ one nested swarm run per node visit
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                               SWARM                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐               │
//! │  │ Agent Graph  │  │ Hook Registry│  │ Tool Registry│               │
//! │  └──────┬───────┘  └──────────────┘  └──────────────┘               │
//! └─────────┼───────────────────────────────────────────────────────────┘
//!           │ lead.ask()
//!           ▼
//!    ┌─────────────┐  delegate_to_x  ┌─────────────┐  delegate_to_y  ┌─────────────┐
//!    │    lead     │ ──────────────▶ │   x@lead    │ ──────────────▶ │  y (shared) │
//!    └─────────────┘                 └─────────────┘                 └─────────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Definition**: Static description of an agent (model, tools, delegates)
//! - **Instance**: A live agent with its own history, created on first use
//! - **Isolation**: Isolated targets get one instance per delegator (`x@lead`);
//!   shared targets are a single instance
//! - **Session**: Runtime context of one run (events, cancellation, totals)
//! - **Hook**: Callback that may halt, replace, reprompt or finish at a lifecycle event
//! - **Workflow**: DAG of nodes, each running a set of agents

pub mod agent;
pub mod channel;
pub mod config;
pub mod context;
mod delegation;
pub mod definition;
pub mod error;
pub mod graph;
pub mod hierarchy;
pub mod hooks;
pub mod message;
pub mod model;
pub mod session;
pub mod storage;
pub mod swarm;
pub mod tool;
pub mod workflow;

#[cfg(test)]
mod testing;

pub use agent::AgentInstance;
pub use channel::{EventChannel, EventKind, EventSink, SwarmEvent};
pub use config::{SwarmConfig, WorkflowConfig};
pub use definition::{AgentDefinition, DelegationTarget, HookBinding, Isolation, ToolPermission};
pub use error::{SwarmError, WorkflowError};
pub use graph::AgentGraph;
pub use hierarchy::{CallStack, DelegationHierarchy};
pub use hooks::{CommandHook, FnHook, Hook, HookContext, HookEvent, HookRegistry, HookResult};
pub use message::{Message, Role, ToolCall};
pub use model::{ModelClient, ModelRequest, ModelResponse, TokenUsage, ToolSpec};
pub use session::Session;
pub use storage::{AgentMemory, Scratchpad};
pub use swarm::{Swarm, SwarmBuilder, SwarmResult, SwarmTask};
pub use tool::{Tool, ToolContext, ToolOutput, ToolRegistry};
pub use workflow::{
    CommandTransformer, FnTransformer, Node, NodeAgent, NodeContext, NodeResult, NodeStatus,
    Transform, Transformer, Workflow, WorkflowBuilder, WorkflowResult,
};
