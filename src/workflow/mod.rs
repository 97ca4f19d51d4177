//! Workflow DAG executor
//!
//! Nodes run one at a time in dependency order starting from the start
//! node. Each visit with bound agents is a nested swarm run under a child
//! session, so cancellation and hooks behave exactly as in a plain swarm.
//!
//! ```text
//!            ┌──────────┐
//!            │   plan   │
//!            └────┬─────┘
//!         ┌───────┴───────┐
//!   ┌─────▼────┐    ┌─────▼────┐
//!   │ frontend │    │ backend  │
//!   └─────┬────┘    └─────┬────┘
//!         └───────┬───────┘
//!          ┌──────▼──────┐
//!          │ integration │  receives both results by name
//!          └─────────────┘
//! ```
//!
//! Transformers may redirect the walk with `skip_execution`,
//! `halt_workflow` or `goto_node`; total node visits are bounded by
//! `WorkflowConfig::max_node_visits`.

mod executor;
mod node;
mod state;
mod transform;

pub use executor::{Workflow, WorkflowBuilder, WorkflowResult, WorkflowTask};
pub use node::{Node, NodeAgent, NodeResult, NodeStatus};
pub use state::{
    JsonPersistence, RestoreResult, RestoreStatus, StateBlob, StatePersistence, WorkflowState,
    STATE_VERSION,
};
pub use transform::{CommandTransformer, FnTransformer, NodeContext, Transform, Transformer};
