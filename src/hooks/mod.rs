//! Hook interception pipeline
//!
//! Hooks are callbacks fired at fixed lifecycle events. For each firing the
//! applicable callbacks run in priority order (highest first, registration
//! order breaks ties) and the first non-`Continue` result wins; later
//! callbacks never run. A callback that errors is logged and treated as
//! `Continue`.
//!
//! ## Built-in Hooks
//! - [`FnHook`] - wraps a closure
//! - [`CommandHook`] - runs an external program (out-of-process)

mod command;
mod context;
mod event;
mod matcher;
mod registry;
mod result;

use async_trait::async_trait;

pub use command::CommandHook;
pub use context::HookContext;
pub use event::HookEvent;
pub use matcher::Matcher;
pub use registry::{HookPipeline, HookRegistry};
pub use result::HookResult;

/// A hook callback
#[async_trait]
pub trait Hook: Send + Sync {
    /// Name used in logs and events
    fn name(&self) -> &str;

    /// Decide what happens at this event.
    ///
    /// Return `HookResult::Continue` to leave execution untouched.
    async fn call(&self, context: &HookContext) -> anyhow::Result<HookResult>;
}

type HookFn = dyn Fn(&HookContext) -> anyhow::Result<HookResult> + Send + Sync;

/// In-process hook backed by a closure
pub struct FnHook {
    name: String,
    f: Box<HookFn>,
}

impl FnHook {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&HookContext) -> HookResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(move |ctx| Ok(f(ctx))),
        }
    }

    /// Closure that may fail; failures count as `Continue`
    pub fn fallible<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&HookContext) -> anyhow::Result<HookResult> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

#[async_trait]
impl Hook for FnHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, context: &HookContext) -> anyhow::Result<HookResult> {
        (self.f)(context)
    }
}
