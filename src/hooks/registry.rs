//! Hook registry and per-instance pipeline

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::{Hook, HookContext, HookEvent, HookResult, Matcher};
use crate::definition::HookBinding;
use crate::error::SwarmError;

#[derive(Clone)]
struct HookEntry {
    matcher: Matcher,
    priority: i32,
    hook: Arc<dyn Hook>,
}

/// Registry-wide default hooks and user-named reusable hooks
#[derive(Default)]
pub struct HookRegistry {
    defaults: RwLock<HashMap<HookEvent, Vec<HookEntry>>>,
    named: RwLock<HashMap<String, Arc<dyn Hook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a default hook applied to every agent for `event`
    pub fn register_default(
        &self,
        event: HookEvent,
        matcher: Option<&str>,
        priority: i32,
        hook: Arc<dyn Hook>,
    ) -> Result<(), SwarmError> {
        let matcher = Matcher::parse(matcher)?;
        info!(event = %event, hook = hook.name(), priority, "Registered default hook");
        self.defaults.write().entry(event).or_default().push(HookEntry {
            matcher,
            priority,
            hook,
        });
        Ok(())
    }

    /// Register a reusable hook referenced by name from agent definitions.
    /// Re-registering a name replaces the previous hook.
    pub fn register_named(&self, name: impl Into<String>, hook: Arc<dyn Hook>) {
        let name = name.into();
        if self.named.write().insert(name.clone(), hook).is_some() {
            warn!(hook = %name, "Replaced named hook");
        } else {
            debug!(hook = %name, "Registered named hook");
        }
    }

    pub fn named(&self, name: &str) -> Option<Arc<dyn Hook>> {
        self.named.read().get(name).cloned()
    }

    /// Number of default hooks registered for `event`
    pub fn default_count(&self, event: HookEvent) -> usize {
        self.defaults.read().get(&event).map_or(0, Vec::len)
    }

    /// Fire registry defaults only
    pub async fn fire(&self, context: &HookContext) -> HookResult {
        run_entries(self.applicable(context), context).await
    }

    fn applicable(&self, context: &HookContext) -> Vec<HookEntry> {
        let tool = match_subject(context);
        self.defaults
            .read()
            .get(&context.event)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.matcher.matches(tool))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Hooks applicable to one agent instance: registry defaults plus the
/// instance's own bindings.
#[derive(Clone)]
pub struct HookPipeline {
    registry: Arc<HookRegistry>,
    instance: Vec<(HookEvent, HookEntry)>,
}

impl HookPipeline {
    /// Pipeline with registry defaults only
    pub fn new(registry: Arc<HookRegistry>) -> Self {
        Self {
            registry,
            instance: Vec::new(),
        }
    }

    /// Resolve an agent's named-hook bindings against the registry
    pub fn for_bindings(
        registry: Arc<HookRegistry>,
        bindings: &[HookBinding],
    ) -> Result<Self, SwarmError> {
        let mut instance = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let hook = registry
                .named(&binding.hook)
                .ok_or_else(|| SwarmError::UnknownNamedHook(binding.hook.clone()))?;
            instance.push((
                binding.event,
                HookEntry {
                    matcher: Matcher::parse(binding.matcher.as_deref())?,
                    priority: binding.priority,
                    hook,
                },
            ));
        }
        Ok(Self { registry, instance })
    }

    pub fn registry(&self) -> &Arc<HookRegistry> {
        &self.registry
    }

    /// Run the applicable callbacks; the first decisive result wins
    pub async fn fire(&self, context: &HookContext) -> HookResult {
        let tool = match_subject(context);
        let mut entries = self.registry.applicable(context);
        entries.extend(
            self.instance
                .iter()
                .filter(|(event, entry)| *event == context.event && entry.matcher.matches(tool))
                .map(|(_, entry)| entry.clone()),
        );
        run_entries(entries, context).await
    }
}

/// Events without a tool match every matcher
fn match_subject(context: &HookContext) -> Option<&str> {
    if context.event.carries_tool() {
        context.tool_name()
    } else {
        None
    }
}

async fn run_entries(mut entries: Vec<HookEntry>, context: &HookContext) -> HookResult {
    // stable: equal priorities keep registration order, defaults first
    entries.sort_by(|a, b| b.priority.cmp(&a.priority));

    for entry in &entries {
        match entry.hook.call(context).await {
            Ok(HookResult::Continue) => {
                debug!(hook = entry.hook.name(), event = %context.event, "Hook returned Continue");
            }
            Ok(result) => {
                info!(
                    hook = entry.hook.name(),
                    event = %context.event,
                    agent = %context.agent,
                    decision = result.decision(),
                    "Hook short-circuited"
                );
                return result;
            }
            Err(e) => {
                warn!(
                    hook = entry.hook.name(),
                    event = %context.event,
                    error = %e,
                    "Hook failed, continuing"
                );
            }
        }
    }

    HookResult::Continue
}
