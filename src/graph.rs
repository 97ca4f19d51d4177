//! Delegation graph - lazy registry of agent instances
//!
//! Instances are addressed by name and resolved through this registry, never
//! by direct reference, so mutually delegating definitions need no cyclic
//! ownership. Delegation tools hold a weak handle back to the graph.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, info};

use crate::agent::{AgentInstance, RunResources};
use crate::config::SwarmConfig;
use crate::definition::{split_instance_name, AgentDefinition};
use crate::delegation::DelegationTool;
use crate::error::SwarmError;
use crate::hierarchy::DelegationHierarchy;
use crate::hooks::{HookPipeline, HookRegistry, Matcher};
use crate::model::ModelClient;
use crate::storage::{AgentMemory, MemoryStore};
use crate::tool::{compile_permission, PermissionedTool, Tool, ToolRegistry};

/// Everything needed to assemble a graph
pub(crate) struct GraphParts {
    pub definitions: Vec<AgentDefinition>,
    pub hooks: Arc<HookRegistry>,
    pub tools: ToolRegistry,
    pub model: Arc<dyn ModelClient>,
    pub config: SwarmConfig,
    pub memories: MemoryStore,
}

/// Check a set of definitions against the catalogs before anything runs
pub(crate) fn validate_definitions(
    definitions: &[AgentDefinition],
    tools: &ToolRegistry,
    hooks: &HookRegistry,
) -> Result<(), SwarmError> {
    let mut seen = BTreeSet::new();
    for def in definitions {
        if !seen.insert(def.name.as_str()) {
            return Err(SwarmError::DuplicateAgent(def.name.clone()));
        }
        if def.name.contains('@') {
            return Err(SwarmError::InvalidConfig(format!(
                "agent name '{}' must not contain '@'",
                def.name
            )));
        }
        if let Some(tool) = def.tools.iter().find(|t| !tools.contains(t)) {
            return Err(SwarmError::UnknownTool {
                agent: def.name.clone(),
                tool: tool.clone(),
            });
        }
        for binding in &def.hooks {
            if hooks.named(&binding.hook).is_none() {
                return Err(SwarmError::UnknownNamedHook(binding.hook.clone()));
            }
            Matcher::parse(binding.matcher.as_deref())?;
        }
        for (tool, rule) in &def.permissions {
            let declared = def.tools.contains(tool)
                || def.delegates_to.iter().any(|t| &t.resolved_tool_name() == tool);
            if !declared {
                return Err(SwarmError::UnknownTool {
                    agent: def.name.clone(),
                    tool: tool.clone(),
                });
            }
            compile_permission(rule)?;
        }
    }

    DelegationHierarchy::from_definitions(definitions)?.validate()
}

/// Registry of definitions and lazily created instances
pub struct AgentGraph {
    definitions: BTreeMap<String, Arc<AgentDefinition>>,
    hooks: Arc<HookRegistry>,
    tools: ToolRegistry,
    resources: RunResources,
    instances: Mutex<HashMap<String, Arc<OnceCell<Arc<AgentInstance>>>>>,
    memories: MemoryStore,
    initializations: AtomicUsize,
    this: Weak<AgentGraph>,
}

impl AgentGraph {
    /// Validate and assemble; no instance is created yet
    pub(crate) fn build(parts: GraphParts) -> Result<Arc<Self>, SwarmError> {
        parts.config.validate()?;
        validate_definitions(&parts.definitions, &parts.tools, &parts.hooks)?;

        let definitions = parts
            .definitions
            .into_iter()
            .map(|d| (d.name.clone(), Arc::new(d)))
            .collect::<BTreeMap<_, _>>();
        info!(agents = definitions.len(), "Built delegation graph");

        let resources = RunResources {
            global: Arc::new(Semaphore::new(parts.config.global_concurrency)),
            config: Arc::new(parts.config),
            model: parts.model,
        };

        Ok(Arc::new_cyclic(|this| Self {
            definitions,
            hooks: parts.hooks,
            tools: parts.tools,
            resources,
            instances: Mutex::new(HashMap::new()),
            memories: parts.memories,
            initializations: AtomicUsize::new(0),
            this: this.clone(),
        }))
    }

    /// Resolve an instance, initializing it on first use.
    ///
    /// Concurrent first calls for the same name run a single initializer and
    /// all receive the same instance.
    pub async fn get_or_create(&self, instance: &str) -> Result<Arc<AgentInstance>, SwarmError> {
        let base = split_instance_name(instance).0;
        let definition = self
            .definitions
            .get(base)
            .cloned()
            .ok_or_else(|| SwarmError::UnknownAgent(base.to_string()))?;

        let cell = Arc::clone(
            self.instances
                .lock()
                .entry(instance.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new())),
        );

        cell.get_or_try_init(|| async move { self.initialize(instance, definition) })
            .await
            .cloned()
    }

    fn initialize(
        &self,
        instance: &str,
        definition: Arc<AgentDefinition>,
    ) -> Result<Arc<AgentInstance>, SwarmError> {
        debug!(agent = %instance, "Initializing agent instance");

        let mut tools: BTreeMap<String, Arc<dyn Tool>> = BTreeMap::new();
        for name in &definition.tools {
            let tool = self.tools.get(name).ok_or_else(|| SwarmError::UnknownTool {
                agent: definition.name.clone(),
                tool: name.clone(),
            })?;
            tools.insert(name.clone(), tool);
        }

        for target in &definition.delegates_to {
            let description = self
                .definitions
                .get(&target.agent)
                .map(|d| d.description.as_str())
                .unwrap_or_default();
            let tool = DelegationTool::new(self.this.clone(), instance, target.clone(), description);
            tools.insert(tool.name().to_string(), Arc::new(tool));
        }

        for (name, rule) in &definition.permissions {
            if let Some(tool) = tools.remove(name) {
                tools.insert(name.clone(), Arc::new(PermissionedTool::new(tool, rule)?));
            }
        }

        let hooks = HookPipeline::for_bindings(Arc::clone(&self.hooks), &definition.hooks)?;
        let memory = self.memories.for_agent(&definition.name);

        self.initializations.fetch_add(1, Ordering::SeqCst);
        info!(agent = %instance, tools = tools.len(), "Initialized agent instance");

        Ok(Arc::new(AgentInstance::new(
            instance,
            definition,
            self.resources.clone(),
            tools,
            hooks,
            memory,
        )))
    }

    /// An already-initialized instance
    pub fn instance(&self, name: &str) -> Option<Arc<AgentInstance>> {
        self.instances
            .lock()
            .get(name)
            .and_then(|cell| cell.get().cloned())
    }

    /// Names of initialized instances, sorted
    pub fn instance_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .instances
            .lock()
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// How many instances have been initialized over the graph's life
    pub fn initializations(&self) -> usize {
        self.initializations.load(Ordering::SeqCst)
    }

    pub fn definition(&self, name: &str) -> Option<&AgentDefinition> {
        self.definitions.get(name).map(Arc::as_ref)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    /// Memory shared by every instance of `base`
    pub fn memory(&self, base: &str) -> Arc<AgentMemory> {
        self.memories.for_agent(base)
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.resources.config
    }
}
