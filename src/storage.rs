//! Shared stores reachable from tools
//!
//! Neither store adds locking semantics beyond a single read/write lock;
//! callers that need compare-and-set must build it on top.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

/// Volatile key/value store shared by every agent in a run
#[derive(Debug, Default)]
pub struct Scratchpad {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl Scratchpad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().get(key).cloned()
    }

    /// Store a value, returning the previous one
    pub fn set(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.entries.write().insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.entries.write().remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

/// Long-lived knowledge for one base agent.
///
/// Keyed by base agent name, so every instance of that agent (isolated or
/// shared) reads and writes the same memory.
#[derive(Debug)]
pub struct AgentMemory {
    agent: String,
    entries: RwLock<BTreeMap<String, String>>,
}

impl AgentMemory {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Base agent this memory belongs to
    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn remember(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.write().insert(key.into(), value.into());
    }

    pub fn recall(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    pub fn forget(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Memories for every base agent, shared by all graphs built from it
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    memories: Arc<Mutex<BTreeMap<String, Arc<AgentMemory>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Memory of `base`, created on first access
    pub fn for_agent(&self, base: &str) -> Arc<AgentMemory> {
        let mut memories = self.memories.lock();
        Arc::clone(
            memories
                .entry(base.to_string())
                .or_insert_with(|| Arc::new(AgentMemory::new(base))),
        )
    }

    pub fn agents(&self) -> Vec<String> {
        self.memories.lock().keys().cloned().collect()
    }
}
