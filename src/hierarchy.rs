//! Delegation hierarchy - static validation and runtime call stacks

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use crate::definition::{split_instance_name, AgentDefinition, Isolation};
use crate::error::SwarmError;

/// Delegation edges between primary agent names
#[derive(Debug, Clone, Default)]
pub struct DelegationHierarchy {
    edges: BTreeMap<String, Vec<(String, Isolation)>>,
}

impl DelegationHierarchy {
    /// Build from definitions, rejecting unknown targets
    pub fn from_definitions<'a, I>(definitions: I) -> Result<Self, SwarmError>
    where
        I: IntoIterator<Item = &'a AgentDefinition>,
    {
        let definitions: Vec<&AgentDefinition> = definitions.into_iter().collect();
        let names: BTreeSet<&str> = definitions.iter().map(|d| d.name.as_str()).collect();

        let mut edges = BTreeMap::new();
        for def in &definitions {
            let mut targets = Vec::with_capacity(def.delegates_to.len());
            for target in &def.delegates_to {
                if !names.contains(target.agent.as_str()) {
                    return Err(SwarmError::UnknownDelegationTarget {
                        agent: def.name.clone(),
                        target: target.agent.clone(),
                    });
                }
                targets.push((target.agent.clone(), target.isolation));
            }
            edges.insert(def.name.clone(), targets);
        }

        Ok(Self { edges })
    }

    /// Reject self-delegation and any cycle that contains a shared edge.
    ///
    /// A shared target is one instance whose history is locked for a whole
    /// ask, so two call trees entering such a cycle at different points
    /// would wait on each other. Cycles made only of isolated edges mint a
    /// fresh `base@delegator` instance per hop and are left to the runtime
    /// call-stack guard.
    pub fn validate(&self) -> Result<(), SwarmError> {
        for (agent, targets) in &self.edges {
            for (target, isolation) in targets {
                if target == agent {
                    return Err(SwarmError::DelegationCycle {
                        path: vec![agent.clone(), agent.clone()],
                    });
                }
                if *isolation != Isolation::Shared {
                    continue;
                }
                if let Some(back) = self.path_between(target, agent) {
                    let mut path = vec![agent.clone()];
                    path.extend(back);
                    return Err(SwarmError::DelegationCycle { path });
                }
            }
        }
        Ok(())
    }

    /// Shortest delegation path `from ..= to`, over edges of any isolation
    fn path_between(&self, from: &str, to: &str) -> Option<Vec<String>> {
        let mut parents: BTreeMap<&str, &str> = BTreeMap::new();
        let mut queue = VecDeque::from([from]);
        let mut seen = BTreeSet::from([from]);
        while let Some(agent) = queue.pop_front() {
            if agent == to {
                let mut path = vec![to.to_string()];
                let mut cursor = to;
                while let Some(parent) = parents.get(cursor) {
                    path.push(parent.to_string());
                    cursor = *parent;
                }
                path.reverse();
                return Some(path);
            }
            for (target, _) in self.edges.get(agent).into_iter().flatten() {
                if seen.insert(target.as_str()) {
                    parents.insert(target.as_str(), agent);
                    queue.push_back(target.as_str());
                }
            }
        }
        None
    }

    /// Direct delegation targets of `agent`
    pub fn delegates(&self, agent: &str) -> Vec<&str> {
        self.edges
            .get(agent)
            .map(|t| t.iter().map(|(name, _)| name.as_str()).collect())
            .unwrap_or_default()
    }

    /// Every agent reachable from `root` through delegation, `root` included
    pub fn reachable_from(&self, root: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![root.to_string()];
        while let Some(agent) = stack.pop() {
            if !seen.insert(agent.clone()) {
                continue;
            }
            for target in self.delegates(&agent) {
                stack.push(target.to_string());
            }
        }
        seen
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

/// Active delegation chain for one call tree.
///
/// Cheap to clone; `push` returns a new stack so sibling delegations never
/// see each other's frames and unwinding is implicit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStack {
    frames: Arc<Vec<String>>,
}

impl CallStack {
    pub fn root(instance: impl Into<String>) -> Self {
        Self {
            frames: Arc::new(vec![instance.into()]),
        }
    }

    /// New stack with `instance` on top
    pub fn push(&self, instance: impl Into<String>) -> Self {
        let mut frames = (*self.frames).clone();
        frames.push(instance.into());
        Self {
            frames: Arc::new(frames),
        }
    }

    pub fn frames(&self) -> &[String] {
        &self.frames
    }

    pub fn top(&self) -> Option<&str> {
        self.frames.last().map(String::as_str)
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Fail if `target` would loop back onto an active frame.
    ///
    /// Compares base agent names, so `a@b@a` collides with an active `a`.
    pub fn check(&self, target: &str) -> Result<(), SwarmError> {
        let target_base = split_instance_name(target).0;
        let loops = self
            .frames
            .iter()
            .any(|frame| frame == target || split_instance_name(frame).0 == target_base);
        if loops {
            return Err(SwarmError::DynamicDelegationCycle {
                stack: self.frames.to_vec(),
                target: target.to_string(),
            });
        }
        Ok(())
    }
}
