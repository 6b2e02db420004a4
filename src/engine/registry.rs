//! Execution registry
//!
//! Concurrent map from workflow id to its execution context. Registration is
//! an atomic insert-if-absent, which is the whole single-flight story: two
//! racing starts can't both win. Lookups hand out `Arc` clones immediately
//! so no shard lock is ever held across an await.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

use super::context::ExecutionContext;

/// Registry of active workflow runs
#[derive(Default)]
pub struct ExecutionRegistry {
    executions: DashMap<String, Arc<ExecutionContext>>,
}

impl ExecutionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            executions: DashMap::new(),
        }
    }

    /// Register a context under its id. Returns false when an execution for
    /// the id is already active.
    pub fn try_register(&self, ctx: Arc<ExecutionContext>) -> bool {
        match self.executions.entry(ctx.id().to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(ctx);
                true
            }
        }
    }

    /// Context for an id, if active
    pub fn get(&self, id: &str) -> Option<Arc<ExecutionContext>> {
        self.executions.get(id).map(|e| e.value().clone())
    }

    /// Remove and return the context for an id
    pub fn remove(&self, id: &str) -> Option<Arc<ExecutionContext>> {
        self.executions.remove(id).map(|(_, ctx)| ctx)
    }

    /// Ids of all active runs
    pub fn active_ids(&self) -> Vec<String> {
        self.executions.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of active runs
    pub fn len(&self) -> usize {
        self.executions.len()
    }

    /// True when nothing is running
    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }
}
