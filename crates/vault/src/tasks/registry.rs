//! Explicit task-type registration.
//!
//! The handler map is swapped atomically on registration, so lookups on the
//! hot path never take a lock.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use thiserror::Error;

use super::TaskHandler;

#[derive(Debug, Error)]
#[error("task type {0:?} is already registered")]
pub struct DuplicateTaskType(pub String);

type HandlerMap = HashMap<String, Arc<dyn TaskHandler>>;

/// Task type name → handler.
#[derive(Clone)]
pub struct TaskRegistry {
    handlers: Arc<ArcSwap<HandlerMap>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(ArcSwap::from_pointee(HashMap::new())),
        }
    }

    /// Register `handler` under `task_type`.
    ///
    /// # Errors
    ///
    /// Returns [`DuplicateTaskType`] if the name is taken; the existing
    /// handler is kept.
    pub fn register(
        &self,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), DuplicateTaskType> {
        let task_type = task_type.into();
        let mut duplicate = false;
        self.handlers.rcu(|current| {
            let mut next = HandlerMap::clone(current);
            duplicate = next.contains_key(&task_type);
            if !duplicate {
                next.insert(task_type.clone(), handler.clone());
            }
            next
        });
        if duplicate {
            return Err(DuplicateTaskType(task_type));
        }
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.load().get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.load().contains_key(task_type)
    }

    /// Registered task type names, sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.load().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskContext;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl TaskHandler for Noop {
        async fn run(&self, _ctx: &TaskContext, _payload: &serde_json::Value) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn register_and_lookup() {
        let registry = TaskRegistry::new();
        registry.register("noop", Arc::new(Noop)).unwrap();
        assert!(registry.contains("noop"));
        assert!(registry.get("noop").is_some());
        assert!(registry.get("other").is_none());
    }

    #[test]
    fn duplicates_are_rejected() {
        let registry = TaskRegistry::new();
        registry.register("noop", Arc::new(Noop)).unwrap();
        assert!(registry.register("noop", Arc::new(Noop)).is_err());
        assert_eq!(registry.task_types(), vec!["noop"]);
    }

    #[test]
    fn clones_share_registrations() {
        let registry = TaskRegistry::new();
        let other = registry.clone();
        registry.register("b", Arc::new(Noop)).unwrap();
        other.register("a", Arc::new(Noop)).unwrap();
        assert_eq!(registry.task_types(), vec!["a", "b"]);
    }
}
