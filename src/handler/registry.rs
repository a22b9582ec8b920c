//! Typed handler registry, built once at startup.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::JobError;
use crate::handler::TaskHandler;
use crate::jobs::TaskType;

/// Maps each task type to exactly one handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A second handler for the same task type is
    /// rejected.
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) -> Result<(), JobError> {
        let task_type = handler.task_type();
        if self.handlers.contains_key(&task_type) {
            return Err(JobError::DuplicateHandler {
                task_type: task_type.to_string(),
            });
        }
        tracing::debug!(%task_type, dependency = ?handler.dependency(), "Registered handler");
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }

    pub fn contains(&self, task_type: TaskType) -> bool {
        self.handlers.contains_key(&task_type)
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
