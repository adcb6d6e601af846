//! Handler registry: maps broker task names to worker handlers.
//!
//! Handlers are plain values implementing [`JobHandler`]; the worker resolves
//! them by task name at startup and per delivery. No inheritance, no dynamic
//! dispatch beyond the map lookup.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::common::CoreError;

use super::worker::JobContext;

/// A worker-side task implementation.
///
/// Handlers must be re-entrant: delivery is at-least-once, and a handler can
/// consult the job row through the context to detect work that already
/// happened. Progress reporting goes through [`JobContext::progress`].
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The broker task name this handler serves.
    fn name(&self) -> &'static str;

    /// Execute the task. `args[0]` is the job id (already resolved into the
    /// context); kwargs carry the operation inputs.
    ///
    /// `Ok(Some(value))` lands in the final `succeeded` event as the result.
    async fn run(
        &self,
        ctx: &JobContext,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Option<Value>, CoreError>;
}

/// Task-name-keyed handler table, resolved once at worker startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.name(), handler);
    }

    pub fn get(&self, task_name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(task_name).cloned()
    }

    pub fn is_registered(&self, task_name: &str) -> bool {
        self.handlers.contains_key(task_name)
    }

    pub fn registered_names(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }
}
