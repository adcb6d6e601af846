//! Built-in worker handlers.
//!
//! Business logic for each task lives here; the worker runtime only knows
//! the [`JobHandler`](crate::kernel::jobs::JobHandler) interface.

mod embed;
mod mock;

use std::sync::Arc;
use std::time::Duration;

use crate::kernel::jobs::HandlerRegistry;

pub use embed::{EmbedTextHandler, MockEmbeddingHandler};
pub use mock::ProcessMockHandler;

/// Registry with every built-in handler, using `tick` as the simulated
/// stage duration unit of the mock pipeline.
pub fn standard_registry(tick: Duration) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(ProcessMockHandler::new(tick)));
    registry.register(Arc::new(MockEmbeddingHandler));
    registry.register(Arc::new(EmbedTextHandler));
    registry
}
