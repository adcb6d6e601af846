//! Job infrastructure: the reliable ingest and dispatch core.
//!
//! ```text
//! client -> IngestService
//!     |         (one tx: job row + initial event + outbox row)
//!     v
//! JobStore (ledger + outbox)
//!     |
//!     |  OutboxDispatcher claims unsent rows (skip-locked)
//!     v
//! Broker -- at-least-once --> WorkerRuntime
//!                                 |  terminal-state guard,
//!                                 |  queued -> running -> terminal
//!                                 v
//!                             JobStore <- StatusReader <- polling client
//! ```

pub mod dispatcher;
pub mod events;
pub mod ingest;
mod job;
mod outbox;
mod pg;
pub mod registry;
pub mod status;
mod store;
pub mod testing;
pub mod worker;

pub use dispatcher::{DispatcherConfig, OutboxDispatcher};
pub use events::{EventDetail, JobEvent};
pub use ingest::{IngestService, Operation, OperationCatalog, SubmitRequest};
pub use job::{truncate_error, BackoffPolicy, Job, JobStatus, NewJob, Transition};
pub use outbox::{NewOutboxMessage, OutboxMessage, TaskMessage};
pub use pg::PostgresJobStore;
pub use registry::{HandlerRegistry, JobHandler};
pub use status::{external_status, StatusReader, StatusView};
pub use store::{CreateOutcome, JobStore, OutboxClaim};
pub use worker::{JobContext, WorkerConfig, WorkerRuntime};
