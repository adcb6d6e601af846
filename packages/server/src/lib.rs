// Conveyor - multi-tenant asynchronous job platform.
//
// Clients submit jobs over HTTP; the platform persists them through a
// transactional outbox, hands them to background workers via a broker, and
// exposes their lifecycle for polling. A secondary surface embeds and
// searches vector representations of text.

pub mod common;
pub mod config;
pub mod kernel;
pub mod server;

pub use config::*;
