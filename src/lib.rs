//! steel-orchestrator - fronts a fleet of single-session browser worker processes
//!
//! Multiplexes a dynamic pool of unreliable single-session workers behind one
//! HTTP API, routes every request for a session to the worker that owns it,
//! and enforces a per-session inactivity timeout.
//!
//! ## Modules
//!
//! - **worker**: one child-process handle, its lifecycle state machine
//! - **pool**: the auto-scaling set of workers and the acquire/release semaphore
//! - **session**: the session_id -> worker mapping and its TTL sweeper
//! - **forwarder**: the typed client used to talk to a specific worker
//! - **server**: the HTTP surface that exercises all of the above

pub mod config;
pub mod forwarder;
pub mod pool;
pub mod server;
pub mod session;
#[cfg(test)]
mod test_support;
pub mod types;
pub mod worker;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{OrchestratorError, Result};
