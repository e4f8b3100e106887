//! Crate-wide error taxonomy
//!
//! One enum for every failure kind the core distinguishes (see the error
//! handling design): transient forward failures, upstream HTTP errors,
//! acquire timeouts, spawn failures, and session lookups. Handlers match on
//! variants to pick the right HTTP status and retry policy; everything else
//! just needs to log and propagate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Spawning the child process, or allocating its port, failed.
    #[error("failed to spawn worker: {0}")]
    WorkerSpawnFailed(String),

    /// `Acquire` hit its deadline before a worker became available.
    #[error("no worker became available before the deadline")]
    AcquireTimeout,

    /// A forward call could not reach the worker at all (connect/reset/timeout).
    #[error("forward to worker failed: {0}")]
    ForwardFailed(String),

    /// The worker answered, but with a non-2xx status.
    #[error("worker responded with status {0}")]
    UpstreamStatus(reqwest::StatusCode),

    /// The worker's response body could not be parsed as the expected JSON shape.
    #[error("failed to parse worker response: {0}")]
    ParseFailed(String),

    /// No session exists for the given id.
    #[error("session not found")]
    SessionNotFound,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// Whether this error should be treated as a forward failure for retry
    /// purposes, per the Forwarder's "forward-failure vs HTTP-error" split.
    pub fn is_forward_failure(&self) -> bool {
        matches!(self, OrchestratorError::ForwardFailed(_) | OrchestratorError::ParseFailed(_))
    }
}
