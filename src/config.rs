//! Configuration for steel-orchestrator
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// steel-orchestrator - fronts a fleet of single-session browser workers
#[derive(Parser, Debug, Clone)]
#[command(name = "steel-orchestrator")]
#[command(about = "Orchestrator for a fleet of single-session browser worker processes")]
pub struct Args {
    /// Address to listen on for the external HTTP API
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Path to the worker executable
    #[arg(long, env = "BINARY_PATH", default_value = "./steel-browser")]
    pub binary_path: String,

    /// Minimum pool size; also the scale-down floor
    #[arg(long, env = "MIN_WORKERS", default_value = "2")]
    pub min_workers: usize,

    /// Maximum pool size; the scale-up ceiling
    #[arg(long, env = "MAX_WORKERS", default_value = "10")]
    pub max_workers: usize,

    /// Per-session idle timeout, in seconds
    #[arg(long, env = "SESSION_TTL_SECS", default_value = "60")]
    pub session_ttl_secs: u64,

    /// Deadline for `Acquire` from the session-create handler, in seconds
    #[arg(long, env = "ACQUIRE_TIMEOUT_SECS", default_value = "300")]
    pub acquire_timeout_secs: u64,

    /// Per-forward-call deadline, in milliseconds
    #[arg(long, env = "FORWARD_TIMEOUT_MS", default_value = "5000")]
    pub forward_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Validate configuration invariants clap's type system can't express.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_workers == 0 {
            return Err("MIN_WORKERS must be at least 1".to_string());
        }
        if self.min_workers > self.max_workers {
            return Err("MIN_WORKERS must be less than or equal to MAX_WORKERS".to_string());
        }
        Ok(())
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }
}
