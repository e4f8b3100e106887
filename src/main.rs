//! steel-orchestrator - fronts a fleet of single-session browser workers

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use steel_orchestrator::config::Args;
use steel_orchestrator::forwarder::Forwarder;
use steel_orchestrator::pool::{PoolConfig, WorkerPool};
use steel_orchestrator::server::{self, AppState};
use steel_orchestrator::session::{self, SessionManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("steel_orchestrator={log_level},info").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("configuration error: {e}");
        std::process::exit(1);
    }

    info!("steel-orchestrator starting");
    info!("listen: {}", args.listen);
    info!("worker binary: {}", args.binary_path);
    info!("pool size: {}..{}", args.min_workers, args.max_workers);

    let sessions = Arc::new(SessionManager::new());

    let crash_sessions = Arc::clone(&sessions);
    let crash_handler: steel_orchestrator::worker::CrashHandler = Arc::new(move |session_id: String| {
        warn!(session_id = %session_id, "session lost: its worker crashed");
        crash_sessions.remove(&session_id);
    });

    let pool = WorkerPool::new(
        PoolConfig {
            min_workers: args.min_workers,
            max_workers: args.max_workers,
            binary_path: args.binary_path.clone(),
        },
        crash_handler,
    )
    .await?;
    info!("worker pool started with {} workers", pool.worker_count().await);

    let forwarder = Arc::new(Forwarder::new(args.forward_timeout()));

    session::spawn_ttl_sweeper(Arc::clone(&sessions), Arc::clone(&forwarder), args.session_ttl());

    let state = Arc::new(AppState {
        args: args.clone(),
        pool: Arc::clone(&pool),
        sessions,
        forwarder,
        started_at: Instant::now(),
    });

    let server = tokio::spawn(async move { server::run(state).await });

    tokio::select! {
        result = server => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, draining workers");
            pool.shutdown().await;
        }
    }

    Ok(())
}
