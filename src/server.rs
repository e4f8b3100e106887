//! The HTTP surface: a raw hyper/1 server exercising the pool, the session
//! map, and the forwarder.
//!
//! No framework here, same as the rest of this stack — a `service_fn` per
//! connection and a hand-rolled method+path match, because the route table
//! is small enough that a router crate would be pure overhead.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::Args;
use crate::forwarder::Forwarder;
use crate::pool::WorkerPool;
use crate::session::SessionManager;
use crate::types::OrchestratorError;
use crate::worker::WorkerState;

pub struct AppState {
    pub args: Args,
    pub pool: Arc<WorkerPool>,
    pub sessions: Arc<SessionManager>,
    pub forwarder: Arc<Forwarder>,
    pub started_at: Instant,
}

pub async fn run(state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;
    info!("steel-orchestrator listening on {}", state.args.listen);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        error!("error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("error accepting connection: {:?}", e);
            }
        }
    }
}

async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let segments: Vec<&str> = path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();

    let request_id = uuid::Uuid::new_v4();
    tracing::debug!(%addr, %method, %path, %request_id, "request");

    let response = match (&method, segments.as_slice()) {
        (&Method::POST, ["sessions"]) => handle_create_session(&state, req).await,
        (&Method::GET, ["sessions", id]) => handle_get_session(&state, id).await,
        (&Method::DELETE, ["sessions", id]) => handle_delete_session(&state, id).await,
        (&Method::GET, ["health"]) | (&Method::GET, ["healthz"]) => health_response(&state),
        (&Method::GET, ["ready"]) | (&Method::GET, ["readyz"]) => readiness_response(&state).await,
        (&Method::GET, ["debug", "workers"]) => debug_workers_response(&state, query.as_deref()).await,
        (&Method::GET, ["version"]) => version_response(),
        _ => not_found_response(&path),
    };

    let (mut parts, body) = response.into_parts();
    parts
        .headers
        .insert("x-request-id", request_id.to_string().parse().unwrap());
    Ok(Response::from_parts(parts, body))
}

async fn handle_create_session(state: &Arc<AppState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let body = match req.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return bad_request_response(&format!("failed to read request body: {e}")),
    };

    const MAX_ATTEMPTS: u32 = 3;
    for attempt in 1..=MAX_ATTEMPTS {
        let worker = match state.pool.acquire(state.args.acquire_timeout()).await {
            Ok(w) => w,
            Err(_) => return status_response(StatusCode::SERVICE_UNAVAILABLE, "no worker became available"),
        };

        match state.forwarder.create_session(&worker, body.clone()).await {
            Ok(created) => {
                state.sessions.add(created.session_id.clone(), Arc::clone(&worker));
                worker.set_session(Some(created.session_id.clone()));
                return Response::builder()
                    .status(StatusCode::CREATED)
                    .header("content-type", "application/json")
                    .body(Full::new(created.body))
                    .unwrap();
            }
            Err(e) if e.is_forward_failure() => {
                warn!(worker_id = worker.id, attempt, error = %e, "create-session forward failed, retrying");
                worker.kill();
                continue;
            }
            Err(OrchestratorError::UpstreamStatus(status)) => {
                worker.release();
                return status_response(status, "worker rejected session creation");
            }
            Err(e) => {
                worker.release();
                return status_response(StatusCode::BAD_GATEWAY, &e.to_string());
            }
        }
    }

    status_response(StatusCode::BAD_GATEWAY, "exhausted retries creating a session")
}

async fn handle_get_session(state: &Arc<AppState>, session_id: &str) -> Response<Full<Bytes>> {
    let Some(worker) = state.sessions.get(session_id) else {
        return not_found_response(session_id);
    };

    match state.forwarder.get_session(&worker, session_id).await {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(Full::new(body))
            .unwrap(),
        Err(_) => {
            // The session is no longer reachable on this worker: drop the
            // mapping and put the worker down rather than serve stale state.
            state.sessions.remove(session_id);
            worker.kill();
            not_found_response(session_id)
        }
    }
}

async fn handle_delete_session(state: &Arc<AppState>, session_id: &str) -> Response<Full<Bytes>> {
    let Some(worker) = state.sessions.remove(session_id) else {
        return not_found_response(session_id);
    };

    let _ = state.forwarder.delete_session(&worker, session_id).await;
    worker.release();

    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    uptime_secs: u64,
    checked_at: chrono::DateTime<chrono::Utc>,
}

fn health_response(state: &Arc<AppState>) -> Response<Full<Bytes>> {
    let uptime_secs = state.started_at.elapsed().as_secs();
    json_response(
        StatusCode::OK,
        &HealthBody {
            status: "ok",
            uptime_secs,
            checked_at: chrono::Utc::now(),
        },
    )
}

#[derive(Serialize)]
struct ReadyBody {
    ready: bool,
    min_workers: usize,
    worker_count: usize,
    available_count: usize,
}

async fn readiness_response(state: &Arc<AppState>) -> Response<Full<Bytes>> {
    let snapshot = state.pool.snapshot().await;
    let live_workers = snapshot
        .workers
        .iter()
        .filter(|w| matches!(w.state, WorkerState::Available | WorkerState::Busy))
        .count();
    let ready = live_workers >= snapshot.min;

    let body = ReadyBody {
        ready,
        min_workers: snapshot.min,
        worker_count: snapshot.workers.len(),
        available_count: snapshot.available_depth,
    };

    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    json_response(status, &body)
}

/// `GET /debug/workers` returns the whole pool snapshot; `GET
/// /debug/workers?session_id=...` narrows it to the one Worker holding that
/// session, via `WorkerPool::find_by_session` — the crash-debug lookup the
/// spec describes this endpoint as backed by.
async fn debug_workers_response(state: &Arc<AppState>, query: Option<&str>) -> Response<Full<Bytes>> {
    if let Some(session_id) = query.and_then(session_id_param) {
        return match state.pool.find_by_session(&session_id).await {
            Some(worker) => json_response(StatusCode::OK, &worker.snapshot()),
            None => not_found_response(&session_id),
        };
    }

    let snapshot = state.pool.snapshot().await;
    json_response(StatusCode::OK, &snapshot)
}

fn session_id_param(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "session_id" && !value.is_empty()).then(|| value.to_string())
    })
}

#[derive(Serialize)]
struct VersionBody {
    version: &'static str,
    git_commit: &'static str,
    build_timestamp: &'static str,
}

fn version_response() -> Response<Full<Bytes>> {
    let body = VersionBody {
        version: env!("CARGO_PKG_VERSION"),
        git_commit: option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown"),
        build_timestamp: option_env!("BUILD_TIMESTAMP").unwrap_or("unknown"),
    };
    json_response(StatusCode::OK, &body)
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(json)))
        .unwrap()
}

fn status_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": message });
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

fn bad_request_response(message: &str) -> Response<Full<Bytes>> {
    status_response(StatusCode::BAD_REQUEST, message)
}

fn not_found_response(what: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": "not found", "path": what });
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
