//! Shared test-only scaffolding: an in-process fake worker HTTP server that
//! stands in for the real `steel-browser` binary, so the Forwarder, the
//! Worker readiness/health probes, and the TTL sweeper can be exercised end
//! to end without spawning a real child process.

#![cfg(test)]

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

/// A fake worker answering `/health`, `POST /sessions`, `GET /sessions/:id`,
/// and `DELETE /sessions/:id` the way a real worker would. `set_healthy`
/// lets a test flip its `/health` response to simulate going unready.
pub(crate) struct FakeWorker {
    pub port: u16,
    healthy: Arc<AtomicBool>,
}

impl FakeWorker {
    pub(crate) async fn spawn() -> FakeWorker {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake worker");
        let port = listener.local_addr().expect("local_addr").port();
        let healthy = Arc::new(AtomicBool::new(true));
        let accept_healthy = Arc::clone(&healthy);

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let healthy = Arc::clone(&accept_healthy);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let healthy = Arc::clone(&healthy);
                        async move { Ok::<_, Infallible>(respond(req, &healthy).await) }
                    });
                    let _ = http1::Builder::new().serve_connection(io, service).await;
                });
            }
        });

        FakeWorker { port, healthy }
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub(crate) fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

/// Binds and immediately drops a listener, handing back a port nothing is
/// listening on — useful for simulating a forward failure (connection
/// refused) without coordinating a real worker crash.
pub(crate) async fn unreachable_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind scratch listener");
    listener.local_addr().expect("local_addr").port()
}

async fn respond(req: Request<Incoming>, healthy: &AtomicBool) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();

    match (&method, segments.as_slice()) {
        (_, ["health"]) => {
            let status = if healthy.load(Ordering::SeqCst) {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            Response::builder().status(status).body(Full::new(Bytes::new())).unwrap()
        }
        (&Method::POST, ["sessions"]) => {
            let _ = req.collect().await.map(|c| c.to_bytes()).unwrap_or_default();
            let id = uuid::Uuid::new_v4().to_string();
            let payload = serde_json::json!({ "id": id, "created_at": 0, "data": {} });
            Response::builder()
                .status(StatusCode::CREATED)
                .header("content-type", "application/json")
                .body(Full::new(Bytes::from(payload.to_string())))
                .unwrap()
        }
        (&Method::GET, ["sessions", id]) => {
            let payload = serde_json::json!({ "id": id, "created_at": 0, "data": {} });
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/json")
                .body(Full::new(Bytes::from(payload.to_string())))
                .unwrap()
        }
        (&Method::DELETE, ["sessions", _]) => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Full::new(Bytes::new()))
            .unwrap(),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()))
            .unwrap(),
    }
}
