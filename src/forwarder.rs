//! Typed client for talking to one worker's HTTP API.
//!
//! Every call distinguishes a *forward failure* (the worker couldn't be
//! reached at all: connection refused, reset, or our own deadline) from an
//! *upstream HTTP error* (the worker answered, just not with 2xx). Callers
//! need that distinction because only the former is a signal the worker
//! itself has gone bad.

use bytes::Bytes;
use serde::Deserialize;

use crate::types::{OrchestratorError, Result};
use crate::worker::Worker;

pub struct Forwarder {
    client: reqwest::Client,
    timeout: std::time::Duration,
}

#[derive(Debug, Deserialize)]
struct WorkerSessionBody {
    id: String,
}

pub struct CreateSessionResult {
    pub session_id: String,
    pub body: Bytes,
}

impl Forwarder {
    pub fn new(timeout: std::time::Duration) -> Self {
        Forwarder {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    fn worker_url(worker: &Worker, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", worker.port(), path)
    }

    pub async fn create_session(&self, worker: &Worker, body: Bytes) -> Result<CreateSessionResult> {
        let resp = self
            .client
            .post(Self::worker_url(worker, "/sessions"))
            .timeout(self.timeout)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| OrchestratorError::ForwardFailed(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(OrchestratorError::UpstreamStatus(status));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| OrchestratorError::ForwardFailed(e.to_string()))?;
        let parsed: WorkerSessionBody =
            serde_json::from_slice(&bytes).map_err(|e| OrchestratorError::ParseFailed(e.to_string()))?;

        Ok(CreateSessionResult {
            session_id: parsed.id,
            body: bytes,
        })
    }

    pub async fn get_session(&self, worker: &Worker, session_id: &str) -> Result<Bytes> {
        let resp = self
            .client
            .get(Self::worker_url(worker, &format!("/sessions/{session_id}")))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| OrchestratorError::ForwardFailed(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(OrchestratorError::UpstreamStatus(status));
        }

        resp.bytes()
            .await
            .map_err(|e| OrchestratorError::ForwardFailed(e.to_string()))
    }

    pub async fn delete_session(&self, worker: &Worker, session_id: &str) -> Result<()> {
        let resp = self
            .client
            .delete(Self::worker_url(worker, &format!("/sessions/{session_id}")))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| OrchestratorError::ForwardFailed(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(OrchestratorError::UpstreamStatus(status));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{unreachable_port, FakeWorker};
    use crate::worker::Worker;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn worker_url_uses_the_workers_current_port() {
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let worker = crate::worker::Worker::new(
            1,
            tx,
            std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            std::sync::Arc::new(|_| {}),
        );
        assert_eq!(Forwarder::worker_url(&worker, "/health"), "http://127.0.0.1:0/health");
    }

    fn test_worker(port: u16) -> Arc<Worker> {
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        Worker::new_for_test(1, port, tx, Arc::new(AtomicUsize::new(0)))
    }

    #[tokio::test]
    async fn create_session_parses_the_id_out_of_the_fake_workers_response() {
        let fake = FakeWorker::spawn().await;
        let worker = test_worker(fake.port);
        let forwarder = Forwarder::new(Duration::from_secs(1));

        let created = forwarder
            .create_session(&worker, Bytes::from_static(br#"{"user":"alice"}"#))
            .await
            .unwrap();

        assert!(!created.session_id.is_empty());
        assert!(!created.body.is_empty());
    }

    #[tokio::test]
    async fn get_session_round_trips_against_the_fake_worker() {
        let fake = FakeWorker::spawn().await;
        let worker = test_worker(fake.port);
        let forwarder = Forwarder::new(Duration::from_secs(1));

        let created = forwarder
            .create_session(&worker, Bytes::from_static(b"{}"))
            .await
            .unwrap();
        let fetched = forwarder.get_session(&worker, &created.session_id).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&fetched).unwrap();
        assert_eq!(parsed["id"], created.session_id);
    }

    #[tokio::test]
    async fn delete_session_succeeds_against_the_fake_worker() {
        let fake = FakeWorker::spawn().await;
        let worker = test_worker(fake.port);
        let forwarder = Forwarder::new(Duration::from_secs(1));

        forwarder.delete_session(&worker, "whatever-id").await.unwrap();
    }

    #[tokio::test]
    async fn create_session_against_an_unreachable_worker_is_a_forward_failure() {
        let port = unreachable_port().await;
        let worker = test_worker(port);
        let forwarder = Forwarder::new(Duration::from_millis(200));

        let err = forwarder.create_session(&worker, Bytes::from_static(b"{}")).await.unwrap_err();
        assert!(err.is_forward_failure());
    }
}
