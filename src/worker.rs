//! A single worker: one child process, one state machine.
//!
//! Every spawn gets a fresh ephemeral port (asked of the OS by binding and
//! immediately releasing a listener) and a background pair of tasks: a
//! readiness prober that waits for the worker's `/health` to answer, and a
//! monitor that blocks on the child's exit and decides whether to restart.
//! Neither task talks to the pool directly — a crashed or newly-ready worker
//! announces itself by pushing into the `available` channel it was handed at
//! construction time, which is the only coupling back to the pool.

use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify};
use tokio::time::sleep;

use crate::types::{OrchestratorError, Result};

/// Invoked at most once per crash, with the session id the worker was
/// carrying, if any. Installed on every worker by the pool at construction
/// time so workers never need a handle back to the session manager.
pub type CrashHandler = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Starting,
    Available,
    Busy,
    Unhealthy,
    Dead,
}

struct Inner {
    state: WorkerState,
    port: u16,
    session_id: Option<String>,
    draining: bool,
}

pub struct Worker {
    pub id: u64,
    inner: Mutex<Inner>,
    kill_notify: Notify,
    available_tx: mpsc::Sender<Arc<Worker>>,
    available_count: Arc<AtomicUsize>,
    crash_handler: CrashHandler,
    self_ref: OnceLock<Weak<Worker>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: u64,
    pub port: u16,
    pub state: WorkerState,
    pub session_id: Option<String>,
}

impl Worker {
    pub(crate) fn new(
        id: u64,
        available_tx: mpsc::Sender<Arc<Worker>>,
        available_count: Arc<AtomicUsize>,
        crash_handler: CrashHandler,
    ) -> Arc<Worker> {
        let worker = Arc::new(Worker {
            id,
            inner: Mutex::new(Inner {
                state: WorkerState::Dead,
                port: 0,
                session_id: None,
                draining: false,
            }),
            kill_notify: Notify::new(),
            available_tx,
            available_count,
            crash_handler,
            self_ref: OnceLock::new(),
        });
        let _ = worker.self_ref.set(Arc::downgrade(&worker));
        worker
    }

    /// Wires a worker directly to an already-listening port in the
    /// `Available` state, skipping `start()`'s real spawn. Lets tests in
    /// other modules point a `Worker` at a `FakeWorker` without a real
    /// child process.
    #[cfg(test)]
    pub(crate) fn new_for_test(
        id: u64,
        port: u16,
        available_tx: mpsc::Sender<Arc<Worker>>,
        available_count: Arc<AtomicUsize>,
    ) -> Arc<Worker> {
        let worker = Worker::new(id, available_tx, available_count, Arc::new(|_| {}));
        {
            let mut inner = worker.inner.lock().unwrap();
            inner.port = port;
            inner.state = WorkerState::Available;
        }
        worker
    }

    pub fn state(&self) -> WorkerState {
        self.inner.lock().unwrap().state
    }

    pub fn is_available(&self) -> bool {
        self.state() == WorkerState::Available
    }

    pub fn port(&self) -> u16 {
        self.inner.lock().unwrap().port
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.lock().unwrap().session_id.clone()
    }

    pub fn holds_session(&self, id: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .session_id
            .as_deref()
            .map(|s| s == id)
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let inner = self.inner.lock().unwrap();
        WorkerSnapshot {
            id: self.id,
            port: inner.port,
            state: inner.state,
            session_id: inner.session_id.clone(),
        }
    }

    /// Marks this worker as draining: once its child exits it will not be
    /// restarted. Idempotent.
    pub fn drain(&self) {
        self.inner.lock().unwrap().draining = true;
    }

    /// Requests the child be killed. Non-blocking and idempotent: if the
    /// monitor task isn't listening yet the notification is held for it, and
    /// if the child is already gone this is simply a no-op.
    pub fn kill(&self) {
        self.kill_notify.notify_one();
    }

    /// Assigns or clears the session this worker is carrying, with the
    /// matching state transition. A request that doesn't match the worker's
    /// current state (e.g. clearing a session on a worker that was never
    /// marked Busy) is a no-op — this is what makes `Release` idempotent.
    pub fn set_session(&self, session_id: Option<String>) {
        let should_release = {
            let mut inner = self.inner.lock().unwrap();
            match (&session_id, inner.state) {
                (Some(id), WorkerState::Available) => {
                    inner.session_id = Some(id.clone());
                    inner.state = WorkerState::Busy;
                    false
                }
                (None, WorkerState::Busy) => {
                    inner.session_id = None;
                    inner.state = WorkerState::Available;
                    true
                }
                _ => false,
            }
        };
        if should_release {
            self.release_self();
        }
    }

    /// Equivalent to `set_session(None)`, exposed directly for callers (the
    /// pool's `Release`) that don't go through the create/get/delete path.
    pub fn release(&self) {
        self.set_session(None);
    }

    fn mark_available(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = WorkerState::Available;
            inner.session_id = None;
        }
        self.release_self();
    }

    fn mark_unhealthy(&self) {
        self.inner.lock().unwrap().state = WorkerState::Unhealthy;
    }

    fn release_self(&self) {
        let Some(weak) = self.self_ref.get() else {
            return;
        };
        let Some(arc) = weak.upgrade() else {
            return;
        };
        if self.available_tx.try_send(arc).is_ok() {
            self.available_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub async fn health_check(&self, client: &reqwest::Client) -> bool {
        let port = self.port();
        if port == 0 {
            return false;
        }
        let url = format!("http://127.0.0.1:{port}/health");
        matches!(
            client.get(&url).timeout(Duration::from_secs(2)).send().await,
            Ok(resp) if resp.status() == reqwest::StatusCode::OK
        )
    }

    /// Spawns the child process and launches its monitor and readiness
    /// probe. Fails only if the current state isn't Dead or Unhealthy, or if
    /// the OS refuses a port or the process itself.
    pub(crate) async fn start(self: &Arc<Self>, binary_path: Arc<str>, http: reqwest::Client) -> Result<()> {
        {
            let inner = self.inner.lock().unwrap();
            if !matches!(inner.state, WorkerState::Dead | WorkerState::Unhealthy) {
                return Err(OrchestratorError::WorkerSpawnFailed(format!(
                    "worker {} is not Dead or Unhealthy (state: {:?})",
                    self.id, inner.state
                )));
            }
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| OrchestratorError::WorkerSpawnFailed(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| OrchestratorError::WorkerSpawnFailed(e.to_string()))?
            .port();
        drop(listener);

        let child = Command::new(binary_path.as_ref())
            .env("PORT", port.to_string())
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| OrchestratorError::WorkerSpawnFailed(e.to_string()))?;

        {
            let mut inner = self.inner.lock().unwrap();
            inner.port = port;
            inner.state = WorkerState::Starting;
            inner.session_id = None;
        }

        tracing::info!(worker_id = self.id, port, "worker starting");

        let monitor_self = Arc::clone(self);
        let monitor_binary = Arc::clone(&binary_path);
        let monitor_http = http.clone();
        tokio::spawn(async move {
            monitor_self.monitor(child, monitor_binary, monitor_http).await;
        });

        let probe_self = Arc::clone(self);
        tokio::spawn(async move {
            probe_self.readiness_probe(http).await;
        });

        Ok(())
    }

    async fn readiness_probe(self: Arc<Self>, http: reqwest::Client) {
        const ATTEMPTS: u32 = 30;
        const INTERVAL: Duration = Duration::from_millis(200);

        for _ in 0..ATTEMPTS {
            if self.state() != WorkerState::Starting {
                // Killed, or already moved on, while we were probing.
                return;
            }
            if self.health_check(&http).await {
                tracing::info!(worker_id = self.id, "worker ready");
                self.mark_available();
                return;
            }
            sleep(INTERVAL).await;
        }

        if self.state() == WorkerState::Starting {
            tracing::warn!(worker_id = self.id, "worker failed to become ready");
            self.mark_unhealthy();
        }
    }

    async fn monitor(self: Arc<Self>, mut child: Child, binary_path: Arc<str>, http: reqwest::Client) {
        tokio::select! {
            _ = child.wait() => {}
            _ = self.kill_notify.notified() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }

        let (crashed_session, draining) = {
            let mut inner = self.inner.lock().unwrap();
            inner.state = WorkerState::Dead;
            (inner.session_id.take(), inner.draining)
        };

        tracing::warn!(worker_id = self.id, draining, "worker process exited");

        if let Some(session_id) = crashed_session {
            (self.crash_handler)(session_id);
        }

        if draining {
            return;
        }

        sleep(Duration::from_secs(1)).await;
        if let Err(e) = self.start(binary_path, http).await {
            tracing::error!(worker_id = self.id, error = %e, "worker restart failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_worker() -> (Arc<Worker>, mpsc::Receiver<Arc<Worker>>) {
        let (tx, rx) = mpsc::channel(8);
        let count = Arc::new(AtomicUsize::new(0));
        let handler: CrashHandler = Arc::new(|_| {});
        (Worker::new(1, tx, count, handler), rx)
    }

    #[test]
    fn new_worker_starts_dead() {
        let (w, _rx) = test_worker();
        assert_eq!(w.state(), WorkerState::Dead);
        assert!(!w.is_available());
    }

    #[test]
    fn set_session_noop_unless_available() {
        let (w, _rx) = test_worker();
        // Worker is Dead, not Available: assigning a session must be a no-op.
        w.set_session(Some("abc".to_string()));
        assert_eq!(w.state(), WorkerState::Dead);
        assert_eq!(w.session_id(), None);
    }

    #[test]
    fn release_is_idempotent() {
        let (w, mut rx) = test_worker();
        {
            let mut inner = w.inner.lock().unwrap();
            inner.state = WorkerState::Available;
        }
        w.set_session(Some("s1".to_string()));
        assert_eq!(w.state(), WorkerState::Busy);

        w.release();
        assert_eq!(w.state(), WorkerState::Available);
        assert!(rx.try_recv().is_ok());

        // Releasing again while already Available changes nothing and does
        // not push a second copy into `available`.
        w.release();
        assert_eq!(w.state(), WorkerState::Available);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn drain_is_idempotent() {
        let (w, _rx) = test_worker();
        w.drain();
        w.drain();
        assert!(w.inner.lock().unwrap().draining);
    }

    #[test]
    fn holds_session_matches_only_current_id() {
        let (w, _rx) = test_worker();
        {
            let mut inner = w.inner.lock().unwrap();
            inner.state = WorkerState::Available;
        }
        w.set_session(Some("abc".to_string()));
        assert!(w.holds_session("abc"));
        assert!(!w.holds_session("def"));
    }

    #[tokio::test]
    async fn health_check_reflects_the_fake_workers_status() {
        let fake = crate::test_support::FakeWorker::spawn().await;
        let (tx, _rx) = mpsc::channel(8);
        let w = Worker::new_for_test(1, fake.port, tx, Arc::new(AtomicUsize::new(0)));

        let client = reqwest::Client::new();
        assert!(w.health_check(&client).await);

        fake.set_healthy(false);
        assert!(!w.health_check(&client).await);
    }

    #[tokio::test]
    async fn health_check_fails_against_an_unreachable_port() {
        let port = crate::test_support::unreachable_port().await;
        let (tx, _rx) = mpsc::channel(8);
        let w = Worker::new_for_test(1, port, tx, Arc::new(AtomicUsize::new(0)));

        let client = reqwest::Client::new();
        assert!(!w.health_check(&client).await);
    }
}
