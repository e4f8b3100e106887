//! The session_id -> Worker mapping and its idle-timeout sweeper.
//!
//! Backed by a `DashMap` so `Get` (which bumps `last_accessed`) doesn't
//! contend with unrelated sessions. The sweeper runs a two-phase eviction:
//! decide what's expired and remove it from the map first, then forward the
//! `DELETE` and release each worker outside of any lock, so a slow or wedged
//! worker can't stall the sweep of every other session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::time::interval;

use crate::forwarder::Forwarder;
use crate::worker::Worker;

struct SessionEntry {
    worker: Arc<Worker>,
    last_accessed: Instant,
}

pub struct SessionManager {
    sessions: DashMap<String, SessionEntry>,
}

impl SessionManager {
    pub fn new() -> Self {
        SessionManager {
            sessions: DashMap::new(),
        }
    }

    pub fn add(&self, session_id: String, worker: Arc<Worker>) {
        self.sessions.insert(
            session_id,
            SessionEntry {
                worker,
                last_accessed: Instant::now(),
            },
        );
    }

    /// Looks up the worker for a session, bumping its last-accessed time.
    pub fn get(&self, session_id: &str) -> Option<Arc<Worker>> {
        self.sessions.get_mut(session_id).map(|mut entry| {
            entry.last_accessed = Instant::now();
            Arc::clone(&entry.worker)
        })
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<Worker>> {
        self.sessions.remove(session_id).map(|(_, entry)| entry.worker)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the background sweeper that evicts sessions idle longer than `ttl`.
pub fn spawn_ttl_sweeper(manager: Arc<SessionManager>, forwarder: Arc<Forwarder>, ttl: Duration) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;

            let now = Instant::now();
            // Candidate ids are a plain snapshot; the actual eviction below
            // re-checks staleness under each shard's lock via `remove_if`,
            // so a `Get` that refreshes a candidate between the snapshot and
            // the removal wins the race instead of being silently discarded.
            let candidates: Vec<String> = manager
                .sessions
                .iter()
                .filter(|entry| now.duration_since(entry.last_accessed) > ttl)
                .map(|entry| entry.key().clone())
                .collect();

            let expired: Vec<(String, Arc<Worker>)> = candidates
                .into_iter()
                .filter_map(|session_id| {
                    manager
                        .sessions
                        .remove_if(&session_id, |_, entry| now.duration_since(entry.last_accessed) > ttl)
                        .map(|(id, entry)| (id, entry.worker))
                })
                .collect();

            for (session_id, worker) in expired {
                tracing::info!(session_id = %session_id, worker_id = worker.id, "session idle timeout");
                let _ = forwarder.delete_session(&worker, &session_id).await;
                worker.release();
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn test_worker(id: u64) -> Arc<Worker> {
        let (tx, _rx) = mpsc::channel(8);
        Worker::new(id, tx, Arc::new(AtomicUsize::new(0)), Arc::new(|_| {}))
    }

    #[test]
    fn add_then_get_returns_same_worker() {
        let manager = SessionManager::new();
        let worker = test_worker(1);
        manager.add("s1".to_string(), Arc::clone(&worker));
        let found = manager.get("s1").unwrap();
        assert_eq!(found.id, worker.id);
        assert_eq!(manager.count(), 1);
    }

    #[test]
    fn remove_deletes_the_mapping() {
        let manager = SessionManager::new();
        manager.add("s1".to_string(), test_worker(1));
        assert!(manager.remove("s1").is_some());
        assert!(manager.get("s1").is_none());
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn get_on_unknown_session_returns_none() {
        let manager = SessionManager::new();
        assert!(manager.get("missing").is_none());
    }

    #[tokio::test]
    async fn refreshed_sessions_survive_the_sweep_while_idle_ones_are_evicted() {
        let fake = crate::test_support::FakeWorker::spawn().await;
        let (tx, _rx) = mpsc::channel(8);
        let count = Arc::new(AtomicUsize::new(0));
        let worker = Worker::new_for_test(1, fake.port, tx, Arc::clone(&count));
        worker.set_session(Some("stays".to_string()));
        worker.set_session(Some("evicted".to_string())); // no-op: already Busy

        let manager = Arc::new(SessionManager::new());
        manager.add("stays".to_string(), Arc::clone(&worker));

        let other_worker = Worker::new_for_test(2, fake.port, mpsc::channel(8).0, Arc::new(AtomicUsize::new(0)));
        other_worker.set_session(Some("evicted".to_string()));
        manager.add("evicted".to_string(), Arc::clone(&other_worker));

        let forwarder = Arc::new(Forwarder::new(std::time::Duration::from_secs(1)));
        let ttl = Duration::from_millis(120);
        spawn_ttl_sweeper(Arc::clone(&manager), forwarder, ttl);

        // Keep "stays" alive by refreshing it faster than the TTL, while
        // never touching "evicted".
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(80)).await;
            manager.get("stays");
        }

        assert!(manager.get("stays").is_some());
        assert!(manager.get("evicted").is_none());
        assert!(other_worker.is_available());
        assert!(!other_worker.holds_session("evicted"));
    }
}
