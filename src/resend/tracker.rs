//! Per-connection resend tracking

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

use super::session::ResendHandle;

/// Ongoing resends grouped by connection id
#[derive(Debug, Default)]
pub struct ResendTracker {
    sessions: Mutex<HashMap<String, Vec<ResendHandle>>>,
    next_id: AtomicU64,
}

impl ResendTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a session id
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub async fn add(&self, connection_id: &str, handle: ResendHandle) {
        self.sessions
            .lock()
            .await
            .entry(connection_id.to_string())
            .or_default()
            .push(handle);
    }

    /// Stop tracking a session; no-op if already gone
    pub async fn remove(&self, connection_id: &str, session_id: u64) {
        let mut sessions = self.sessions.lock().await;
        if let Some(handles) = sessions.get_mut(connection_id) {
            handles.retain(|h| h.id() != session_id);
            if handles.is_empty() {
                sessions.remove(connection_id);
            }
        }
    }

    /// Abort and forget every session of a connection, returning how many there were
    pub async fn abort_connection(&self, connection_id: &str) -> usize {
        let handles = self
            .sessions
            .lock()
            .await
            .remove(connection_id)
            .unwrap_or_default();

        for handle in &handles {
            handle.abort();
        }
        handles.len()
    }

    /// Abort every tracked session
    pub async fn abort_all(&self) -> usize {
        let drained: Vec<_> = self.sessions.lock().await.drain().collect();
        let mut count = 0;
        for (_, handles) in drained {
            for handle in handles {
                handle.abort();
                count += 1;
            }
        }
        count
    }

    pub async fn count(&self, connection_id: &str) -> usize {
        self.sessions
            .lock()
            .await
            .get(connection_id)
            .map_or(0, Vec::len)
    }

    pub async fn total(&self) -> usize {
        self.sessions.lock().await.values().map(Vec::len).sum()
    }
}
