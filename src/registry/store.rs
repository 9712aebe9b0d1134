//! Stream registry implementation
//!
//! The central registry that owns every stream entry and the orphan timers
//! guarding entries that never finish subscribing.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;

use crate::session::Connection;

use super::config::RegistryConfig;
use super::entry::{StreamEntry, StreamState};
use super::key::StreamKey;

struct OrphanTimer {
    /// Distinguishes timers of successive entries under the same key
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct RegistryInner {
    streams: HashMap<StreamKey, StreamEntry>,
    timers: HashMap<StreamKey, OrphanTimer>,
    next_generation: u64,
}

/// Central registry for all stream entries
///
/// All mutation goes through a [`StreamTable`] guard, so a sequence of
/// operations performed on one guard is atomic with respect to other
/// connections.
pub struct StreamRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    config: RegistryConfig,
}

/// Exclusive view of the registry
pub struct StreamTable<'a> {
    inner: MutexGuard<'a, RegistryInner>,
    shared: &'a Arc<Mutex<RegistryInner>>,
    config: &'a RegistryConfig,
}

impl StreamRegistry {
    /// Create a new stream registry with default configuration
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new stream registry with custom configuration
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner::default())),
            config,
        }
    }

    /// Get the registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Lock the registry for a sequence of operations
    pub async fn lock(&self) -> StreamTable<'_> {
        StreamTable {
            inner: self.inner.lock().await,
            shared: &self.inner,
            config: &self.config,
        }
    }

    /// Current state of a stream, if it exists
    pub async fn state(&self, key: &StreamKey) -> Option<StreamState> {
        self.lock().await.get(key).map(StreamEntry::state)
    }

    /// Snapshot of the connections joined to a stream
    pub async fn connections(&self, key: &StreamKey) -> Option<Vec<Arc<Connection>>> {
        self.lock()
            .await
            .get(key)
            .map(|entry| entry.connections().to_vec())
    }

    /// Delete a stream and cancel its orphan timer; no-op if absent
    pub async fn delete(&self, key: &StreamKey) {
        self.lock().await.delete(key);
    }

    /// Get total number of streams
    pub async fn stream_count(&self) -> usize {
        self.inner.lock().await.streams.len()
    }

    /// Number of orphan timers still pending
    pub async fn pending_timers(&self) -> usize {
        self.inner.lock().await.timers.len()
    }

    /// Cancel every pending orphan timer and drop all entries
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        let timers = inner.timers.len();
        for (_, timer) in inner.timers.drain() {
            timer.handle.abort();
        }
        let streams = inner.streams.len();
        inner.streams.clear();

        tracing::debug!(timers, streams, "Stream registry closed");
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTable<'_> {
    /// Get a stream entry
    pub fn get(&self, key: &StreamKey) -> Option<&StreamEntry> {
        self.inner.streams.get(key)
    }

    /// Get a mutable stream entry
    pub fn get_mut(&mut self, key: &StreamKey) -> Option<&mut StreamEntry> {
        self.inner.streams.get_mut(key)
    }

    /// Return the existing entry or create one in `Init` state
    ///
    /// A newly created entry gets an orphan timer: if it has not reached
    /// `Subscribed` when the timer fires, it is deleted.
    pub fn get_or_create(&mut self, key: &StreamKey, name: Option<&str>) -> &mut StreamEntry {
        let RegistryInner {
            streams,
            timers,
            next_generation,
        } = &mut *self.inner;

        match streams.entry(key.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(vacant) => {
                *next_generation += 1;
                let generation = *next_generation;
                let handle = spawn_orphan_timer(
                    Arc::downgrade(self.shared),
                    key.clone(),
                    generation,
                    self.config,
                );
                if let Some(previous) = timers.insert(key.clone(), OrphanTimer { generation, handle }) {
                    previous.handle.abort();
                }

                tracing::debug!(stream = %key, "Stream created");
                vacant.insert(StreamEntry::new(key.clone(), name))
            }
        }
    }

    /// Remove an entry and cancel its orphan timer
    pub fn delete(&mut self, key: &StreamKey) -> Option<StreamEntry> {
        if let Some(timer) = self.inner.timers.remove(key) {
            timer.handle.abort();
        }

        let removed = self.inner.streams.remove(key);
        if removed.is_some() {
            tracing::debug!(stream = %key, "Stream deleted");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.streams.is_empty()
    }
}

fn spawn_orphan_timer(
    registry: Weak<Mutex<RegistryInner>>,
    key: StreamKey,
    generation: u64,
    config: &RegistryConfig,
) -> JoinHandle<()> {
    let timeout = config.orphan_timeout;

    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;

        let Some(registry) = registry.upgrade() else {
            return;
        };
        let mut inner = registry.lock().await;

        match inner.timers.get(&key) {
            Some(timer) if timer.generation == generation => {}
            _ => return,
        }
        inner.timers.remove(&key);

        let orphaned = inner
            .streams
            .get(&key)
            .is_some_and(|entry| !entry.is_subscribed());

        if orphaned {
            inner.streams.remove(&key);
            tracing::info!(
                stream = %key,
                timeout_secs = timeout.as_secs(),
                "Stream removed after never subscribing"
            );
        }
    })
}
