//! Stream entry and state types
//!
//! This module defines the per-stream state stored in the registry.

use std::sync::Arc;
use std::time::Instant;

use crate::session::Connection;

use super::key::StreamKey;

/// Subscription state of a stream entry
///
/// Moves forward only; a stream that has to start over is deleted and
/// created again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, no upstream subscription requested yet
    Init,
    /// Upstream subscription in progress
    Subscribing,
    /// Upstream subscription active
    Subscribed,
}

/// Entry for a single stream partition in the registry
pub struct StreamEntry {
    key: StreamKey,

    /// Display name, defaults to the stream id
    name: String,

    state: StreamState,

    /// Connections that receive real-time messages for this stream
    connections: Vec<Arc<Connection>>,

    /// When the entry was created
    created_at: Instant,
}

impl StreamEntry {
    /// Create a new stream entry in `Init` state
    pub(super) fn new(key: StreamKey, name: Option<&str>) -> Self {
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| key.stream_id().to_string());

        Self {
            key,
            name,
            state: StreamState::Init,
            connections: Vec::new(),
            created_at: Instant::now(),
        }
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_subscribing(&self) -> bool {
        self.state == StreamState::Subscribing
    }

    pub fn is_subscribed(&self) -> bool {
        self.state == StreamState::Subscribed
    }

    /// Move from `Init` to `Subscribing`
    pub fn set_subscribing(&mut self) {
        if self.state == StreamState::Init {
            self.state = StreamState::Subscribing;
        }
    }

    /// Mark the upstream subscription as active
    pub fn set_subscribed(&mut self) {
        self.state = StreamState::Subscribed;
    }

    /// Add a connection to the fan-out set
    ///
    /// Callers must not add the same connection twice.
    pub fn add_connection(&mut self, connection: Arc<Connection>) {
        self.connections.push(connection);
    }

    /// Remove a connection by id, returning whether it was present
    pub fn remove_connection(&mut self, connection_id: &str) -> bool {
        let before = self.connections.len();
        self.connections.retain(|c| c.id() != connection_id);
        self.connections.len() != before
    }

    pub fn has_connection(&self, connection_id: &str) -> bool {
        self.connections.iter().any(|c| c.id() == connection_id)
    }

    pub fn connections(&self) -> &[Arc<Connection>] {
        &self.connections
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Visit every joined connection
    pub fn for_each_connection<F: FnMut(&Arc<Connection>)>(&self, f: F) {
        self.connections.iter().for_each(f);
    }
}

impl std::fmt::Debug for StreamEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEntry")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("connections", &self.connections.len())
            .finish()
    }
}
