//! In-process network node

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::NetworkError;
use crate::protocol::StreamMessage;
use crate::registry::StreamKey;

use super::{MessageListener, NetworkNode};

/// Network node that loops published messages back to its own listeners
///
/// Only keys with an active upstream subscription are delivered, which is
/// what a real node does for traffic it has not subscribed to. Subscribe and
/// unsubscribe calls are counted so tests can check the broker's
/// refcounting.
#[derive(Default)]
pub struct LocalNetworkNode {
    subscribed: RwLock<HashSet<StreamKey>>,
    listeners: std::sync::RwLock<Vec<Arc<dyn MessageListener>>>,
    calls: std::sync::Mutex<CallLog>,
    fail_subscribe: std::sync::atomic::AtomicBool,
}

/// Upstream calls observed by a [`LocalNetworkNode`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallLog {
    pub subscribes: Vec<StreamKey>,
    pub unsubscribes: Vec<StreamKey>,
    pub published: usize,
}

impl LocalNetworkNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following subscribe fail
    pub fn fail_subscribes(&self, fail: bool) {
        self.fail_subscribe
            .store(fail, std::sync::atomic::Ordering::Relaxed);
    }

    pub async fn is_subscribed(&self, key: &StreamKey) -> bool {
        self.subscribed.read().await.contains(key)
    }

    pub fn calls(&self) -> CallLog {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub fn subscribe_count(&self, key: &StreamKey) -> usize {
        self.calls().subscribes.iter().filter(|k| *k == key).count()
    }

    pub fn unsubscribe_count(&self, key: &StreamKey) -> usize {
        self.calls().unsubscribes.iter().filter(|k| *k == key).count()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or_default()
    }

    /// Deliver a message to listeners as if it arrived from the network
    pub async fn deliver(&self, message: StreamMessage) {
        let message = Arc::new(message);
        let listeners = self
            .listeners
            .read()
            .map(|l| l.clone())
            .unwrap_or_default();

        for listener in listeners {
            listener.on_message(Arc::clone(&message)).await;
        }
    }

    fn record(&self, f: impl FnOnce(&mut CallLog)) {
        if let Ok(mut calls) = self.calls.lock() {
            f(&mut calls);
        }
    }
}

#[async_trait]
impl NetworkNode for LocalNetworkNode {
    async fn subscribe(&self, key: &StreamKey) -> Result<(), NetworkError> {
        self.record(|calls| calls.subscribes.push(key.clone()));

        if self.fail_subscribe.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(NetworkError::Subscribe(format!("refused {key}")));
        }

        self.subscribed.write().await.insert(key.clone());
        tracing::debug!(stream = %key, "Upstream subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, key: &StreamKey) -> Result<(), NetworkError> {
        self.record(|calls| calls.unsubscribes.push(key.clone()));
        self.subscribed.write().await.remove(key);
        tracing::debug!(stream = %key, "Upstream unsubscribed");
        Ok(())
    }

    async fn publish(&self, message: StreamMessage) -> Result<(), NetworkError> {
        self.record(|calls| calls.published += 1);

        let key = message
            .key()
            .map_err(|e| NetworkError::Publish(e.to_string()))?;
        if self.is_subscribed(&key).await {
            self.deliver(message).await;
        }
        Ok(())
    }

    fn add_message_listener(&self, listener: Arc<dyn MessageListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener);
        }
    }

    fn remove_message_listener(&self, listener: &Arc<dyn MessageListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.retain(|l| !std::ptr::addr_eq(Arc::as_ptr(l), Arc::as_ptr(listener)));
        }
    }
}
