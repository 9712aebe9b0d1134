//! Subscription multiplexer
//!
//! Many connections may join the same stream partition, but the broker holds
//! one upstream subscription per key. The multiplexer counts interest per key
//! and only talks to the network node on the 0→1 and 1→0 transitions.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::NetworkError;
use crate::network::NetworkNode;
use crate::registry::StreamKey;

/// Reference-counting bridge between stream interest and upstream subscriptions
pub struct SubscriptionMultiplexer {
    network: Arc<dyn NetworkNode>,
    counters: Mutex<HashMap<StreamKey, usize>>,
}

impl SubscriptionMultiplexer {
    pub fn new(network: Arc<dyn NetworkNode>) -> Self {
        Self {
            network,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Register one unit of interest in `key`
    ///
    /// The counter only moves when the upstream subscription succeeded, so a
    /// failed first subscribe leaves no interest behind.
    pub async fn subscribe(&self, key: &StreamKey) -> Result<(), NetworkError> {
        let mut counters = self.counters.lock().await;
        let count = counters.get(key).copied().unwrap_or(0);

        if count == 0 {
            self.network.subscribe(key).await?;
            tracing::debug!(stream = %key, "Upstream subscription created");
        }

        counters.insert(key.clone(), count + 1);
        Ok(())
    }

    /// Release one unit of interest in `key`
    pub async fn unsubscribe(&self, key: &StreamKey) -> Result<(), NetworkError> {
        let mut counters = self.counters.lock().await;
        let count = counters.get(key).copied().unwrap_or(0);

        if count > 1 {
            counters.insert(key.clone(), count - 1);
            return Ok(());
        }

        counters.remove(key);
        drop(counters);

        if count == 0 {
            tracing::debug!(stream = %key, "Unsubscribe without interest ignored");
            return Ok(());
        }

        tracing::debug!(stream = %key, "Upstream subscription released");
        self.network.unsubscribe(key).await
    }

    /// Current interest count for `key`
    pub async fn interest(&self, key: &StreamKey) -> usize {
        self.counters.lock().await.get(key).copied().unwrap_or(0)
    }

    pub async fn key_count(&self) -> usize {
        self.counters.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LocalNetworkNode;

    fn setup() -> (Arc<LocalNetworkNode>, SubscriptionMultiplexer) {
        let node = Arc::new(LocalNetworkNode::new());
        let mux = SubscriptionMultiplexer::new(node.clone());
        (node, mux)
    }

    #[tokio::test]
    async fn test_refcount_symmetry() {
        let (node, mux) = setup();
        let key = StreamKey::new("s1", 0).unwrap();

        mux.subscribe(&key).await.unwrap();
        mux.subscribe(&key).await.unwrap();
        assert_eq!(node.subscribe_count(&key), 1);
        assert_eq!(mux.interest(&key).await, 2);

        mux.unsubscribe(&key).await.unwrap();
        assert_eq!(node.unsubscribe_count(&key), 0);

        mux.unsubscribe(&key).await.unwrap();
        assert_eq!(node.unsubscribe_count(&key), 1);
        assert_eq!(mux.key_count().await, 0);

        // Second 0→1 transition subscribes again
        mux.subscribe(&key).await.unwrap();
        assert_eq!(node.subscribe_count(&key), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_without_interest() {
        let (node, mux) = setup();
        let key = StreamKey::new("s1", 0).unwrap();

        mux.unsubscribe(&key).await.unwrap();
        assert_eq!(node.unsubscribe_count(&key), 0);
        assert_eq!(mux.interest(&key).await, 0);
    }

    #[tokio::test]
    async fn test_failed_subscribe_leaves_no_interest() {
        let (node, mux) = setup();
        let key = StreamKey::new("s1", 0).unwrap();

        node.fail_subscribes(true);
        assert!(mux.subscribe(&key).await.is_err());
        assert_eq!(mux.interest(&key).await, 0);

        node.fail_subscribes(false);
        mux.subscribe(&key).await.unwrap();
        assert_eq!(mux.interest(&key).await, 1);
        assert_eq!(node.subscribe_count(&key), 2);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (node, mux) = setup();
        let a = StreamKey::new("s1", 0).unwrap();
        let b = StreamKey::new("s1", 1).unwrap();

        mux.subscribe(&a).await.unwrap();
        mux.subscribe(&b).await.unwrap();
        mux.unsubscribe(&a).await.unwrap();

        assert_eq!(node.unsubscribe_count(&a), 1);
        assert_eq!(node.unsubscribe_count(&b), 0);
        assert_eq!(mux.interest(&b).await, 1);
    }
}
