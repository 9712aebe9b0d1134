//! Network node seam
//!
//! The broker sits on top of a pub/sub network node it does not own. The node
//! is reached through [`NetworkNode`]; real-time messages come back through
//! registered [`MessageListener`]s.

pub mod local;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::NetworkError;
use crate::protocol::StreamMessage;
use crate::registry::StreamKey;

pub use local::LocalNetworkNode;

/// Upstream transport the broker subscribes and publishes through
#[async_trait]
pub trait NetworkNode: Send + Sync {
    /// Ensure an upstream subscription exists; must be idempotent
    async fn subscribe(&self, key: &StreamKey) -> Result<(), NetworkError>;

    /// Drop the upstream subscription
    async fn unsubscribe(&self, key: &StreamKey) -> Result<(), NetworkError>;

    /// Hand a validated message to the network
    async fn publish(&self, message: StreamMessage) -> Result<(), NetworkError>;

    /// Register a callback for every message arriving on a subscribed key
    fn add_message_listener(&self, listener: Arc<dyn MessageListener>);

    /// Unregister a listener previously passed to
    /// [`add_message_listener`](Self::add_message_listener)
    fn remove_message_listener(&self, listener: &Arc<dyn MessageListener>);
}

/// Receives real-time messages from a [`NetworkNode`]
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, message: Arc<StreamMessage>);
}
