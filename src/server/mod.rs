//! Websocket broker server
//!
//! [`BrokerServer`] accepts websocket clients, negotiates their protocol
//! versions and hands decoded control requests to the [`RequestHandler`].
//! Real-time messages from the network node are fanned out to every
//! connection joined to the message's stream.

pub mod config;
pub mod handler;
pub mod listener;

use std::sync::Arc;

use crate::auth::{AllowAll, NetworkPublisher, PermissionChecker, Publisher};
use crate::network::NetworkNode;
use crate::resend::HistoricalDataSource;

pub use config::ServerConfig;
pub use handler::RequestHandler;
pub use listener::BrokerServer;

/// External services the broker depends on
#[derive(Clone)]
pub struct Collaborators {
    pub network: Arc<dyn NetworkNode>,
    pub permissions: Arc<dyn PermissionChecker>,
    pub publisher: Arc<dyn Publisher>,
    pub historical: Arc<dyn HistoricalDataSource>,
}

impl Collaborators {
    /// Open permissions and direct publishing to `network`
    pub fn permissive(network: Arc<dyn NetworkNode>, historical: Arc<dyn HistoricalDataSource>) -> Self {
        Self {
            publisher: Arc::new(NetworkPublisher::new(Arc::clone(&network))),
            permissions: Arc::new(AllowAll),
            network,
            historical,
        }
    }
}
