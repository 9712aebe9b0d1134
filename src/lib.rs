//! # pubsub-broker
//!
//! A websocket edge broker for a pub/sub stream network. Clients connect over
//! persistent websocket connections and speak a small JSON control protocol to
//! subscribe to stream partitions, publish messages, and request historical
//! ("resend") data that is fetched from storage nodes.
//!
//! ```text
//!   NetworkNode ──► MessageListener ──► StreamRegistry ──► Connection ──► socket
//!        ▲                                   ▲                 │
//!        │ subscribe/unsubscribe             │                 ▼
//!   SubscriptionMultiplexer ◄──────── RequestHandler ◄──── control frames
//!                                            │
//!                                            ▼
//!                                  HistoricalDataSource ──► ResendSession
//! ```
//!
//! Collaborators that live outside the broker (the network node, the
//! permission service, message publishing and storage-node access) are
//! expressed as traits in [`network`], [`auth`] and [`resend`], with in-memory
//! and HTTP implementations provided for tests and simple deployments.
//!
//! The library emits `tracing` events and never installs a global subscriber.

pub mod auth;
pub mod error;
pub mod network;
pub mod protocol;
pub mod registry;
pub mod resend;
pub mod server;
pub mod session;
pub mod stats;
pub mod subscription;

pub use error::{Error, Result};
pub use registry::{RegistryConfig, StreamKey, StreamRegistry};
pub use server::{BrokerServer, Collaborators, ServerConfig};
pub use session::Connection;
pub use subscription::SubscriptionMultiplexer;
