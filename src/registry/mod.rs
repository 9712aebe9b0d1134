//! Stream registry for real-time routing
//!
//! The registry tracks every stream partition some connection is interested
//! in, together with the connections that should receive its messages.
//!
//! # Architecture
//!
//! ```text
//!                          Arc<StreamRegistry>
//!                     ┌─────────────────────────┐
//!                     │ streams: HashMap<Key,   │
//!                     │   StreamEntry {         │
//!                     │     state,              │
//!                     │     connections,        │
//!                     │   }                     │
//!                     │ >                       │
//!                     │ timers: HashMap<Key,    │
//!                     │   OrphanTimer>          │
//!                     └───────────┬─────────────┘
//!                                 │
//!         ┌───────────────────────┼───────────────────────┐
//!         │                       │                       │
//!         ▼                       ▼                       ▼
//!   [NetworkNode]          [RequestHandler]         [Orphan timer]
//!   message arrives        subscribe/unsubscribe    deletes entries that
//!         │                joins connections        never got subscribed
//!         └──► connections(key) ──► Connection::send ──► socket
//! ```
//!
//! Messages are `Arc`-shared, so fan-out to many connections only clones a
//! pointer per recipient before serialization.

pub mod config;
pub mod entry;
pub mod error;
pub mod key;
pub mod store;

pub use config::RegistryConfig;
pub use entry::{StreamEntry, StreamState};
pub use error::RegistryError;
pub use key::StreamKey;
pub use store::{StreamRegistry, StreamTable};
