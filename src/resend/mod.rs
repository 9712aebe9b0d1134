//! Historical data ("resend") support
//!
//! ```text
//! ResendLast/From/RangeRequest
//!        │
//!        ▼
//!   ResendQuery ──► HistoricalDataSource::fetch ──► MessageStream
//!                                                      │
//!                              ResendSession ◄─────────┘
//!                              (abort token, backpressure)
//!                                      │
//!                              ResendTracker (per connection)
//! ```

pub mod query;
pub mod session;
pub mod source;
pub mod storage;
pub mod tracker;

pub use query::{Position, ResendQuery, ResendWindow};
pub use session::{ResendHandle, ResendSession};
pub use source::{HistoricalDataSource, InMemoryHistory, MessageStream};
pub use storage::{HttpHistoricalDataSource, StaticStorageNodes, StorageConfig, StorageNodeRegistry};
pub use tracker::ResendTracker;
