//! Historical data sources

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use crate::error::ResendError;
use crate::protocol::StreamMessage;
use crate::registry::StreamKey;

use super::query::{Position, ResendQuery, ResendWindow};

/// Stream of historical messages in source order
pub type MessageStream = BoxStream<'static, Result<StreamMessage, ResendError>>;

/// Fetches stored messages for a resend window
#[async_trait]
pub trait HistoricalDataSource: Send + Sync {
    /// Open a message stream for `query`
    ///
    /// Failing to reach any storage is reported here; failures while the
    /// stream is being consumed are reported as stream items.
    async fn fetch(&self, query: &ResendQuery) -> Result<MessageStream, ResendError>;
}

/// Message history kept in memory, ordered by timestamp and sequence number
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    messages: RwLock<HashMap<StreamKey, Vec<StreamMessage>>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a message; messages with an empty stream id are ignored
    pub fn store(&self, message: StreamMessage) {
        let Ok(key) = message.key() else {
            return;
        };
        if let Ok(mut messages) = self.messages.write() {
            let list = messages.entry(key).or_default();
            let position = |m: &StreamMessage| Position::new(m.timestamp, m.sequence_number);
            let at = list.partition_point(|m| position(m) <= position(&message));
            list.insert(at, message);
        }
    }

    fn select(&self, query: &ResendQuery) -> Vec<StreamMessage> {
        let Ok(messages) = self.messages.read() else {
            return Vec::new();
        };
        let Some(list) = messages.get(&query.key) else {
            return Vec::new();
        };

        match &query.window {
            ResendWindow::Last { count } => {
                let skip = list.len().saturating_sub(*count as usize);
                list[skip..].to_vec()
            }
            window => list
                .iter()
                .filter(|m| {
                    window.contains(
                        Position::new(m.timestamp, m.sequence_number),
                        &m.publisher_id,
                        &m.msg_chain_id,
                    )
                })
                .cloned()
                .collect(),
        }
    }
}

#[async_trait]
impl HistoricalDataSource for InMemoryHistory {
    async fn fetch(&self, query: &ResendQuery) -> Result<MessageStream, ResendError> {
        let items = self.select(query);
        Ok(stream::iter(items.into_iter().map(Ok)).boxed())
    }
}
