//! HTTP access to storage nodes
//!
//! Storage nodes serve history over plain HTTP:
//!
//! ```text
//! GET {base}/streams/{streamId}/data/partitions/{partition}/last?count=N&format=raw
//! GET {base}/streams/{streamId}/data/partitions/{partition}/from?fromTimestamp=..&fromSequenceNumber=..&format=raw
//! GET {base}/streams/{streamId}/data/partitions/{partition}/range?fromTimestamp=..&toTimestamp=..&format=raw
//! ```
//!
//! The raw format is one JSON stream message per line. Candidate nodes are
//! tried in random order until one answers with a success status.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use rand::seq::SliceRandom;
use reqwest::Url;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

use crate::error::ResendError;
use crate::protocol::StreamMessage;

use super::query::{ResendQuery, ResendWindow};
use super::source::{HistoricalDataSource, MessageStream};

/// Configuration for storage node requests
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Timeout of one storage node request, including the body
    pub request_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl StorageConfig {
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Looks up which storage nodes hold a stream
#[async_trait]
pub trait StorageNodeRegistry: Send + Sync {
    async fn storage_node_urls(&self, stream_id: &str) -> Result<Vec<String>, ResendError>;
}

/// Fixed storage node assignment
#[derive(Debug, Clone, Default)]
pub struct StaticStorageNodes {
    default: Vec<String>,
    per_stream: HashMap<String, Vec<String>>,
}

impl StaticStorageNodes {
    /// Every stream is stored on `urls`
    pub fn new<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            default: urls.into_iter().map(Into::into).collect(),
            per_stream: HashMap::new(),
        }
    }

    /// Override the nodes of one stream
    pub fn stream<I, S>(mut self, stream_id: impl Into<String>, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.per_stream
            .insert(stream_id.into(), urls.into_iter().map(Into::into).collect());
        self
    }
}

#[async_trait]
impl StorageNodeRegistry for StaticStorageNodes {
    async fn storage_node_urls(&self, stream_id: &str) -> Result<Vec<String>, ResendError> {
        Ok(self
            .per_stream
            .get(stream_id)
            .unwrap_or(&self.default)
            .clone())
    }
}

/// Historical data source backed by storage node HTTP endpoints
pub struct HttpHistoricalDataSource {
    client: reqwest::Client,
    nodes: Arc<dyn StorageNodeRegistry>,
}

impl HttpHistoricalDataSource {
    pub fn new(nodes: Arc<dyn StorageNodeRegistry>, config: &StorageConfig) -> Result<Self, ResendError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ResendError::Source(e.to_string()))?;

        Ok(Self { client, nodes })
    }
}

#[async_trait]
impl HistoricalDataSource for HttpHistoricalDataSource {
    async fn fetch(&self, query: &ResendQuery) -> Result<MessageStream, ResendError> {
        let stream_id = query.key.stream_id();
        let mut candidates = self.nodes.storage_node_urls(stream_id).await?;
        if candidates.is_empty() {
            return Err(ResendError::NoStorageNodes(stream_id.to_string()));
        }
        candidates.shuffle(&mut rand::thread_rng());

        let mut last_error = String::new();
        for base in &candidates {
            let url = match resend_url(base, query) {
                Ok(url) => url,
                Err(e) => {
                    tracing::warn!(storage_node = %base, error = %e, "Skipping storage node");
                    last_error = e.to_string();
                    continue;
                }
            };

            let mut request = self.client.get(url);
            if let Some(token) = &query.session_token {
                request = request.bearer_auth(token);
            }

            match request.send().await.and_then(|r| r.error_for_status()) {
                Ok(response) => {
                    tracing::debug!(storage_node = %base, stream = %query.key, "Storage node responded");
                    return Ok(decode_body(response));
                }
                Err(e) => {
                    tracing::warn!(storage_node = %base, stream = %query.key, error = %e, "Storage node request failed");
                    last_error = e.to_string();
                }
            }
        }

        Err(ResendError::StorageUnavailable {
            attempted: candidates.len(),
            last_error,
        })
    }
}

/// Build the storage endpoint URL for `query` under `base`
pub fn resend_url(base: &str, query: &ResendQuery) -> Result<Url, ResendError> {
    let invalid = |reason: String| ResendError::InvalidUrl {
        url: base.to_string(),
        reason,
    };

    let mut url = Url::parse(base).map_err(|e| invalid(e.to_string()))?;

    url.path_segments_mut()
        .map_err(|_| invalid("cannot be a base".into()))?
        .pop_if_empty()
        .push("streams")
        .push(query.key.stream_id())
        .push("data")
        .push("partitions")
        .push(&query.key.partition().to_string())
        .push(query.window.endpoint());

    {
        let mut pairs = url.query_pairs_mut();
        match &query.window {
            ResendWindow::Last { count } => {
                pairs.append_pair("count", &count.to_string());
            }
            ResendWindow::From {
                from,
                publisher_id,
                msg_chain_id,
            } => {
                pairs.append_pair("fromTimestamp", &from.timestamp.to_string());
                pairs.append_pair("fromSequenceNumber", &from.sequence_number.to_string());
                if let Some(publisher_id) = publisher_id {
                    pairs.append_pair("publisherId", publisher_id);
                }
                if let Some(msg_chain_id) = msg_chain_id {
                    pairs.append_pair("msgChainId", msg_chain_id);
                }
            }
            ResendWindow::Range {
                from,
                to,
                publisher_id,
                msg_chain_id,
            } => {
                pairs.append_pair("fromTimestamp", &from.timestamp.to_string());
                pairs.append_pair("toTimestamp", &to.timestamp.to_string());
                pairs.append_pair("fromSequenceNumber", &from.sequence_number.to_string());
                pairs.append_pair("toSequenceNumber", &to.sequence_number.to_string());
                if let Some(publisher_id) = publisher_id {
                    pairs.append_pair("publisherId", publisher_id);
                }
                if let Some(msg_chain_id) = msg_chain_id {
                    pairs.append_pair("msgChainId", msg_chain_id);
                }
            }
        }
        pairs.append_pair("format", "raw");
    }

    Ok(url)
}

/// Decode a newline-delimited JSON body as it arrives
fn decode_body(response: reqwest::Response) -> MessageStream {
    let body = response
        .bytes_stream()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e));

    decode_lines(body)
}

/// Decode newline-delimited stream messages from a chunked byte stream
///
/// Chunk boundaries need not line up with message boundaries.
fn decode_lines<S>(body: S) -> MessageStream
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    FramedRead::new(StreamReader::new(body), LinesCodec::new())
        .filter_map(|line| async move {
            match line {
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => Some(
                    serde_json::from_str::<StreamMessage>(&line)
                        .map_err(|e| ResendError::Decode(e.to_string())),
                ),
                Err(e) => Some(Err(ResendError::Source(e.to_string()))),
            }
        })
        .boxed()
}
