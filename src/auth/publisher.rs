//! Publish hand-off

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::error::PublishError;
use crate::network::NetworkNode;
use crate::protocol::StreamMessage;

/// How far into the future a message timestamp may lie
pub const DEFAULT_FUTURE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Validates messages and hands them to the network
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn validate_and_publish(&self, message: StreamMessage) -> Result<(), PublishError>;
}

/// Publisher that validates locally and publishes through a [`NetworkNode`]
pub struct NetworkPublisher {
    network: Arc<dyn NetworkNode>,
    future_threshold: Duration,
}

impl NetworkPublisher {
    pub fn new(network: Arc<dyn NetworkNode>) -> Self {
        Self {
            network,
            future_threshold: DEFAULT_FUTURE_THRESHOLD,
        }
    }

    pub fn future_threshold(mut self, threshold: Duration) -> Self {
        self.future_threshold = threshold;
        self
    }

    fn validate(&self, message: &StreamMessage, now_ms: i64) -> Result<(), PublishError> {
        if message.stream_id.is_empty() {
            return Err(PublishError::Validation("streamId must not be empty".into()));
        }

        let limit = now_ms.saturating_add(self.future_threshold.as_millis() as i64);
        if message.timestamp > limit {
            return Err(PublishError::FutureTimestamp(format!(
                "Future timestamps are not allowed, max allowed +{} ms",
                self.future_threshold.as_millis()
            )));
        }

        Ok(())
    }
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[async_trait]
impl Publisher for NetworkPublisher {
    async fn validate_and_publish(&self, message: StreamMessage) -> Result<(), PublishError> {
        self.validate(&message, unix_millis())?;
        self.network.publish(message).await?;
        Ok(())
    }
}
