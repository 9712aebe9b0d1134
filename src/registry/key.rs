//! Stream partition keys

use crate::error::ProtocolError;

/// Unique identifier for a stream partition (stream id + partition number)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    /// Stream id (e.g., "0xabc/sensors")
    stream_id: String,
    /// Partition number within the stream
    partition: u32,
}

impl StreamKey {
    /// Create a new stream key
    ///
    /// Empty stream ids are rejected, so every key held by the registry is
    /// addressable.
    pub fn new(stream_id: impl Into<String>, partition: u32) -> Result<Self, ProtocolError> {
        let stream_id = stream_id.into();
        if stream_id.is_empty() {
            return Err(ProtocolError::EmptyStreamId);
        }
        Ok(Self {
            stream_id,
            partition,
        })
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.stream_id, self.partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_key() {
        let key = StreamKey::new("s1", 3).unwrap();
        assert_eq!(key.stream_id(), "s1");
        assert_eq!(key.partition(), 3);
        assert_eq!(key.to_string(), "s1#3");
    }

    #[test]
    fn test_empty_stream_id_rejected() {
        assert_eq!(StreamKey::new("", 0), Err(ProtocolError::EmptyStreamId));
    }

    #[test]
    fn test_partitions_are_distinct() {
        assert_ne!(
            StreamKey::new("s1", 0).unwrap(),
            StreamKey::new("s1", 1).unwrap()
        );
    }
}
