//! Registry error types

use super::key::StreamKey;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Connection asked to leave a stream it never joined
    #[error("Not subscribed to stream {} partition {}!", .0.stream_id(), .0.partition())]
    NotSubscribed(StreamKey),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_subscribed_message() {
        let err = RegistryError::NotSubscribed(StreamKey::new("s1", 4).unwrap());
        assert_eq!(err.to_string(), "Not subscribed to stream s1 partition 4!");
    }
}
