//! Resend windows

use crate::error::ProtocolError;
use crate::protocol::constants::{MAX_SEQUENCE_NUMBER_VALUE, MIN_SEQUENCE_NUMBER_VALUE};
use crate::protocol::{MessageRef, ResendFromRequest, ResendLastRequest, ResendRangeRequest};
use crate::registry::StreamKey;

/// Fully resolved message position
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Position {
    pub timestamp: i64,
    pub sequence_number: i64,
}

impl Position {
    pub fn new(timestamp: i64, sequence_number: i64) -> Self {
        Self {
            timestamp,
            sequence_number,
        }
    }

    fn from_ref(msg_ref: &MessageRef, default_sequence: i64) -> Self {
        Self::new(
            msg_ref.timestamp,
            msg_ref.sequence_number.unwrap_or(default_sequence),
        )
    }
}

/// Which slice of history to fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResendWindow {
    /// The newest `count` messages
    Last { count: u64 },
    /// Everything at or after `from`
    From {
        from: Position,
        publisher_id: Option<String>,
        msg_chain_id: Option<String>,
    },
    /// Everything between `from` and `to`, both inclusive
    Range {
        from: Position,
        to: Position,
        publisher_id: Option<String>,
        msg_chain_id: Option<String>,
    },
}

impl ResendWindow {
    /// Storage endpoint name of this window
    pub fn endpoint(&self) -> &'static str {
        match self {
            ResendWindow::Last { .. } => "last",
            ResendWindow::From { .. } => "from",
            ResendWindow::Range { .. } => "range",
        }
    }

    /// Whether a message at `position` from `publisher_id`/`msg_chain_id` falls inside
    ///
    /// `Last` windows are positional and always match.
    pub fn contains(&self, position: Position, publisher_id: &str, msg_chain_id: &str) -> bool {
        let matches_chain = |publisher: &Option<String>, chain: &Option<String>| {
            publisher.as_deref().map_or(true, |p| p == publisher_id)
                && chain.as_deref().map_or(true, |c| c == msg_chain_id)
        };

        match self {
            ResendWindow::Last { .. } => true,
            ResendWindow::From {
                from,
                publisher_id,
                msg_chain_id,
            } => position >= *from && matches_chain(publisher_id, msg_chain_id),
            ResendWindow::Range {
                from,
                to,
                publisher_id,
                msg_chain_id,
            } => {
                position >= *from && position <= *to && matches_chain(publisher_id, msg_chain_id)
            }
        }
    }
}

/// One historical data request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResendQuery {
    pub key: StreamKey,
    pub window: ResendWindow,
    pub session_token: Option<String>,
}

impl TryFrom<&ResendLastRequest> for ResendQuery {
    type Error = ProtocolError;

    fn try_from(request: &ResendLastRequest) -> Result<Self, ProtocolError> {
        Ok(Self {
            key: StreamKey::new(request.stream_id.clone(), request.stream_partition)?,
            window: ResendWindow::Last {
                count: request.number_last,
            },
            session_token: request.session_token.clone(),
        })
    }
}

impl TryFrom<&ResendFromRequest> for ResendQuery {
    type Error = ProtocolError;

    fn try_from(request: &ResendFromRequest) -> Result<Self, ProtocolError> {
        Ok(Self {
            key: StreamKey::new(request.stream_id.clone(), request.stream_partition)?,
            window: ResendWindow::From {
                from: Position::from_ref(&request.from_msg_ref, MIN_SEQUENCE_NUMBER_VALUE),
                publisher_id: request.publisher_id.clone(),
                msg_chain_id: request.msg_chain_id.clone(),
            },
            session_token: request.session_token.clone(),
        })
    }
}

impl TryFrom<&ResendRangeRequest> for ResendQuery {
    type Error = ProtocolError;

    fn try_from(request: &ResendRangeRequest) -> Result<Self, ProtocolError> {
        Ok(Self {
            key: StreamKey::new(request.stream_id.clone(), request.stream_partition)?,
            window: ResendWindow::Range {
                from: Position::from_ref(&request.from_msg_ref, MIN_SEQUENCE_NUMBER_VALUE),
                to: Position::from_ref(&request.to_msg_ref, MAX_SEQUENCE_NUMBER_VALUE),
                publisher_id: request.publisher_id.clone(),
                msg_chain_id: request.msg_chain_id.clone(),
            },
            session_token: request.session_token.clone(),
        })
    }
}

impl ResendQuery {
    /// A `Last` window of zero messages never needs storage
    pub fn is_trivially_empty(&self) -> bool {
        matches!(self.window, ResendWindow::Last { count: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_number_defaults() {
        let request = ResendRangeRequest {
            request_id: "r1".into(),
            stream_id: "s1".into(),
            stream_partition: 2,
            from_msg_ref: MessageRef {
                timestamp: 10,
                sequence_number: None,
            },
            to_msg_ref: MessageRef {
                timestamp: 20,
                sequence_number: None,
            },
            publisher_id: None,
            msg_chain_id: None,
            session_token: None,
        };

        let query = ResendQuery::try_from(&request).unwrap();
        assert_eq!(query.key, StreamKey::new("s1", 2).unwrap());
        assert_eq!(
            query.window,
            ResendWindow::Range {
                from: Position::new(10, 0),
                to: Position::new(20, 2_147_483_647),
                publisher_id: None,
                msg_chain_id: None,
            }
        );
        assert_eq!(query.window.endpoint(), "range");
    }

    #[test]
    fn test_window_contains() {
        let window = ResendWindow::Range {
            from: Position::new(10, 5),
            to: Position::new(20, 0),
            publisher_id: Some("pub".into()),
            msg_chain_id: None,
        };

        assert!(window.contains(Position::new(10, 5), "pub", "any"));
        assert!(window.contains(Position::new(20, 0), "pub", "any"));
        assert!(!window.contains(Position::new(10, 4), "pub", "any"));
        assert!(!window.contains(Position::new(20, 1), "pub", "any"));
        assert!(!window.contains(Position::new(15, 0), "other", "any"));
    }

    #[test]
    fn test_zero_last_is_empty() {
        let request = ResendLastRequest {
            request_id: "r1".into(),
            stream_id: "s1".into(),
            stream_partition: 0,
            number_last: 0,
            session_token: None,
        };
        assert!(ResendQuery::try_from(&request).unwrap().is_trivially_empty());
    }
}
