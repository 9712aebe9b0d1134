//! Control protocol message types

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, ProtocolError};
use crate::registry::StreamKey;

/// Position of a message within a stream: timestamp plus sequence number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<i64>,
}

impl MessageRef {
    pub fn new(timestamp: i64, sequence_number: i64) -> Self {
        Self {
            timestamp,
            sequence_number: Some(sequence_number),
        }
    }
}

/// A data message travelling through the network
///
/// The broker only looks at the routing fields; `content` is relayed as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessage {
    pub stream_id: String,
    #[serde(default)]
    pub stream_partition: u32,
    pub timestamp: i64,
    #[serde(default)]
    pub sequence_number: i64,
    #[serde(default)]
    pub publisher_id: String,
    #[serde(default)]
    pub msg_chain_id: String,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl StreamMessage {
    /// Routing key of this message
    pub fn key(&self) -> Result<StreamKey, ProtocolError> {
        StreamKey::new(self.stream_id.clone(), self.stream_partition)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub request_id: String,
    pub stream_id: String,
    #[serde(default)]
    pub stream_partition: u32,
    #[serde(default)]
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    pub request_id: String,
    pub stream_id: String,
    #[serde(default)]
    pub stream_partition: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub request_id: String,
    pub stream_message: StreamMessage,
    #[serde(default)]
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResendLastRequest {
    pub request_id: String,
    pub stream_id: String,
    #[serde(default)]
    pub stream_partition: u32,
    pub number_last: u64,
    #[serde(default)]
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResendFromRequest {
    pub request_id: String,
    pub stream_id: String,
    #[serde(default)]
    pub stream_partition: u32,
    pub from_msg_ref: MessageRef,
    #[serde(default)]
    pub publisher_id: Option<String>,
    #[serde(default)]
    pub msg_chain_id: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResendRangeRequest {
    pub request_id: String,
    pub stream_id: String,
    #[serde(default)]
    pub stream_partition: u32,
    pub from_msg_ref: MessageRef,
    pub to_msg_ref: MessageRef,
    #[serde(default)]
    pub publisher_id: Option<String>,
    #[serde(default)]
    pub msg_chain_id: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
}

/// Inbound control requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlRequest {
    #[serde(rename = "SubscribeRequest")]
    Subscribe(SubscribeRequest),
    #[serde(rename = "UnsubscribeRequest")]
    Unsubscribe(UnsubscribeRequest),
    #[serde(rename = "PublishRequest")]
    Publish(PublishRequest),
    #[serde(rename = "ResendLastRequest")]
    ResendLast(ResendLastRequest),
    #[serde(rename = "ResendFromRequest")]
    ResendFrom(ResendFromRequest),
    #[serde(rename = "ResendRangeRequest")]
    ResendRange(ResendRangeRequest),
}

impl ControlRequest {
    /// Wire names of every known request type
    pub const TYPE_NAMES: &'static [&'static str] = &[
        "SubscribeRequest",
        "UnsubscribeRequest",
        "PublishRequest",
        "ResendLastRequest",
        "ResendFromRequest",
        "ResendRangeRequest",
    ];

    pub fn request_id(&self) -> &str {
        match self {
            ControlRequest::Subscribe(r) => &r.request_id,
            ControlRequest::Unsubscribe(r) => &r.request_id,
            ControlRequest::Publish(r) => &r.request_id,
            ControlRequest::ResendLast(r) => &r.request_id,
            ControlRequest::ResendFrom(r) => &r.request_id,
            ControlRequest::ResendRange(r) => &r.request_id,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ControlRequest::Subscribe(_) => "SubscribeRequest",
            ControlRequest::Unsubscribe(_) => "UnsubscribeRequest",
            ControlRequest::Publish(_) => "PublishRequest",
            ControlRequest::ResendLast(_) => "ResendLastRequest",
            ControlRequest::ResendFrom(_) => "ResendFromRequest",
            ControlRequest::ResendRange(_) => "ResendRangeRequest",
        }
    }

    /// Stream id addressed by the request
    pub fn stream_id(&self) -> &str {
        match self {
            ControlRequest::Subscribe(r) => &r.stream_id,
            ControlRequest::Unsubscribe(r) => &r.stream_id,
            ControlRequest::Publish(r) => &r.stream_message.stream_id,
            ControlRequest::ResendLast(r) => &r.stream_id,
            ControlRequest::ResendFrom(r) => &r.stream_id,
            ControlRequest::ResendRange(r) => &r.stream_id,
        }
    }
}

/// Outbound control responses and data deliveries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ControlResponse {
    SubscribeResponse {
        request_id: String,
        stream_id: String,
        stream_partition: u32,
    },
    UnsubscribeResponse {
        request_id: String,
        stream_id: String,
        stream_partition: u32,
    },
    /// Real-time delivery to a subscribed connection
    BroadcastMessage {
        request_id: String,
        stream_message: Arc<StreamMessage>,
    },
    /// Historical delivery belonging to one resend request
    UnicastMessage {
        request_id: String,
        stream_message: Arc<StreamMessage>,
    },
    ResendResponseResending {
        request_id: String,
        stream_id: String,
        stream_partition: u32,
    },
    ResendResponseResent {
        request_id: String,
        stream_id: String,
        stream_partition: u32,
    },
    ResendResponseNoResend {
        request_id: String,
        stream_id: String,
        stream_partition: u32,
    },
    ErrorResponse {
        request_id: String,
        error_message: String,
        error_code: ErrorCode,
    },
}

impl ControlResponse {
    pub fn error(request_id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        ControlResponse::ErrorResponse {
            request_id: request_id.into(),
            error_message: message.into(),
            error_code: code,
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            ControlResponse::SubscribeResponse { request_id, .. }
            | ControlResponse::UnsubscribeResponse { request_id, .. }
            | ControlResponse::BroadcastMessage { request_id, .. }
            | ControlResponse::UnicastMessage { request_id, .. }
            | ControlResponse::ResendResponseResending { request_id, .. }
            | ControlResponse::ResendResponseResent { request_id, .. }
            | ControlResponse::ResendResponseNoResend { request_id, .. }
            | ControlResponse::ErrorResponse { request_id, .. } => request_id,
        }
    }
}
