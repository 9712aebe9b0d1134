//! JSON frame codec
//!
//! Decoding is done in two passes: the frame is first parsed into a generic
//! JSON object so the `requestId` and `type` can be recovered even when the
//! rest of the request is invalid, then deserialized into [`ControlRequest`].

use serde::Serialize;
use serde_json::Value;

use crate::error::ProtocolError;

use super::message::{ControlRequest, ControlResponse};

#[derive(Serialize)]
struct Envelope<'a> {
    version: u32,
    #[serde(flatten)]
    body: &'a ControlResponse,
}

/// Decode one inbound text frame
pub fn decode_request(text: &str) -> Result<ControlRequest, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let object = value
        .as_object()
        .ok_or_else(|| ProtocolError::Malformed("expected a JSON object".into()))?;

    let request_id = object
        .get("requestId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let request_type = match object.get("type").and_then(Value::as_str) {
        Some(t) => t.to_string(),
        None => {
            return Err(ProtocolError::InvalidField {
                request_id,
                request_type: "unknown".into(),
                reason: "missing type".into(),
            })
        }
    };

    if !ControlRequest::TYPE_NAMES.contains(&request_type.as_str()) {
        return Err(ProtocolError::UnknownType {
            request_id,
            request_type,
        });
    }

    let request: ControlRequest =
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidField {
            request_id: request_id.clone(),
            request_type: request_type.clone(),
            reason: e.to_string(),
        })?;

    if request.stream_id().is_empty() {
        return Err(ProtocolError::InvalidField {
            request_id,
            request_type,
            reason: ProtocolError::EmptyStreamId.to_string(),
        });
    }

    Ok(request)
}

/// Encode one outbound frame, stamped with the connection's control layer version
pub fn encode_response(response: &ControlResponse, version: u32) -> serde_json::Result<String> {
    serde_json::to_string(&Envelope {
        version,
        body: response,
    })
}
