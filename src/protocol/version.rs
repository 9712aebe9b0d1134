//! Protocol version negotiation
//!
//! Clients pick their control layer and message layer versions with query
//! parameters on the websocket upgrade URL:
//!
//! ```text
//! ws://host:8091/api/v1/ws?controlLayerVersion=2&messageLayerVersion=32
//! ```

use crate::error::NegotiationError;

use super::constants::{
    CONTROL_LAYER_VERSION_PARAM, MAX_CLOSE_REASON_BYTES, MESSAGE_LAYER_VERSION_PARAM,
    SUPPORTED_CONTROL_LAYER_VERSIONS, SUPPORTED_MESSAGE_LAYER_VERSIONS,
};

/// Versions agreed with one client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersions {
    pub control_layer: u32,
    pub message_layer: u32,
}

impl std::fmt::Display for ProtocolVersions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.control_layer, self.message_layer)
    }
}

/// Validate the version parameters of an upgrade request's query string
pub fn negotiate(query: Option<&str>) -> Result<ProtocolVersions, NegotiationError> {
    let query = query.unwrap_or_default();

    let control_layer = single_version(
        query,
        CONTROL_LAYER_VERSION_PARAM,
        SUPPORTED_CONTROL_LAYER_VERSIONS,
    )?;
    let message_layer = single_version(
        query,
        MESSAGE_LAYER_VERSION_PARAM,
        SUPPORTED_MESSAGE_LAYER_VERSIONS,
    )?;

    Ok(ProtocolVersions {
        control_layer,
        message_layer,
    })
}

fn single_version(
    query: &str,
    param: &'static str,
    supported: &'static [u32],
) -> Result<u32, NegotiationError> {
    let mut values = url::form_urlencoded::parse(query.as_bytes())
        .filter(|(name, _)| name == param)
        .map(|(_, value)| value);

    let raw = values.next().ok_or(NegotiationError::Missing(param))?;
    if values.next().is_some() {
        return Err(NegotiationError::Duplicated(param));
    }

    let version: u32 = raw.parse().map_err(|_| NegotiationError::NotANumber {
        param,
        value: raw.to_string(),
    })?;

    if !supported.contains(&version) {
        return Err(NegotiationError::Unsupported {
            param,
            version,
            supported,
        });
    }

    Ok(version)
}

/// Shorten a human readable reason so it fits in a websocket close frame
pub fn close_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return reason.to_string();
    }

    let mut end = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}
