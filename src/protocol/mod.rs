//! Control protocol
//!
//! Clients exchange JSON text frames with the broker. Every request carries a
//! `type` tag and a `requestId`; every response echoes the request id and is
//! stamped with the connection's negotiated control-layer version.
//!
//! ```text
//! Client                                         Broker
//!   |-- SubscribeRequest {streamId, partition} ---->|
//!   |<------------------ SubscribeResponse ---------|
//!   |<------------------ BroadcastMessage ... ------|
//!   |-- ResendLastRequest {numberLast: 3} --------->|
//!   |<------------------ ResendResponseResending ---|
//!   |<------------------ UnicastMessage x3 ---------|
//!   |<------------------ ResendResponseResent ------|
//! ```

pub mod codec;
pub mod constants;
pub mod message;
pub mod version;

pub use codec::{decode_request, encode_response};
pub use message::{
    ControlRequest, ControlResponse, MessageRef, PublishRequest, ResendFromRequest,
    ResendLastRequest, ResendRangeRequest, StreamMessage, SubscribeRequest, UnsubscribeRequest,
};
pub use version::{negotiate, ProtocolVersions};
