//! Protocol constants

use std::time::Duration;

/// Control layer versions the broker can speak
pub const SUPPORTED_CONTROL_LAYER_VERSIONS: &[u32] = &[1, 2];

/// Message layer versions the broker can relay
pub const SUPPORTED_MESSAGE_LAYER_VERSIONS: &[u32] = &[30, 31, 32];

/// Query parameter carrying the control layer version
pub const CONTROL_LAYER_VERSION_PARAM: &str = "controlLayerVersion";

/// Query parameter carrying the message layer version
pub const MESSAGE_LAYER_VERSION_PARAM: &str = "messageLayerVersion";

/// Streams under this prefix carry encryption key exchange traffic
pub const KEY_EXCHANGE_STREAM_PREFIX: &str = "SYSTEM/keyexchange/";

/// Lower bound used when a resend reference omits its sequence number
pub const MIN_SEQUENCE_NUMBER_VALUE: i64 = 0;

/// Upper bound used when a resend range end omits its sequence number
pub const MAX_SEQUENCE_NUMBER_VALUE: i64 = 2_147_483_647;

/// Outbound buffer size that raises backpressure
pub const HIGH_BACK_PRESSURE: usize = 2 * 1024 * 1024;

/// Outbound buffer size below which backpressure is released
pub const LOW_BACK_PRESSURE: usize = 1024 * 1024;

/// Websocket close reasons are limited to 123 bytes
pub const MAX_CLOSE_REASON_BYTES: usize = 123;

/// Default websocket endpoint path
pub const DEFAULT_WS_PATH: &str = "/api/v1/ws";

/// Default liveness ping interval
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(60);

/// Default maximum inbound frame size
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Returns true for streams reserved for key exchange
pub fn is_key_exchange_stream(stream_id: &str) -> bool {
    stream_id.starts_with(KEY_EXCHANGE_STREAM_PREFIX)
}
