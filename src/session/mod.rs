//! Client sessions
//!
//! One [`Connection`] exists per accepted websocket. The request handler and
//! the fan-out path only ever see this handle; socket I/O happens in the
//! server's reader and writer tasks.

pub mod connection;

pub use connection::{BackpressureLimits, Connection, Outbound};
