//! Client connection
//!
//! A [`Connection`] is the broker-side handle of one websocket client. It
//! never touches the socket directly: frames are pushed onto an outbound
//! queue drained by the connection's writer task, which reports every
//! flushed frame back through [`Connection::on_flushed`]. The amount of
//! queued but unflushed data drives the backpressure signal.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::constants::{HIGH_BACK_PRESSURE, LOW_BACK_PRESSURE};
use crate::protocol::{encode_response, ControlResponse, ProtocolVersions};
use crate::registry::StreamKey;
use crate::stats::BrokerStats;

/// Work items for the connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Encoded JSON text frame
    Frame(String),
    /// Liveness ping
    Ping,
    /// Polite close, with an optional reason
    Close(Option<String>),
}

/// Outbound buffer thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressureLimits {
    /// Buffered bytes at which backpressure is raised
    pub high: usize,
    /// Buffered bytes below which backpressure is released
    pub low: usize,
}

impl Default for BackpressureLimits {
    fn default() -> Self {
        Self {
            high: HIGH_BACK_PRESSURE,
            low: LOW_BACK_PRESSURE,
        }
    }
}

/// Broker-side state of one connected client
pub struct Connection {
    id: String,
    versions: ProtocolVersions,
    peer_addr: Option<SocketAddr>,
    connected_at: Instant,

    outbound: mpsc::UnboundedSender<Outbound>,
    terminate: CancellationToken,

    dead: AtomicBool,
    liveness_acked: AtomicBool,

    buffered: AtomicUsize,
    limits: BackpressureLimits,
    backpressure: watch::Sender<bool>,

    /// Streams this connection has joined
    streams: Mutex<Vec<StreamKey>>,

    stats: Arc<BrokerStats>,
}

impl Connection {
    /// Create a connection and the receiving end of its outbound queue
    pub fn new(
        versions: ProtocolVersions,
        peer_addr: Option<SocketAddr>,
        limits: BackpressureLimits,
        stats: Arc<BrokerStats>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let (backpressure, _) = watch::channel(false);

        let connection = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            versions,
            peer_addr,
            connected_at: Instant::now(),
            outbound,
            terminate: CancellationToken::new(),
            dead: AtomicBool::new(false),
            liveness_acked: AtomicBool::new(true),
            buffered: AtomicUsize::new(0),
            limits,
            backpressure,
            streams: Mutex::new(Vec::new()),
            stats,
        });

        (connection, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn versions(&self) -> ProtocolVersions {
        self.versions
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Serialize a response and queue it for the writer
    ///
    /// A failed hand-off to the writer force-closes the connection. Nothing
    /// is queued once the connection is dead.
    pub fn send(&self, response: &ControlResponse) -> Result<()> {
        if self.is_dead() {
            return Err(Error::ConnectionClosed(self.id.clone()));
        }

        let frame = encode_response(response, self.versions.control_layer)?;
        let len = frame.len();

        let buffered = self.buffered.fetch_add(len, Ordering::AcqRel) + len;

        if self.outbound.send(Outbound::Frame(frame)).is_err() {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            self.force_close("Failed to send message: connection writer is gone");
            return Err(Error::ConnectionClosed(self.id.clone()));
        }

        self.stats.record_outbound(len);

        if buffered >= self.limits.high && !*self.backpressure.borrow() {
            tracing::debug!(connection_id = %self.id, buffered, "High backpressure");
            self.backpressure.send_replace(true);
        }

        Ok(())
    }

    /// Called by the writer after a frame of `len` bytes reached the socket
    pub fn on_flushed(&self, len: usize) {
        let previous = self
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(len))
            })
            .unwrap_or_default();
        let buffered = previous.saturating_sub(len);

        if buffered < self.limits.low && *self.backpressure.borrow() {
            tracing::debug!(connection_id = %self.id, buffered, "Backpressure released");
            self.backpressure.send_replace(false);
        }
    }

    /// Bytes queued but not yet written to the socket
    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// Watch the backpressure signal; `true` while the buffer is above the high mark
    pub fn backpressure(&self) -> watch::Receiver<bool> {
        self.backpressure.subscribe()
    }

    pub fn is_backpressured(&self) -> bool {
        *self.backpressure.borrow()
    }

    /// Graceful close
    pub fn close(&self) {
        // Writer may already be gone
        let _ = self.outbound.send(Outbound::Close(None));
        self.dead.store(true, Ordering::Release);
        self.clear_streams();

        tracing::debug!(connection_id = %self.id, "Connection closed");
    }

    /// Terminate the connection without a closing handshake
    pub fn force_close(&self, reason: &str) {
        self.dead.store(true, Ordering::Release);
        self.terminate.cancel();

        tracing::warn!(connection_id = %self.id, reason, "Connection force closed");
    }

    /// Resolves once [`force_close`](Self::force_close) has been called
    pub async fn terminated(&self) {
        self.terminate.cancelled().await
    }

    /// Send a liveness ping
    pub fn ping(&self) -> Result<()> {
        self.outbound
            .send(Outbound::Ping)
            .map_err(|_| Error::ConnectionClosed(self.id.clone()))
    }

    pub fn is_liveness_acked(&self) -> bool {
        self.liveness_acked.load(Ordering::Acquire)
    }

    pub fn set_liveness_acked(&self, acked: bool) {
        self.liveness_acked.store(acked, Ordering::Release);
    }

    /// Record a pong from the client
    pub fn mark_liveness_acked(&self) {
        self.set_liveness_acked(true);
    }

    /// Join a stream; joining twice is a no-op
    pub fn add_stream(&self, key: StreamKey) {
        if let Ok(mut streams) = self.streams.lock() {
            if !streams.contains(&key) {
                streams.push(key);
            }
        }
    }

    /// Leave a stream; no-op if not joined
    pub fn remove_stream(&self, key: &StreamKey) {
        if let Ok(mut streams) = self.streams.lock() {
            streams.retain(|k| k != key);
        }
    }

    /// Snapshot of the joined streams
    pub fn streams(&self) -> Vec<StreamKey> {
        self.streams
            .lock()
            .map(|streams| streams.clone())
            .unwrap_or_default()
    }

    pub fn for_each_stream<F: FnMut(&StreamKey)>(&self, f: F) {
        self.streams().iter().for_each(f);
    }

    pub fn streams_as_string(&self) -> Vec<String> {
        self.streams().iter().map(ToString::to_string).collect()
    }

    fn clear_streams(&self) {
        if let Ok(mut streams) = self.streams.lock() {
            streams.clear();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("versions", &self.versions)
            .field("dead", &self.is_dead())
            .field("streams", &self.streams_as_string())
            .finish()
    }
}

/// Connection speaking the newest protocol versions, for tests
#[cfg(test)]
pub(crate) fn test_connection() -> (Arc<Connection>, mpsc::UnboundedReceiver<Outbound>) {
    Connection::new(
        ProtocolVersions {
            control_layer: 2,
            message_layer: 32,
        },
        None,
        BackpressureLimits::default(),
        Arc::new(BrokerStats::new()),
    )
}

/// Drain every queued frame as JSON, skipping pings and closes
#[cfg(test)]
pub(crate) fn received_frames(
    rx: &mut mpsc::UnboundedReceiver<Outbound>,
) -> Vec<serde_json::Value> {
    let mut frames = Vec::new();
    while let Ok(item) = rx.try_recv() {
        if let Outbound::Frame(text) = item {
            frames.push(serde_json::from_str(&text).unwrap());
        }
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscribe_response(id: &str) -> ControlResponse {
        ControlResponse::SubscribeResponse {
            request_id: id.into(),
            stream_id: "s1".into(),
            stream_partition: 0,
        }
    }

    #[test]
    fn test_send_encodes_with_version() {
        let (conn, mut rx) = test_connection();
        conn.send(&subscribe_response("r1")).unwrap();

        let frames = received_frames(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["version"], 2);
        assert_eq!(frames[0]["type"], "SubscribeResponse");
        assert_eq!(frames[0]["requestId"], "r1");
    }

    #[test]
    fn test_send_failure_force_closes() {
        let (conn, rx) = test_connection();
        drop(rx);

        assert!(conn.send(&subscribe_response("r1")).is_err());
        assert!(conn.is_dead());
        assert_eq!(conn.buffered_bytes(), 0);
    }

    #[test]
    fn test_send_after_force_close() {
        let (conn, mut rx) = test_connection();
        conn.force_close("liveness");

        assert!(matches!(
            conn.send(&subscribe_response("r1")),
            Err(Error::ConnectionClosed(_))
        ));
        assert!(rx.try_recv().is_err());
        assert_eq!(conn.buffered_bytes(), 0);
        assert_eq!(conn.stats.snapshot().out_messages, 0);
    }

    #[test]
    fn test_backpressure_is_level_triggered() {
        let (conn, _rx) = Connection::new(
            ProtocolVersions {
                control_layer: 2,
                message_layer: 32,
            },
            None,
            BackpressureLimits { high: 100, low: 40 },
            Arc::new(BrokerStats::new()),
        );
        let mut signal = conn.backpressure();

        conn.send(&subscribe_response("r1")).unwrap();
        conn.send(&subscribe_response("r2")).unwrap();
        assert!(conn.is_backpressured());
        assert!(signal.has_changed().unwrap());
        signal.borrow_and_update();

        // Stays raised without another notification
        conn.send(&subscribe_response("r3")).unwrap();
        assert!(!signal.has_changed().unwrap());

        let buffered = conn.buffered_bytes();
        conn.on_flushed(buffered - 50);
        assert!(conn.is_backpressured());

        conn.on_flushed(50);
        assert!(!conn.is_backpressured());
        assert_eq!(conn.buffered_bytes(), 0);
    }

    #[test]
    fn test_close_clears_streams() {
        let (conn, mut rx) = test_connection();
        conn.add_stream(StreamKey::new("s1", 0).unwrap());
        conn.close();

        assert!(conn.is_dead());
        assert!(conn.streams().is_empty());
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close(None));
    }

    #[test]
    fn test_close_after_writer_gone() {
        let (conn, rx) = test_connection();
        drop(rx);
        conn.close();
        assert!(conn.is_dead());
    }

    #[tokio::test]
    async fn test_force_close_signals_termination() {
        let (conn, _rx) = test_connection();
        conn.force_close("liveness");
        assert!(conn.is_dead());
        conn.terminated().await;
    }

    #[test]
    fn test_streams() {
        let (conn, _rx) = test_connection();
        let a = StreamKey::new("a", 0).unwrap();
        let b = StreamKey::new("b", 3).unwrap();

        conn.add_stream(a.clone());
        conn.add_stream(a.clone());
        conn.add_stream(b.clone());
        assert_eq!(conn.streams(), vec![a.clone(), b.clone()]);
        assert_eq!(conn.streams_as_string(), vec!["a#0", "b#3"]);

        conn.remove_stream(&a);
        conn.remove_stream(&a);
        let mut seen = Vec::new();
        conn.for_each_stream(|k| seen.push(k.clone()));
        assert_eq!(seen, vec![b]);
    }

    #[test]
    fn test_liveness() {
        let (conn, mut rx) = test_connection();
        assert!(conn.is_liveness_acked());

        conn.set_liveness_acked(false);
        conn.ping().unwrap();
        assert_eq!(rx.try_recv().unwrap(), Outbound::Ping);
        assert!(!conn.is_liveness_acked());

        conn.mark_liveness_acked();
        assert!(conn.is_liveness_acked());
    }
}
