//! Broker server listener
//!
//! Handles the TCP accept loop, the websocket upgrade with protocol version
//! negotiation, and spawns one reader and one writer task per connection.

use std::collections::HashMap;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::error::{NegotiationError, ProtocolError, Result};
use crate::network::{MessageListener, NetworkNode};
use crate::protocol::version::close_reason;
use crate::protocol::{decode_request, negotiate, ControlResponse, ProtocolVersions, StreamMessage, UnsubscribeRequest};
use crate::registry::StreamRegistry;
use crate::server::config::ServerConfig;
use crate::server::handler::RequestHandler;
use crate::server::Collaborators;
use crate::session::{Connection, Outbound};
use crate::stats::{BrokerStats, StatsSnapshot};

/// How long a closing connection may take to flush its last frames
const WRITER_GRACE: Duration = Duration::from_secs(5);

/// Websocket broker server
pub struct BrokerServer {
    config: ServerConfig,
    handler: RequestHandler,
    registry: Arc<StreamRegistry>,
    stats: Arc<BrokerStats>,
    network: Arc<dyn NetworkNode>,
    fan_out: Arc<dyn MessageListener>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    connection_semaphore: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
    sweep: Mutex<Option<JoinHandle<()>>>,
    local_addr: OnceLock<SocketAddr>,
}

impl BrokerServer {
    /// Create a server and register its fan-out listener on the network node
    pub fn new(config: ServerConfig, collaborators: Collaborators) -> Arc<Self> {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        let registry = Arc::new(StreamRegistry::with_config(config.registry.clone()));
        let stats = Arc::new(BrokerStats::new());

        let fan_out: Arc<dyn MessageListener> = Arc::new(FanOut {
            registry: Arc::clone(&registry),
        });
        collaborators.network.add_message_listener(Arc::clone(&fan_out));

        let handler = RequestHandler::new(
            Arc::clone(&registry),
            Arc::clone(&collaborators.network),
            collaborators.permissions,
            collaborators.publisher,
            collaborators.historical,
            Arc::clone(&stats),
        );

        Arc::new(Self {
            config,
            handler,
            registry,
            stats,
            network: collaborators.network,
            fan_out,
            connections: RwLock::new(HashMap::new()),
            connection_semaphore,
            shutdown: CancellationToken::new(),
            sweep: Mutex::new(None),
            local_addr: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn handler(&self) -> &RequestHandler {
        &self.handler
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Address the server is listening on, once bound
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Bind the configured address and serve until [`close`](Self::close)
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Run the server until `shutdown` resolves, then close it
    pub async fn run_until<F>(self: &Arc<Self>, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let result = tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.run() => result,
        };

        self.close().await;
        result
    }

    /// Serve connections on an already bound listener
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        let _ = self.local_addr.set(addr);
        tracing::info!(addr = %addr, path = %self.config.ws_path, "Broker listening");

        self.start_liveness_sweep().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        let server = Arc::clone(self);
                        tokio::spawn(async move {
                            server.handle_socket(socket, peer_addr).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }

        tracing::info!(addr = %addr, "Broker stopped listening");
        Ok(())
    }

    /// Graceful shutdown
    ///
    /// Stops the liveness sweep and tears every live connection down, which
    /// releases its upstream subscriptions. Only then are handler and
    /// registry resources released, the fan-out listener detached from the
    /// network node and the listening socket closed.
    pub async fn close(&self) {
        if let Some(sweep) = self.sweep.lock().await.take() {
            sweep.abort();
        }

        let connections: Vec<_> = self.connections.read().await.values().cloned().collect();
        for connection in &connections {
            self.remove_connection(connection).await;
        }

        self.handler.close().await;
        self.network.remove_message_listener(&self.fan_out);

        self.shutdown.cancel();
        tracing::info!(closed = connections.len(), "Broker closed");
    }

    /// Start the periodic liveness sweep; no-op if already running
    pub async fn start_liveness_sweep(self: &Arc<Self>) {
        let mut sweep = self.sweep.lock().await;
        if sweep.is_some() {
            return;
        }

        let server = Arc::downgrade(self);
        let period = self.config.ping_interval;
        *sweep = Some(tokio::spawn(liveness_loop(server, period)));
    }

    /// Ping every connection once
    ///
    /// A connection that did not answer the previous ping is force-closed.
    pub async fn sweep(&self) {
        let connections: Vec<_> = self.connections.read().await.values().cloned().collect();

        for connection in connections {
            if !connection.is_liveness_acked() {
                connection.force_close("No response to ping");
                continue;
            }

            connection.set_liveness_acked(false);
            if let Err(e) = connection.ping() {
                connection.force_close(&format!("Failed to send ping: {e}"));
            }
        }
    }

    /// Create a connection for a negotiated client and start tracking it
    pub async fn open_connection(
        &self,
        versions: ProtocolVersions,
        peer_addr: Option<SocketAddr>,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<Outbound>) {
        let (connection, outbound) = Connection::new(
            versions,
            peer_addr,
            self.config.backpressure_limits(),
            Arc::clone(&self.stats),
        );

        self.connections
            .write()
            .await
            .insert(connection.id().to_string(), Arc::clone(&connection));
        self.stats.connection_opened(versions);

        tracing::debug!(
            connection_id = %connection.id(),
            versions = %versions,
            "Connection opened"
        );

        (connection, outbound)
    }

    /// Tear down a closed connection
    ///
    /// Only the first call for a connection has any effect.
    pub async fn remove_connection(&self, connection: &Arc<Connection>) {
        if self.connections.write().await.remove(connection.id()).is_none() {
            return;
        }

        for key in connection.streams() {
            let request = UnsubscribeRequest {
                request_id: String::new(),
                stream_id: key.stream_id().to_string(),
                stream_partition: key.partition(),
            };
            self.handler.unsubscribe(connection, &request, true).await;
        }

        self.handler.on_connection_close(connection.id()).await;
        connection.close();
        self.stats.connection_closed(connection.versions());

        tracing::debug!(connection_id = %connection.id(), "Connection removed");
    }

    async fn handle_socket(self: Arc<Self>, socket: TcpStream, peer_addr: SocketAddr) {
        if let Err(e) = self.configure_socket(&socket) {
            tracing::error!(error = %e, "Failed to configure socket");
            return;
        }

        let mut negotiated: Option<std::result::Result<ProtocolVersions, NegotiationError>> = None;
        let ws_path = self.config.ws_path.as_str();
        let callback = |req: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
            if req.uri().path() != ws_path {
                let mut not_found = ErrorResponse::new(Some("Not found".to_string()));
                *not_found.status_mut() = StatusCode::NOT_FOUND;
                return Err(not_found);
            }
            negotiated = Some(negotiate(req.uri().query()));
            Ok(response)
        };

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.max_payload);
        ws_config.max_frame_size = Some(self.config.max_payload);

        let mut ws = match tokio_tungstenite::accept_hdr_async_with_config(socket, callback, Some(ws_config)).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::debug!(peer = %peer_addr, error = %e, "Websocket handshake failed");
                return;
            }
        };

        let versions = match negotiated {
            Some(Ok(versions)) => versions,
            Some(Err(e)) => {
                tracing::debug!(peer = %peer_addr, error = %e, "Version negotiation failed");
                reject(&mut ws, CloseCode::Policy, &e.to_string()).await;
                return;
            }
            None => return,
        };

        let _permit = match self.connection_semaphore {
            Some(ref sem) => match Arc::clone(sem).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    reject(&mut ws, CloseCode::Again, "Too many connections").await;
                    return;
                }
            },
            None => None,
        };

        let (connection, outbound) = self.open_connection(versions, Some(peer_addr)).await;
        let (sink, mut stream) = ws.split();
        let mut writer = tokio::spawn(write_loop(Arc::clone(&connection), sink, outbound));

        loop {
            let message = tokio::select! {
                _ = connection.terminated() => break,
                _ = self.shutdown.cancelled() => break,
                message = stream.next() => message,
            };

            match message {
                Some(Ok(Message::Text(text))) => self.dispatch(&connection, text.as_str()).await,
                Some(Ok(Message::Binary(payload))) => match std::str::from_utf8(&payload) {
                    Ok(text) => self.dispatch(&connection, text).await,
                    Err(e) => self
                        .handler
                        .reject(&connection, &ProtocolError::Malformed(format!("Binary frame is not UTF-8: {e}"))),
                },
                Some(Ok(Message::Pong(_))) => connection.mark_liveness_acked(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e @ (WsError::Utf8 | WsError::Capacity(_)))) => {
                    // The read half yields nothing after an error, answer before closing
                    self.handler
                        .reject(&connection, &ProtocolError::Malformed(e.to_string()));
                    break;
                }
                Some(Err(e)) => {
                    tracing::debug!(connection_id = %connection.id(), error = %e, "Websocket read failed");
                    break;
                }
            }
        }

        self.remove_connection(&connection).await;

        if tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
            writer.abort();
        }

        tracing::debug!(connection_id = %connection.id(), peer = %peer_addr, "Connection closed");
    }

    async fn dispatch(&self, connection: &Arc<Connection>, text: &str) {
        match decode_request(text) {
            Ok(request) => self.handler.handle(connection, request).await,
            Err(err) => self.handler.reject(connection, &err),
        }
    }

    fn configure_socket(&self, socket: &TcpStream) -> std::io::Result<()> {
        if self.config.tcp_nodelay {
            socket.set_nodelay(true)?;
        }

        Ok(())
    }
}

async fn liveness_loop(server: Weak<BrokerServer>, period: Duration) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        interval.tick().await;
        let Some(server) = server.upgrade() else {
            break;
        };
        server.sweep().await;
    }
}

/// Drain the outbound queue of one connection into its websocket sink
async fn write_loop<S>(
    connection: Arc<Connection>,
    mut sink: S,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    loop {
        let item = tokio::select! {
            _ = connection.terminated() => break,
            item = outbound.recv() => item,
        };

        match item {
            Some(Outbound::Frame(text)) => {
                let len = text.len();
                let result = sink.send(Message::Text(text.into())).await;
                connection.on_flushed(len);
                if let Err(e) = result {
                    connection.force_close(&format!("Failed to write frame: {e}"));
                    break;
                }
            }
            Some(Outbound::Ping) => {
                if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                    connection.force_close(&format!("Failed to send ping: {e}"));
                    break;
                }
            }
            Some(Outbound::Close(reason)) => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: close_reason(reason.as_deref().unwrap_or_default()).into(),
                };
                // Peer may have closed first
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
            None => break,
        }
    }
}

/// Close a websocket that never became a connection
async fn reject(ws: &mut WebSocketStream<TcpStream>, code: CloseCode, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: close_reason(reason).into(),
    };

    if let Err(e) = ws.close(Some(frame)).await {
        tracing::debug!(error = %e, "Failed to send close frame");
        return;
    }

    // Wait briefly for the peer to acknowledge the close
    let drain = async { while let Some(Ok(_)) = ws.next().await {} };
    let _ = tokio::time::timeout(Duration::from_secs(1), drain).await;
}

/// Delivers real-time network messages to every connection on the stream
struct FanOut {
    registry: Arc<StreamRegistry>,
}

#[async_trait]
impl MessageListener for FanOut {
    async fn on_message(&self, message: Arc<StreamMessage>) {
        let key = match message.key() {
            Ok(key) => key,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping message with invalid key");
                return;
            }
        };

        let Some(connections) = self.registry.connections(&key).await else {
            tracing::debug!(stream = %key, "No stream entry for message");
            return;
        };

        let response = ControlResponse::BroadcastMessage {
            request_id: String::new(),
            stream_message: message,
        };

        for connection in connections {
            if let Err(e) = connection.send(&response) {
                tracing::debug!(connection_id = %connection.id(), stream = %key, error = %e, "Broadcast failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowAll, NetworkPublisher};
    use crate::network::{LocalNetworkNode, NetworkNode};
    use crate::protocol::{ControlRequest, SubscribeRequest};
    use crate::registry::StreamKey;
    use crate::resend::InMemoryHistory;
    use crate::session::connection::received_frames;

    fn versions() -> ProtocolVersions {
        ProtocolVersions {
            control_layer: 2,
            message_layer: 32,
        }
    }

    fn server(config: ServerConfig) -> (Arc<BrokerServer>, Arc<LocalNetworkNode>) {
        let network = Arc::new(LocalNetworkNode::new());
        (server_on(config, &network), network)
    }

    fn server_on(config: ServerConfig, network: &Arc<LocalNetworkNode>) -> Arc<BrokerServer> {
        let node: Arc<dyn NetworkNode> = network.clone();
        let collaborators = Collaborators {
            network: Arc::clone(&node),
            permissions: Arc::new(AllowAll),
            publisher: Arc::new(NetworkPublisher::new(node)),
            historical: Arc::new(InMemoryHistory::new()),
        };
        BrokerServer::new(config, collaborators)
    }

    fn subscribe(stream_id: &str) -> ControlRequest {
        ControlRequest::Subscribe(SubscribeRequest {
            request_id: "sub".into(),
            stream_id: stream_id.into(),
            stream_partition: 0,
            session_token: None,
        })
    }

    fn message(stream_id: &str, timestamp: i64) -> StreamMessage {
        serde_json::from_value(serde_json::json!({
            "streamId": stream_id,
            "streamPartition": 0,
            "timestamp": timestamp,
            "content": {"value": timestamp},
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_sweep_closes_unresponsive_connection() {
        let (server, _network) = server(ServerConfig::default());
        let (responsive, mut responsive_rx) = server.open_connection(versions(), None).await;
        let (silent, mut silent_rx) = server.open_connection(versions(), None).await;

        server.sweep().await;
        assert_eq!(responsive_rx.try_recv().unwrap(), Outbound::Ping);
        assert_eq!(silent_rx.try_recv().unwrap(), Outbound::Ping);
        assert!(!responsive.is_liveness_acked());

        responsive.mark_liveness_acked();
        server.sweep().await;

        assert!(silent.is_dead());
        assert!(!responsive.is_dead());
        assert_eq!(responsive_rx.try_recv().unwrap(), Outbound::Ping);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_timer() {
        let (server, _network) = server(ServerConfig::default().ping_interval(Duration::from_secs(10)));
        let (connection, mut rx) = server.open_connection(versions(), None).await;
        server.start_liveness_sweep().await;

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(rx.try_recv().unwrap(), Outbound::Ping);
        assert!(!connection.is_dead());

        // Never answered, closed one interval later
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(connection.is_dead());

        server.close().await;
    }

    #[tokio::test]
    async fn test_fan_out_to_subscribers() {
        let (server, network) = server(ServerConfig::default());
        let (a, mut rx_a) = server.open_connection(versions(), None).await;
        let (b, mut rx_b) = server.open_connection(versions(), None).await;
        let (_c, mut rx_c) = server.open_connection(versions(), None).await;

        server.handler().handle(&a, subscribe("s1")).await;
        server.handler().handle(&b, subscribe("s1")).await;
        received_frames(&mut rx_a);
        received_frames(&mut rx_b);

        network.deliver(message("s1", 1)).await;
        network.deliver(message("s1", 2)).await;
        network.deliver(message("other", 3)).await;

        for rx in [&mut rx_a, &mut rx_b] {
            let frames = received_frames(rx);
            assert_eq!(frames.len(), 2);
            assert_eq!(frames[0]["type"], "BroadcastMessage");
            assert_eq!(frames[0]["streamMessage"]["timestamp"], 1);
            assert_eq!(frames[1]["streamMessage"]["timestamp"], 2);
        }
        assert!(received_frames(&mut rx_c).is_empty());
    }

    #[tokio::test]
    async fn test_remove_connection_unsubscribes() {
        let (server, network) = server(ServerConfig::default());
        let (connection, mut rx) = server.open_connection(versions(), None).await;
        let key = StreamKey::new("s1", 0).unwrap();

        server.handler().handle(&connection, subscribe("s1")).await;
        received_frames(&mut rx);
        assert!(network.is_subscribed(&key).await);
        assert_eq!(server.stats().active_connections, 1);

        server.remove_connection(&connection).await;
        server.remove_connection(&connection).await;

        assert!(!network.is_subscribed(&key).await);
        assert_eq!(network.unsubscribe_count(&key), 1);
        assert!(connection.is_dead());
        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.stats().active_connections, 0);

        // Silent: no unsubscribe response, only the close
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close(None));
    }

    #[tokio::test]
    async fn test_close_releases_everything() {
        let (server, _network) = server(ServerConfig::default());
        let (connection, mut rx) = server.open_connection(versions(), None).await;
        server.handler().handle(&connection, subscribe("s1")).await;
        received_frames(&mut rx);
        server.start_liveness_sweep().await;

        server.close().await;

        assert!(connection.is_dead());
        assert_eq!(server.registry().stream_count().await, 0);
        assert_eq!(server.registry().pending_timers().await, 0);
        assert!(server.sweep.lock().await.is_none());
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close(None));
    }

    #[tokio::test]
    async fn test_close_releases_upstream_subscriptions() {
        let (server, network) = server(ServerConfig::default());
        let (connection, mut rx) = server.open_connection(versions(), None).await;
        let key = StreamKey::new("s1", 0).unwrap();
        server.handler().handle(&connection, subscribe("s1")).await;
        received_frames(&mut rx);
        assert!(network.is_subscribed(&key).await);

        server.close().await;
        // The reader task tears the same connection down once it wakes up
        server.remove_connection(&connection).await;

        assert!(!network.is_subscribed(&key).await);
        assert_eq!(network.unsubscribe_count(&key), 1);
        assert_eq!(server.handler().subscriptions().key_count().await, 0);
        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.stats().active_connections, 0);
    }

    #[tokio::test]
    async fn test_close_detaches_fan_out() {
        let (server, network) = server(ServerConfig::default());
        assert_eq!(network.listener_count(), 1);

        server.close().await;
        assert_eq!(network.listener_count(), 0);

        // A server rebuilt on the same node only registers its own listener
        let _rebuilt = server_on(ServerConfig::default(), &network);
        assert_eq!(network.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_write_loop_reports_flushed_bytes() {
        let (server, _network) = server(ServerConfig::default().backpressure(10, 5));
        let (connection, outbound) = server.open_connection(versions(), None).await;
        let (sink, mut written) = futures::channel::mpsc::unbounded::<Message>();
        let writer = tokio::spawn(write_loop(
            Arc::clone(&connection),
            sink.sink_map_err(|e| e.to_string()),
            outbound,
        ));

        connection
            .send(&ControlResponse::error("r1", crate::error::ErrorCode::NotFound, "missing"))
            .unwrap();
        assert!(connection.is_backpressured());

        let frame = written.next().await.unwrap();
        assert!(matches!(frame, Message::Text(_)));

        connection.close();
        writer.await.unwrap();

        assert_eq!(connection.buffered_bytes(), 0);
        assert!(!connection.is_backpressured());
        assert!(matches!(written.next().await, Some(Message::Close(Some(_)))));
    }
}
