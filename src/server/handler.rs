//! Control request handler
//!
//! Drives stream entries through their lifecycle in response to client
//! requests. Every failure is answered with an `ErrorResponse` correlated by
//! request id; nothing propagates out of [`RequestHandler::handle`].

use std::sync::Arc;

use futures::stream::{self, StreamExt};

use crate::auth::{Operation, PermissionChecker, Publisher};
use crate::error::{ErrorCode, NetworkError, PermissionError, ProtocolError, PublishError};
use crate::network::NetworkNode;
use crate::protocol::constants::is_key_exchange_stream;
use crate::protocol::{ControlRequest, ControlResponse, PublishRequest, SubscribeRequest, UnsubscribeRequest};
use crate::registry::{RegistryError, StreamKey, StreamRegistry};
use crate::resend::{HistoricalDataSource, ResendQuery, ResendSession, ResendTracker};
use crate::session::Connection;
use crate::stats::BrokerStats;
use crate::subscription::SubscriptionMultiplexer;

/// Why a subscribe or resend was refused before touching any state
#[derive(Debug)]
enum AccessError {
    KeyExchangePartition { stream_id: String, partition: u32 },
    Permission(PermissionError),
}

/// Handles decoded control requests for all connections
pub struct RequestHandler {
    registry: Arc<StreamRegistry>,
    subscriptions: SubscriptionMultiplexer,
    permissions: Arc<dyn PermissionChecker>,
    publisher: Arc<dyn Publisher>,
    historical: Arc<dyn HistoricalDataSource>,
    resends: Arc<ResendTracker>,
    stats: Arc<BrokerStats>,
}

impl RequestHandler {
    pub fn new(
        registry: Arc<StreamRegistry>,
        network: Arc<dyn NetworkNode>,
        permissions: Arc<dyn PermissionChecker>,
        publisher: Arc<dyn Publisher>,
        historical: Arc<dyn HistoricalDataSource>,
        stats: Arc<BrokerStats>,
    ) -> Self {
        Self {
            registry,
            subscriptions: SubscriptionMultiplexer::new(network),
            permissions,
            publisher,
            historical,
            resends: Arc::new(ResendTracker::new()),
            stats,
        }
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn subscriptions(&self) -> &SubscriptionMultiplexer {
        &self.subscriptions
    }

    pub fn resends(&self) -> &Arc<ResendTracker> {
        &self.resends
    }

    /// Dispatch one request
    pub async fn handle(&self, connection: &Arc<Connection>, request: ControlRequest) {
        tracing::debug!(
            connection_id = %connection.id(),
            request_id = %request.request_id(),
            request_type = request.type_name(),
            "Handling request"
        );

        match request {
            ControlRequest::Subscribe(request) => self.subscribe(connection, request).await,
            ControlRequest::Unsubscribe(request) => {
                self.unsubscribe(connection, &request, false).await
            }
            ControlRequest::Publish(request) => self.publish(connection, request).await,
            ControlRequest::ResendLast(request) => {
                let query = ResendQuery::try_from(&request);
                self.resend(connection, request.request_id, query).await
            }
            ControlRequest::ResendFrom(request) => {
                let query = ResendQuery::try_from(&request);
                self.resend(connection, request.request_id, query).await
            }
            ControlRequest::ResendRange(request) => {
                let query = ResendQuery::try_from(&request);
                self.resend(connection, request.request_id, query).await
            }
        }
    }

    /// Answer a frame that could not be decoded
    pub fn reject(&self, connection: &Connection, err: &ProtocolError) {
        tracing::debug!(connection_id = %connection.id(), error = %err, "Rejecting frame");
        reply(
            connection,
            ControlResponse::error(err.request_id(), ErrorCode::InvalidRequest, err.to_string()),
        );
    }

    async fn check_access(
        &self,
        stream_id: &str,
        partition: u32,
        session_token: Option<&str>,
    ) -> Result<(), AccessError> {
        if is_key_exchange_stream(stream_id) {
            if partition != 0 {
                return Err(AccessError::KeyExchangePartition {
                    stream_id: stream_id.to_string(),
                    partition,
                });
            }
            return Ok(());
        }

        self.permissions
            .check_permission(stream_id, session_token, Operation::Subscribe)
            .await
            .map_err(AccessError::Permission)
    }

    /// Join a connection to a stream, subscribing upstream on first interest
    ///
    /// The registry guard stays held across the upstream subscribe, so
    /// concurrent requests for one key reach the network once. A slow
    /// network subscribe therefore also holds up fan-out on every stream,
    /// which takes the same guard.
    async fn subscribe(&self, connection: &Arc<Connection>, request: SubscribeRequest) {
        let stream_id = request.stream_id.as_str();
        let partition = request.stream_partition;

        if let Err(err) = self
            .check_access(stream_id, partition, request.session_token.as_deref())
            .await
        {
            tracing::debug!(
                connection_id = %connection.id(),
                stream_id,
                partition,
                error = ?err,
                "Subscribe refused"
            );
            reply(connection, subscribe_rejection(&request.request_id, stream_id, err));
            return;
        }

        // The permission check may have outlived the connection
        if connection.is_dead() {
            return;
        }

        let key = match StreamKey::new(stream_id, partition) {
            Ok(key) => key,
            Err(err) => {
                reply(
                    connection,
                    ControlResponse::error(&request.request_id, ErrorCode::InvalidRequest, err.to_string()),
                );
                return;
            }
        };

        let mut table = self.registry.lock().await;
        let entry = table.get_or_create(&key, None);

        if !entry.is_subscribed() && !entry.is_subscribing() {
            entry.set_subscribing();
            if let Err(err) = self.subscriptions.subscribe(&key).await {
                table.delete(&key);
                drop(table);
                reply(connection, subscribe_failure(&request.request_id, &err));
                return;
            }
            entry.set_subscribed();
        }

        if !entry.has_connection(connection.id()) {
            entry.add_connection(Arc::clone(connection));
        }
        connection.add_stream(key.clone());
        drop(table);

        tracing::debug!(
            connection_id = %connection.id(),
            streams = ?connection.streams_as_string(),
            "Subscribed"
        );

        reply(
            connection,
            ControlResponse::SubscribeResponse {
                request_id: request.request_id,
                stream_id: request.stream_id,
                stream_partition: partition,
            },
        );
    }

    /// Leave a stream; `silent` suppresses every reply
    pub async fn unsubscribe(&self, connection: &Connection, request: &UnsubscribeRequest, silent: bool) {
        let key = match StreamKey::new(request.stream_id.as_str(), request.stream_partition) {
            Ok(key) => key,
            Err(err) => {
                if !silent {
                    reply(
                        connection,
                        ControlResponse::error(&request.request_id, ErrorCode::InvalidRequest, err.to_string()),
                    );
                }
                return;
            }
        };

        let mut table = self.registry.lock().await;
        let Some(entry) = table.get_mut(&key) else {
            drop(table);
            tracing::debug!(connection_id = %connection.id(), stream = %key, "Stream no longer exists");
            if !silent {
                reply(
                    connection,
                    ControlResponse::error(
                        &request.request_id,
                        ErrorCode::InvalidRequest,
                        RegistryError::NotSubscribed(key).to_string(),
                    ),
                );
            }
            return;
        };

        entry.remove_connection(connection.id());
        connection.remove_stream(&key);

        let remaining = entry.connection_count();
        tracing::debug!(stream = %key, remaining, "Connection left stream");

        if remaining == 0 {
            if let Err(err) = self.subscriptions.unsubscribe(&key).await {
                tracing::warn!(stream = %key, error = %err, "Upstream unsubscribe failed");
            }
            table.delete(&key);
        }
        drop(table);

        if !silent {
            reply(
                connection,
                ControlResponse::UnsubscribeResponse {
                    request_id: request.request_id.clone(),
                    stream_id: request.stream_id.clone(),
                    stream_partition: request.stream_partition,
                },
            );
        }
    }

    async fn publish(&self, connection: &Connection, request: PublishRequest) {
        let PublishRequest {
            request_id,
            stream_message,
            session_token,
        } = request;
        let stream_id = stream_message.stream_id.clone();

        let result: Result<(), PublishError> = async {
            // Unsigned messages need an explicit publish grant
            if stream_message.signature.is_none() {
                self.permissions
                    .check_permission(&stream_id, session_token.as_deref(), Operation::Publish)
                    .await?;
            }
            self.publisher.validate_and_publish(stream_message).await
        }
        .await;

        if let Err(err) = result {
            let denial = match &err {
                PublishError::Permission(perm) => denial_message(perm, "publish to", "write to", &stream_id)
                    .map(|message| (ErrorCode::from_permission(perm, ErrorCode::RequestFailed), message)),
                _ => None,
            };

            let (code, message) = match (&err, denial) {
                (_, Some(denial)) => denial,
                (PublishError::FutureTimestamp(message), None) => (ErrorCode::FutureTimestamp, message.clone()),
                (PublishError::Validation(_), None) => (ErrorCode::InvalidRequest, err.to_string()),
                (PublishError::Permission(_) | PublishError::Network(_), None) => {
                    tracing::error!(
                        connection_id = %connection.id(),
                        stream_id = %stream_id,
                        error = %err,
                        "Publish failed"
                    );
                    (ErrorCode::RequestFailed, format!("Publish request failed: {err}"))
                }
            };
            reply(connection, ControlResponse::error(request_id, code, message));
        }
    }

    async fn resend(
        &self,
        connection: &Arc<Connection>,
        request_id: String,
        query: Result<ResendQuery, ProtocolError>,
    ) {
        let query = match query {
            Ok(query) => query,
            Err(err) => {
                reply(connection, ControlResponse::error(request_id, ErrorCode::InvalidRequest, err.to_string()));
                return;
            }
        };
        let key = query.key.clone();

        if let Err(err) = self
            .check_access(key.stream_id(), key.partition(), query.session_token.as_deref())
            .await
        {
            reply(connection, resend_rejection(&request_id, &key, err));
            return;
        }

        if connection.is_dead() {
            return;
        }

        // Interest only; the orphan timer removes it if nobody subscribes
        self.registry.lock().await.get_or_create(&key, None);

        let source = if query.is_trivially_empty() {
            Ok(stream::empty().boxed())
        } else {
            self.historical.fetch(&query).await
        };
        let source = match source {
            Ok(source) => source,
            Err(err) => {
                tracing::warn!(stream = %key, request_id = %request_id, error = %err, "Resend fetch failed");
                reply(connection, resend_failure(&request_id, &key, &err));
                return;
            }
        };

        let session = ResendSession::new(self.resends.next_id(), source);
        let handle = session.handle();
        self.resends.add(connection.id(), handle.clone()).await;

        // Closed while fetching; the close may have swept the tracker already
        if connection.is_dead() {
            handle.abort();
            self.resends.remove(connection.id(), handle.id()).await;
            return;
        }

        self.stats.resend_started(handle.id());
        tokio::spawn(stream_resend(
            Arc::clone(connection),
            session,
            request_id,
            key,
            Arc::clone(&self.resends),
            Arc::clone(&self.stats),
        ));
    }

    /// Abort every resend belonging to a closed connection
    pub async fn on_connection_close(&self, connection_id: &str) {
        let aborted = self.resends.abort_connection(connection_id).await;
        if aborted > 0 {
            tracing::debug!(connection_id, aborted, "Aborted resends of closed connection");
        }
    }

    /// Abort all resends and release the registry
    pub async fn close(&self) {
        let aborted = self.resends.abort_all().await;
        self.registry.close().await;
        tracing::debug!(aborted, "Request handler closed");
    }
}

async fn stream_resend(
    connection: Arc<Connection>,
    mut session: ResendSession,
    request_id: String,
    key: StreamKey,
    tracker: Arc<ResendTracker>,
    stats: Arc<BrokerStats>,
) {
    let mut backpressure = connection.backpressure();
    let mut sent = 0usize;
    let mut failed = false;

    while let Some(item) = session.next(&mut backpressure).await {
        if connection.is_dead() {
            session.abort();
            break;
        }

        match item {
            Ok(message) => {
                if sent == 0 {
                    reply(
                        &connection,
                        ControlResponse::ResendResponseResending {
                            request_id: request_id.clone(),
                            stream_id: key.stream_id().to_string(),
                            stream_partition: key.partition(),
                        },
                    );
                }
                sent += 1;
                reply(
                    &connection,
                    ControlResponse::UnicastMessage {
                        request_id: request_id.clone(),
                        stream_message: Arc::new(message),
                    },
                );
            }
            Err(err) => {
                tracing::warn!(stream = %key, request_id = %request_id, error = %err, "Resend stream failed");
                reply(&connection, resend_failure(&request_id, &key, &err));
                failed = true;
                break;
            }
        }
    }

    if !failed && !session.is_aborted() {
        tracing::info!(
            request_id = %request_id,
            stream = %key,
            sent,
            "Finished resend"
        );

        let stream_id = key.stream_id().to_string();
        let stream_partition = key.partition();
        let done = if sent == 0 {
            ControlResponse::ResendResponseNoResend {
                request_id,
                stream_id,
                stream_partition,
            }
        } else {
            ControlResponse::ResendResponseResent {
                request_id,
                stream_id,
                stream_partition,
            }
        };
        reply(&connection, done);
    }

    tracker.remove(connection.id(), session.id()).await;
    stats.resend_finished(session.id());
}

fn reply(connection: &Connection, response: ControlResponse) {
    if let Err(err) = connection.send(&response) {
        tracing::debug!(
            connection_id = %connection.id(),
            request_id = %response.request_id(),
            error = %err,
            "Dropping response"
        );
    }
}

fn subscribe_rejection(request_id: &str, stream_id: &str, err: AccessError) -> ControlResponse {
    let (code, message) = match err {
        AccessError::KeyExchangePartition { stream_id, partition } => (
            ErrorCode::InvalidRequest,
            format!("Key exchange streams only have partition 0. Tried to subscribe to {stream_id}:{partition}"),
        ),
        AccessError::Permission(err) => {
            let message = denial_message(&err, "subscribe to", "subscribe to", stream_id)
                .unwrap_or_else(|| format!("Subscribe request failed: {err}"));
            (ErrorCode::from_permission(&err, ErrorCode::RequestFailed), message)
        }
    };
    ControlResponse::error(request_id, code, message)
}

/// Client-facing message for a refused permission check
///
/// `None` when the check itself could not be carried out.
fn denial_message(err: &PermissionError, attempted: &str, denied: &str, stream_id: &str) -> Option<String> {
    match err {
        PermissionError::Unauthenticated => Some(format!(
            "Authentication failed while trying to {attempted} stream {stream_id}"
        )),
        PermissionError::Forbidden => Some(format!("You are not allowed to {denied} stream {stream_id}")),
        PermissionError::NotFound => Some(format!("Stream {stream_id} not found.")),
        PermissionError::Unavailable(_) => None,
    }
}

fn subscribe_failure(request_id: &str, err: &NetworkError) -> ControlResponse {
    ControlResponse::error(
        request_id,
        ErrorCode::RequestFailed,
        format!("Subscribe request failed: {err}"),
    )
}

fn resend_rejection(request_id: &str, key: &StreamKey, err: AccessError) -> ControlResponse {
    let stream_id = key.stream_id();
    let (code, message) = match err {
        AccessError::KeyExchangePartition { stream_id, partition } => (
            ErrorCode::InvalidRequest,
            format!("Key exchange streams only have partition 0. Tried to resend from {stream_id}:{partition}"),
        ),
        AccessError::Permission(err) => match denial_message(&err, "resend from", "resend from", stream_id) {
            Some(message) => (ErrorCode::from_permission(&err, ErrorCode::ResendFailed), message),
            None => return resend_failure(request_id, key, &err),
        },
    };
    ControlResponse::error(request_id, code, message)
}

fn resend_failure(request_id: &str, key: &StreamKey, err: &dyn std::fmt::Display) -> ControlResponse {
    ControlResponse::error(
        request_id,
        ErrorCode::ResendFailed,
        format!(
            "Failed to request resend from stream {} and partition {}: {err}",
            key.stream_id(),
            key.partition()
        ),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use super::*;
    use crate::auth::{AllowAll, NetworkPublisher, StaticPermissions};
    use crate::error::ResendError;
    use crate::network::LocalNetworkNode;
    use crate::protocol::{decode_request, StreamMessage};
    use crate::registry::StreamState;
    use crate::resend::{InMemoryHistory, MessageStream};
    use crate::session::connection::{received_frames, test_connection};
    use crate::session::Outbound;

    struct Setup {
        handler: RequestHandler,
        node: Arc<LocalNetworkNode>,
        history: Arc<InMemoryHistory>,
    }

    fn setup_with(permissions: Arc<dyn PermissionChecker>, historical: Option<Arc<dyn HistoricalDataSource>>) -> Setup {
        let node = Arc::new(LocalNetworkNode::new());
        let history = Arc::new(InMemoryHistory::new());
        let handler = RequestHandler::new(
            Arc::new(StreamRegistry::new()),
            node.clone(),
            permissions,
            Arc::new(NetworkPublisher::new(node.clone())),
            historical.unwrap_or_else(|| history.clone() as Arc<dyn HistoricalDataSource>),
            Arc::new(BrokerStats::new()),
        );
        Setup { handler, node, history }
    }

    fn setup() -> Setup {
        setup_with(Arc::new(AllowAll), None)
    }

    fn request(value: Value) -> ControlRequest {
        decode_request(&value.to_string()).unwrap()
    }

    fn subscribe(id: &str, stream_id: &str, partition: u32) -> ControlRequest {
        request(json!({
            "type": "SubscribeRequest",
            "requestId": id,
            "streamId": stream_id,
            "streamPartition": partition,
        }))
    }

    fn unsubscribe(id: &str, stream_id: &str, partition: u32) -> ControlRequest {
        request(json!({
            "type": "UnsubscribeRequest",
            "requestId": id,
            "streamId": stream_id,
            "streamPartition": partition,
        }))
    }

    fn resend_last(id: &str, stream_id: &str, count: u64) -> ControlRequest {
        request(json!({
            "type": "ResendLastRequest",
            "requestId": id,
            "streamId": stream_id,
            "streamPartition": 0,
            "numberLast": count,
        }))
    }

    fn message(stream_id: &str, timestamp: i64) -> StreamMessage {
        serde_json::from_value(json!({
            "streamId": stream_id,
            "timestamp": timestamp,
            "content": {"n": timestamp},
        }))
        .unwrap()
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Value {
        loop {
            let item = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("connection queue closed");
            if let Outbound::Frame(text) = item {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    fn key(stream_id: &str, partition: u32) -> StreamKey {
        StreamKey::new(stream_id, partition).unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_fan_in_and_out() {
        let Setup { handler, node, .. } = setup();
        let (a, mut rx_a) = test_connection();
        let (b, mut rx_b) = test_connection();
        let k = key("s1", 0);

        handler.handle(&a, subscribe("r1", "s1", 0)).await;
        handler.handle(&b, subscribe("r2", "s1", 0)).await;
        assert_eq!(node.subscribe_count(&k), 1);
        assert_eq!(handler.registry().state(&k).await, Some(StreamState::Subscribed));
        assert_eq!(handler.registry().connections(&k).await.unwrap().len(), 2);
        assert_eq!(a.streams(), vec![k.clone()]);

        let ack = &received_frames(&mut rx_a)[0];
        assert_eq!(ack["type"], "SubscribeResponse");
        assert_eq!(ack["requestId"], "r1");
        assert_eq!(ack["streamId"], "s1");

        handler.handle(&a, unsubscribe("r3", "s1", 0)).await;
        assert_eq!(node.unsubscribe_count(&k), 0);
        assert!(a.streams().is_empty());

        handler.handle(&b, unsubscribe("r4", "s1", 0)).await;
        assert_eq!(node.unsubscribe_count(&k), 1);
        assert_eq!(handler.registry().state(&k).await, None);

        let frames = received_frames(&mut rx_b);
        assert_eq!(frames[1]["type"], "UnsubscribeResponse");
        assert_eq!(frames[1]["requestId"], "r4");
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_joins_once() {
        let Setup { handler, .. } = setup();
        let (a, mut rx) = test_connection();

        handler.handle(&a, subscribe("r1", "s1", 0)).await;
        handler.handle(&a, subscribe("r2", "s1", 0)).await;

        assert_eq!(handler.registry().connections(&key("s1", 0)).await.unwrap().len(), 1);
        assert_eq!(received_frames(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_subscribes_reach_network_once() {
        let Setup { handler, node, .. } = setup();
        let (a, mut rx_a) = test_connection();
        let (b, mut rx_b) = test_connection();
        let k = key("s1", 0);

        tokio::join!(
            handler.handle(&a, subscribe("r1", "s1", 0)),
            handler.handle(&b, subscribe("r2", "s1", 0)),
        );

        assert_eq!(node.subscribe_count(&k), 1);
        assert_eq!(handler.subscriptions().interest(&k).await, 1);
        assert_eq!(handler.registry().connections(&k).await.unwrap().len(), 2);
        assert_eq!(received_frames(&mut rx_a)[0]["type"], "SubscribeResponse");
        assert_eq!(received_frames(&mut rx_b)[0]["type"], "SubscribeResponse");
    }

    #[tokio::test]
    async fn test_unsubscribe_not_subscribed() {
        let Setup { handler, .. } = setup();
        let (a, mut rx) = test_connection();

        handler.handle(&a, unsubscribe("r1", "s1", 4)).await;
        let frames = received_frames(&mut rx);
        assert_eq!(frames[0]["type"], "ErrorResponse");
        assert_eq!(frames[0]["errorCode"], "INVALID_REQUEST");
        assert_eq!(frames[0]["errorMessage"], "Not subscribed to stream s1 partition 4!");

        let silent = UnsubscribeRequest {
            request_id: String::new(),
            stream_id: "s1".into(),
            stream_partition: 4,
        };
        handler.unsubscribe(&a, &silent, true).await;
        assert!(received_frames(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_permission_errors() {
        let permissions = StaticPermissions::new()
            .stream("private")
            .grant("alice", "other", Operation::Subscribe)
            .token("bob");
        let Setup { handler, node, .. } = setup_with(Arc::new(permissions), None);
        let (a, mut rx) = test_connection();

        handler.handle(&a, subscribe("r1", "missing", 0)).await;
        handler
            .handle(
                &a,
                request(json!({
                    "type": "SubscribeRequest",
                    "requestId": "r2",
                    "streamId": "private",
                    "sessionToken": "bob",
                })),
            )
            .await;
        handler.handle(&a, subscribe("r3", "private", 0)).await;

        let frames = received_frames(&mut rx);
        assert_eq!(frames[0]["errorCode"], "NOT_FOUND");
        assert_eq!(frames[0]["errorMessage"], "Stream missing not found.");
        assert_eq!(frames[1]["errorCode"], "PERMISSION_DENIED");
        assert_eq!(frames[1]["errorMessage"], "You are not allowed to subscribe to stream private");
        assert_eq!(frames[2]["errorCode"], "AUTHENTICATION_FAILED");
        assert_eq!(frames[2]["requestId"], "r3");

        assert_eq!(handler.registry().stream_count().await, 0);
        assert!(node.calls().subscribes.is_empty());
    }

    #[tokio::test]
    async fn test_upstream_failure_removes_stream() {
        let Setup { handler, node, .. } = setup();
        let (a, mut rx) = test_connection();
        node.fail_subscribes(true);

        handler.handle(&a, subscribe("r1", "s1", 0)).await;

        let frames = received_frames(&mut rx);
        assert_eq!(frames[0]["errorCode"], "REQUEST_FAILED");
        assert!(frames[0]["errorMessage"]
            .as_str()
            .unwrap()
            .starts_with("Subscribe request failed:"));
        assert_eq!(handler.registry().stream_count().await, 0);
        assert!(a.streams().is_empty());
    }

    #[tokio::test]
    async fn test_key_exchange_streams() {
        // Nothing is granted, so only the bypass lets partition 0 through
        let Setup { handler, .. } = setup_with(Arc::new(StaticPermissions::new()), None);
        let (a, mut rx) = test_connection();

        handler.handle(&a, subscribe("r1", "SYSTEM/keyexchange/0xabc", 0)).await;
        handler.handle(&a, subscribe("r2", "SYSTEM/keyexchange/0xabc", 1)).await;

        let frames = received_frames(&mut rx);
        assert_eq!(frames[0]["type"], "SubscribeResponse");
        assert_eq!(frames[1]["errorCode"], "INVALID_REQUEST");
        assert_eq!(
            frames[1]["errorMessage"],
            "Key exchange streams only have partition 0. Tried to subscribe to SYSTEM/keyexchange/0xabc:1"
        );
    }

    #[tokio::test]
    async fn test_dead_connection_does_not_subscribe() {
        let Setup { handler, node, .. } = setup();
        let (a, _rx) = test_connection();
        a.force_close("test");

        handler.handle(&a, subscribe("r1", "s1", 0)).await;
        assert_eq!(handler.registry().stream_count().await, 0);
        assert!(node.calls().subscribes.is_empty());
    }

    #[tokio::test]
    async fn test_publish() {
        let permissions = StaticPermissions::new()
            .grant("writer", "s1", Operation::Publish)
            .token("reader");
        let Setup { handler, node, .. } = setup_with(Arc::new(permissions), None);
        let (a, mut rx) = test_connection();

        let publish = |id: &str, token: Option<&str>, signature: Option<&str>, timestamp: i64| {
            let mut msg = json!({"streamId": "s1", "timestamp": timestamp});
            if let Some(signature) = signature {
                msg["signature"] = json!(signature);
            }
            let mut req = json!({"type": "PublishRequest", "requestId": id, "streamMessage": msg});
            if let Some(token) = token {
                req["sessionToken"] = json!(token);
            }
            request(req)
        };

        handler.handle(&a, publish("ok", Some("writer"), None, 0)).await;
        assert_eq!(node.calls().published, 1);

        handler.handle(&a, publish("denied", Some("reader"), None, 0)).await;
        handler.handle(&a, publish("anon", None, None, 0)).await;
        // Signed messages skip the publish permission check
        handler.handle(&a, publish("signed", None, Some("0xsig"), 0)).await;
        handler.handle(&a, publish("future", Some("writer"), None, i64::MAX)).await;

        let frames = received_frames(&mut rx);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0]["requestId"], "denied");
        assert_eq!(frames[0]["errorCode"], "PERMISSION_DENIED");
        assert_eq!(frames[0]["errorMessage"], "You are not allowed to write to stream s1");
        assert_eq!(frames[1]["errorCode"], "AUTHENTICATION_FAILED");
        assert_eq!(frames[2]["requestId"], "future");
        assert_eq!(frames[2]["errorCode"], "FUTURE_TIMESTAMP");
        assert_eq!(node.calls().published, 2);
    }

    #[tokio::test]
    async fn test_resend_last_order() {
        let Setup { handler, history, .. } = setup();
        for ts in [1, 2, 3, 4] {
            history.store(message("s1", ts));
        }
        let (a, mut rx) = test_connection();

        handler.handle(&a, resend_last("r1", "s1", 3)).await;

        let resending = next_frame(&mut rx).await;
        assert_eq!(resending["type"], "ResendResponseResending");
        assert_eq!(resending["requestId"], "r1");
        for ts in [2, 3, 4] {
            let frame = next_frame(&mut rx).await;
            assert_eq!(frame["type"], "UnicastMessage");
            assert_eq!(frame["requestId"], "r1");
            assert_eq!(frame["streamMessage"]["timestamp"], ts);
        }
        let done = next_frame(&mut rx).await;
        assert_eq!(done["type"], "ResendResponseResent");
        assert_eq!(done["streamId"], "s1");

        // Interest was registered, but the stream never subscribed
        assert_eq!(handler.registry().state(&key("s1", 0)).await, Some(StreamState::Init));
    }

    #[tokio::test]
    async fn test_resend_without_data() {
        let Setup { handler, history, .. } = setup();
        history.store(message("s1", 1));
        let (a, mut rx) = test_connection();

        handler.handle(&a, resend_last("r1", "empty", 5)).await;
        assert_eq!(next_frame(&mut rx).await["type"], "ResendResponseNoResend");

        handler.handle(&a, resend_last("r2", "s1", 0)).await;
        let done = next_frame(&mut rx).await;
        assert_eq!(done["type"], "ResendResponseNoResend");
        assert_eq!(done["requestId"], "r2");
    }

    #[tokio::test]
    async fn test_resend_range_and_from() {
        let Setup { handler, history, .. } = setup();
        for ts in [10, 20, 30] {
            history.store(message("s1", ts));
        }
        let (a, mut rx) = test_connection();

        handler
            .handle(
                &a,
                request(json!({
                    "type": "ResendRangeRequest",
                    "requestId": "range",
                    "streamId": "s1",
                    "fromMsgRef": {"timestamp": 15},
                    "toMsgRef": {"timestamp": 30},
                })),
            )
            .await;

        assert_eq!(next_frame(&mut rx).await["type"], "ResendResponseResending");
        assert_eq!(next_frame(&mut rx).await["streamMessage"]["timestamp"], 20);
        assert_eq!(next_frame(&mut rx).await["streamMessage"]["timestamp"], 30);
        assert_eq!(next_frame(&mut rx).await["type"], "ResendResponseResent");

        handler
            .handle(
                &a,
                request(json!({
                    "type": "ResendFromRequest",
                    "requestId": "from",
                    "streamId": "s1",
                    "fromMsgRef": {"timestamp": 31, "sequenceNumber": 0},
                })),
            )
            .await;
        assert_eq!(next_frame(&mut rx).await["type"], "ResendResponseNoResend");
    }

    enum Script {
        Fail,
        Pending,
        Items(Vec<Result<StreamMessage, ResendError>>),
    }

    struct ScriptedSource(std::sync::Mutex<Option<Script>>);

    impl ScriptedSource {
        fn new(script: Script) -> Arc<dyn HistoricalDataSource> {
            Arc::new(Self(std::sync::Mutex::new(Some(script))))
        }
    }

    #[async_trait]
    impl HistoricalDataSource for ScriptedSource {
        async fn fetch(&self, _query: &ResendQuery) -> Result<MessageStream, ResendError> {
            let script = self.0.lock().unwrap().take().unwrap_or(Script::Pending);
            match script {
                Script::Fail => Err(ResendError::StorageUnavailable {
                    attempted: 2,
                    last_error: "connection refused".into(),
                }),
                Script::Pending => Ok(stream::pending().boxed()),
                Script::Items(items) => Ok(stream::iter(items).boxed()),
            }
        }
    }

    #[tokio::test]
    async fn test_resend_fetch_failure() {
        let Setup { handler, .. } = setup_with(Arc::new(AllowAll), Some(ScriptedSource::new(Script::Fail)));
        let (a, mut rx) = test_connection();

        handler.handle(&a, resend_last("r1", "s1", 3)).await;

        let frame = next_frame(&mut rx).await;
        assert_eq!(frame["errorCode"], "RESEND_FAILED");
        assert!(frame["errorMessage"]
            .as_str()
            .unwrap()
            .starts_with("Failed to request resend from stream s1 and partition 0:"));
        assert_eq!(handler.resends().total().await, 0);
    }

    #[tokio::test]
    async fn test_resend_source_error_midway() {
        let script = Script::Items(vec![
            Ok(message("s1", 1)),
            Err(ResendError::Decode("bad line".into())),
            Ok(message("s1", 2)),
        ]);
        let Setup { handler, .. } = setup_with(Arc::new(AllowAll), Some(ScriptedSource::new(script)));
        let (a, mut rx) = test_connection();

        handler.handle(&a, resend_last("r1", "s1", 3)).await;

        assert_eq!(next_frame(&mut rx).await["type"], "ResendResponseResending");
        assert_eq!(next_frame(&mut rx).await["type"], "UnicastMessage");
        let error = next_frame(&mut rx).await;
        assert_eq!(error["errorCode"], "RESEND_FAILED");

        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.resends().total().await > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(received_frames(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_connection_close_aborts_resends() {
        let Setup { handler, .. } = setup_with(Arc::new(AllowAll), Some(ScriptedSource::new(Script::Pending)));
        let (a, mut rx) = test_connection();

        for id in ["r1", "r2", "r3"] {
            handler.handle(&a, resend_last(id, "s1", 1)).await;
        }
        assert_eq!(handler.resends().count(a.id()).await, 3);

        handler.on_connection_close(a.id()).await;
        assert_eq!(handler.resends().count(a.id()).await, 0);

        // Aborted sessions end without a completion notice
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(received_frames(&mut rx).is_empty());
        assert_eq!(handler.resends().total().await, 0);
    }

    #[tokio::test]
    async fn test_resend_permission_error() {
        let Setup { handler, .. } = setup_with(Arc::new(StaticPermissions::new().stream("s1")), None);
        let (a, mut rx) = test_connection();

        handler.handle(&a, resend_last("r1", "s1", 1)).await;
        let frames = received_frames(&mut rx);
        assert_eq!(frames[0]["errorCode"], "AUTHENTICATION_FAILED");
        assert_eq!(handler.registry().stream_count().await, 0);
    }

    #[tokio::test]
    async fn test_reject_unknown_type() {
        let Setup { handler, .. } = setup();
        let (a, mut rx) = test_connection();

        let err = decode_request(r#"{"type":"BogusRequest","requestId":"r9"}"#).unwrap_err();
        handler.reject(&a, &err);

        let frames = received_frames(&mut rx);
        assert_eq!(frames[0]["requestId"], "r9");
        assert_eq!(frames[0]["errorCode"], "INVALID_REQUEST");
        assert_eq!(frames[0]["errorMessage"], "Unknown request type: BogusRequest");
    }

    #[tokio::test]
    async fn test_close_releases_registry() {
        let Setup { handler, .. } = setup_with(Arc::new(AllowAll), Some(ScriptedSource::new(Script::Pending)));
        let (a, _rx) = test_connection();

        handler.handle(&a, subscribe("r1", "s1", 0)).await;
        handler.handle(&a, resend_last("r2", "s2", 1)).await;

        handler.close().await;
        assert_eq!(handler.registry().stream_count().await, 0);
        assert_eq!(handler.registry().pending_timers().await, 0);
        assert_eq!(handler.resends().count(a.id()).await, 0);
    }
}
