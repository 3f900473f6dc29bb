//! Connection handlers for Relay server.
//!
//! This module handles the connection lifecycle and message processing.

use crate::broker::RedisBroker;
use crate::config::{BrokerKind, Config};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{bail, Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use relay_core::{Broker, ConnectionId, Gateway, GatewayError, LocalBroker, Outbox};
use relay_protocol::events::codes;
use relay_protocol::{codec, ClientEvent, ProtocolError, ServerEvent, WireFormat};
use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Shared server state.
pub struct AppState {
    /// The connection gateway.
    pub gateway: Arc<Gateway>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(gateway: Arc<Gateway>, config: Config) -> Self {
        Self { gateway, config }
    }
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the broker cannot be reached or subscribed to, or
/// the server fails to bind.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let broker: Arc<dyn Broker> = match config.broker.kind {
        BrokerKind::Redis => Arc::new(
            RedisBroker::connect(&config.broker.url, config.broker.connect_timeout())
                .await
                .with_context(|| format!("Failed to connect to broker at {}", config.broker.url))?,
        ),
        BrokerKind::Memory => {
            warn!("Using in-process broker; messages will not cross instances");
            Arc::new(LocalBroker::new())
        }
    };

    let gateway = Arc::new(Gateway::new(broker, config.gateway()));
    let dispatcher = gateway
        .start_with(metrics::record_dispatch)
        .await
        .context("Failed to subscribe to broker")?;

    let state = Arc::new(AppState::new(gateway, config.clone()));

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Relay server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, state, dispatcher, shutdown_signal()).await?;

    info!("Relay server stopped");
    Ok(())
}

/// Serve until `shutdown` resolves or the dispatcher stops.
///
/// # Errors
///
/// Returns an error if the server fails, or if the dispatcher finishes
/// first: without the broker stream the instance can no longer deliver.
pub async fn serve<S>(
    listener: TcpListener,
    state: Arc<AppState>,
    mut dispatcher: JoinHandle<()>,
    shutdown: S,
) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let server = axum::serve(listener, build_app(state))
        .with_graceful_shutdown(shutdown)
        .into_future();

    let served = tokio::select! {
        result = server => Some(result),
        _ = &mut dispatcher => None,
    };

    match served {
        Some(result) => {
            dispatcher.abort();
            result.context("Server failed")
        }
        None => {
            error!("Broker subscription lost, shutting down");
            bail!("broker subscription ended; this instance can no longer deliver messages")
        }
    }
}

/// Build the HTTP router.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let stats = state.gateway.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "broker": state.gateway.broker_name(),
        "connections": stats.sessions.open_connections,
        "users": stats.sessions.online_users,
        "chats": stats.membership.chat_count,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let open = state.gateway.stats().sessions.open_connections;
    if open >= state.config.limits.max_connections {
        warn!(open, "Connection limit reached, refusing upgrade");
        metrics::record_error("connection_limit");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    // Events for this connection, from the dispatcher and from error replies,
    // share one queue so they reach the socket in order.
    let (outbox, mut outbound) = mpsc::unbounded_channel();
    let connection_id = state.gateway.connect(outbox.clone());

    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Replies follow the encoding of the last inbound frame.
    let mut format = WireFormat::Json;

    let connected = ServerEvent::connected(connection_id.as_str());
    if let Err(e) = send_event(&mut sender, &connected, format).await {
        error!(connection = %connection_id, error = %e, "Failed to send connected event");
        state.gateway.disconnect(&connection_id);
        return;
    }

    // Read buffer for partial binary frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            Some(event) = outbound.recv() => {
                trace!(
                    connection = %connection_id,
                    event = event.name(),
                    chat = event.chat_id().unwrap_or("-"),
                    "Emitting"
                );
                if let Err(e) = send_event(&mut sender, &event, format).await {
                    debug!(connection = %connection_id, error = %e, "Send failed");
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        format = WireFormat::Json;
                        match codec::decode(&text) {
                            Ok(event) => handle_event(&state, &connection_id, &outbox, event).await,
                            Err(e) => reject_malformed(&connection_id, &outbox, &e),
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        format = WireFormat::MessagePack;
                        read_buffer.extend_from_slice(&data);

                        loop {
                            match codec::decode_from(&mut read_buffer) {
                                Ok(Some(event)) => {
                                    handle_event(&state, &connection_id, &outbox, event).await;
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    reject_malformed(&connection_id, &outbox, &e);
                                    // An oversized prefix cannot be skipped.
                                    if matches!(e, ProtocolError::FrameTooLarge(_)) {
                                        read_buffer.clear();
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Runs on every exit path, clean or not.
    let chats = state.gateway.disconnect(&connection_id);
    metrics::set_active_chats(state.gateway.stats().membership.chat_count);

    debug!(connection = %connection_id, chats = chats.len(), "WebSocket disconnected");
}

/// Apply one client event, answering failures with an error event.
async fn handle_event(
    state: &AppState,
    connection_id: &ConnectionId,
    outbox: &Outbox,
    event: ClientEvent,
) {
    let start = Instant::now();
    let name = event.name();
    let changes_membership = matches!(
        event,
        ClientEvent::Register { .. } | ClientEvent::JoinChat { .. }
    );
    metrics::record_event(name);

    if let Err(e) = state.gateway.handle(connection_id, event).await {
        if matches!(e, GatewayError::Publish { .. }) {
            metrics::record_publish_failure();
        }
        warn!(connection = %connection_id, event = name, error = %e, "Event rejected");
        reply(outbox, ServerEvent::error(e.code(), e.to_string()));
    }

    if changes_membership {
        metrics::set_active_chats(state.gateway.stats().membership.chat_count);
    }
    metrics::record_latency(start.elapsed().as_secs_f64());
}

fn reject_malformed(connection_id: &ConnectionId, outbox: &Outbox, error: &ProtocolError) {
    debug!(connection = %connection_id, error = %error, "Malformed frame dropped");
    metrics::record_malformed();
    reply(outbox, ServerEvent::error(codes::MALFORMED, error.to_string()));
}

fn reply(outbox: &Outbox, event: ServerEvent) {
    if outbox.send(event).is_err() {
        debug!("Outbox closed, reply dropped");
    }
}

/// Send an event to the WebSocket in the given encoding.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
    format: WireFormat,
) -> Result<()> {
    let message = match format {
        WireFormat::Json => Message::Text(codec::encode(event)?),
        WireFormat::MessagePack => Message::Binary(codec::encode_binary(event)?.to_vec()),
    };
    sender.send(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use async_trait::async_trait;
    use bytes::Bytes;
    use relay_core::{BrokerError, BrokerReceiver};
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    /// Local broker that counts publishes.
    #[derive(Default)]
    struct CountingBroker {
        inner: LocalBroker,
        publishes: AtomicUsize,
    }

    impl CountingBroker {
        fn publishes(&self) -> usize {
            self.publishes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Broker for CountingBroker {
        async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError> {
            self.publishes.fetch_add(1, Ordering::SeqCst);
            self.inner.publish(channel, payload).await
        }

        async fn listen(&self, patterns: &[&str]) -> Result<BrokerReceiver, BrokerError> {
            self.inner.listen(patterns).await
        }

        fn name(&self) -> &'static str {
            self.inner.name()
        }
    }

    /// Accepts the subscription, then loses it at once.
    struct ClosedStreamBroker;

    #[async_trait]
    impl Broker for ClosedStreamBroker {
        async fn publish(&self, _channel: &str, _payload: Bytes) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn listen(&self, _patterns: &[&str]) -> Result<BrokerReceiver, BrokerError> {
            let (_sender, receiver) = mpsc::unbounded_channel();
            Ok(receiver)
        }

        fn name(&self) -> &'static str {
            "closed"
        }
    }

    async fn spawn_server_with(
        broker: Arc<dyn Broker>,
        config: Config,
    ) -> (SocketAddr, Arc<AppState>) {
        let gateway = Arc::new(Gateway::new(broker, config.gateway()));
        let dispatcher = gateway.start().await.unwrap();
        let state = Arc::new(AppState::new(gateway, config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = serve(listener, state.clone(), dispatcher, std::future::pending());
        tokio::spawn(async move { server.await.unwrap() });

        (addr, state)
    }

    async fn spawn_server(config: Config) -> (SocketAddr, Arc<AppState>) {
        spawn_server_with(Arc::new(LocalBroker::new()), config).await
    }

    fn memory_config() -> Config {
        Config {
            broker: BrokerConfig {
                kind: BrokerKind::Memory,
                ..BrokerConfig::default()
            },
            ..Config::default()
        }
    }

    async fn open(addr: SocketAddr) -> (Client, String) {
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();
        match next_event(&mut ws).await {
            ServerEvent::Connected { connection_id, .. } => (ws, connection_id),
            other => panic!("Expected connected, got {:?}", other),
        }
    }

    async fn next_event(ws: &mut Client) -> ServerEvent {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("socket closed")
            .unwrap();
        match msg {
            WsMessage::Text(text) => serde_json::from_str(&text).unwrap(),
            WsMessage::Binary(data) => codec::decode_binary(&data).unwrap(),
            other => panic!("Unexpected message {:?}", other),
        }
    }

    async fn send(ws: &mut Client, event: &str, data: serde_json::Value) {
        let text = json!({"event": event, "data": data}).to_string();
        ws.send(WsMessage::Text(text)).await.unwrap();
    }

    async fn register(ws: &mut Client, user: &str, chats: &[&str]) {
        send(ws, "register", json!({"userId": user, "chatIds": chats})).await;
    }

    async fn join(ws: &mut Client, chat: &str) {
        send(ws, "join-chat", json!({"chatId": chat})).await;
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Condition not reached");
    }

    #[tokio::test]
    async fn test_message_flow_over_websocket() {
        let (addr, state) = spawn_server(memory_config()).await;
        let (mut alice, alice_id) = open(addr).await;
        let (mut bob, bob_id) = open(addr).await;

        register(&mut alice, "alice", &["k"]).await;
        join(&mut alice, "k").await;
        register(&mut bob, "bob", &["k"]).await;

        let gateway = state.gateway.clone();
        wait_until(|| {
            gateway.viewers_of("k").contains(alice_id.as_str())
                && gateway.members_of("k").contains(bob_id.as_str())
        })
        .await;

        let message = json!({"chatId": "k", "message": {"value": "hi"}});
        send(&mut bob, "send-message", message).await;
        assert_eq!(
            next_event(&mut alice).await,
            ServerEvent::ReceivedMessage {
                chat_id: "k".into(),
                message: json!({"value": "hi"}),
                sender: bob_id.clone(),
            }
        );

        send(&mut alice, "chat-message", json!({"chatId": "k", "message": "yo"})).await;
        assert_eq!(
            next_event(&mut bob).await,
            ServerEvent::MessageNotification {
                chat_id: "k".into(),
                message: json!("yo"),
                sender: alice_id.clone(),
            }
        );
    }

    #[tokio::test]
    async fn test_errors_are_reported() {
        let (addr, _state) = spawn_server(memory_config()).await;
        let (mut ws, _) = open(addr).await;

        ws.send(WsMessage::Text("not json".into())).await.unwrap();
        assert!(matches!(
            next_event(&mut ws).await,
            ServerEvent::Error { code: codes::MALFORMED, .. }
        ));

        join(&mut ws, "k").await;
        assert!(matches!(
            next_event(&mut ws).await,
            ServerEvent::Error { code: codes::NOT_REGISTERED, .. }
        ));

        register(&mut ws, "alice", &[]).await;
        join(&mut ws, "").await;
        assert!(matches!(
            next_event(&mut ws).await,
            ServerEvent::Error { code: codes::INVALID_CHAT, .. }
        ));
    }

    #[tokio::test]
    async fn test_malformed_send_never_publishes() {
        let broker = Arc::new(CountingBroker::default());
        let (addr, state) = spawn_server_with(broker.clone(), memory_config()).await;
        let (mut ws, ws_id) = open(addr).await;

        register(&mut ws, "alice", &["k"]).await;
        let gateway = state.gateway.clone();
        wait_until(|| gateway.is_online(&ws_id)).await;

        let rejected = [
            (json!({"chatId": "k", "message": null}), codes::MALFORMED),
            (json!({"message": "hi"}), codes::MALFORMED),
            (json!({"chatId": "k"}), codes::MALFORMED),
            (json!({"chatId": "", "message": "hi"}), codes::INVALID_CHAT),
        ];
        for (data, expected) in rejected {
            send(&mut ws, "send-message", data).await;
            match next_event(&mut ws).await {
                ServerEvent::Error { code, .. } => assert_eq!(code, expected),
                other => panic!("Expected error, got {:?}", other),
            }
        }
        assert_eq!(broker.publishes(), 0);

        send(&mut ws, "send-message", json!({"chatId": "k", "message": "hi"})).await;
        wait_until(|| broker.publishes() == 1).await;
    }

    #[tokio::test]
    async fn test_binary_frames_get_binary_replies() {
        let (addr, state) = spawn_server(memory_config()).await;
        let (mut alice, alice_id) = open(addr).await;
        let (mut bob, _) = open(addr).await;

        let frame = codec::encode_binary(&ClientEvent::register("alice", ["k"])).unwrap();
        alice.send(WsMessage::Binary(frame.to_vec())).await.unwrap();
        let frame = codec::encode_binary(&ClientEvent::join("k")).unwrap();
        alice.send(WsMessage::Binary(frame.to_vec())).await.unwrap();
        register(&mut bob, "bob", &[]).await;

        let gateway = state.gateway.clone();
        wait_until(|| {
            gateway.viewers_of("k").contains(alice_id.as_str()) && gateway.is_user_online("bob")
        })
        .await;

        send(&mut bob, "typing", json!({"chatId": "k", "name": "Bob"})).await;
        send(&mut bob, "send-message", json!({"chatId": "k", "message": "hi"})).await;

        let typing = tokio::time::timeout(Duration::from_secs(2), alice.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(typing, WsMessage::Binary(_)));
        assert!(matches!(
            next_event(&mut alice).await,
            ServerEvent::ReceivedMessage { .. }
        ));
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up() {
        let (addr, state) = spawn_server(memory_config()).await;
        let (mut alice, alice_id) = open(addr).await;

        register(&mut alice, "alice", &["k"]).await;
        join(&mut alice, "k").await;

        let gateway = state.gateway.clone();
        wait_until(|| gateway.viewers_of("k").contains(alice_id.as_str())).await;

        alice.close(None).await.unwrap();
        wait_until(|| !gateway.is_online(&alice_id)).await;
        assert!(!gateway.has_chat("k"));
        assert!(!gateway.is_user_online("alice"));
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let mut config = memory_config();
        config.limits.max_connections = 1;
        let (addr, _state) = spawn_server(config).await;

        let (_first, _) = open(addr).await;
        let refused = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr)).await;
        assert!(refused.is_err());
    }

    #[tokio::test]
    async fn test_lost_subscription_stops_server() {
        let config = memory_config();
        let gateway = Arc::new(Gateway::new(Arc::new(ClosedStreamBroker), config.gateway()));
        let dispatcher = gateway.start().await.unwrap();
        let state = Arc::new(AppState::new(gateway, config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let server = serve(listener, state, dispatcher, std::future::pending());
        let result = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .expect("server kept running without a broker stream");

        let err = result.unwrap_err();
        assert!(err.to_string().contains("broker subscription ended"));
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let config = memory_config();
        let gateway = Arc::new(Gateway::new(Arc::new(LocalBroker::new()), config.gateway()));
        let dispatcher = gateway.start().await.unwrap();
        let state = Arc::new(AppState::new(gateway, config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let server = serve(listener, state, dispatcher, async {});
        let result = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .expect("server ignored shutdown");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_health() {
        let (_addr, state) = spawn_server(memory_config()).await;
        let Json(body) = health_handler(State(state)).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["broker"], "local");
        assert_eq!(body["connections"], 0);
    }
}
