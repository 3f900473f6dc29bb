//! Connection gateway for Relay.
//!
//! The gateway owns the lifecycle of local connections and turns inbound
//! client events into membership bookkeeping and broker publishes. It never
//! delivers a message to a local connection itself: delivery only happens
//! when the dispatcher observes the publish on the broker, on this instance
//! and every other one alike.

use crate::broker::{Broker, BrokerError, BrokerMessage};
use crate::dispatcher::{DispatchError, DispatchReport, Dispatcher};
use crate::membership::{MembershipError, MembershipIndex, MembershipStats};
use crate::session::{ConnectionId, Outbox, SessionRegistry, SessionStats};
use bytes::Bytes;
use parking_lot::RwLock;
use relay_protocol::channel::{
    chat_channel, STOPPED_TYPING_CHANNEL, SUBSCRIPTION_PATTERNS, TYPING_CHANNEL,
};
use relay_protocol::events::codes;
use relay_protocol::{
    envelope, validate_chat_id, ChatEnvelope, ChatId, ClientEvent, ProtocolError, TypingEnvelope,
};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Gateway errors.
///
/// All of these are local to one client action; none of them affect other
/// connections or the gateway process, except [`GatewayError::Subscribe`]
/// at startup.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The connection is not open on this gateway.
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// The action requires a registered connection.
    #[error("Connection not registered: {0}")]
    NotRegistered(String),

    /// The chat id is not acceptable.
    #[error("Invalid chat id {chat_id:?}: {reason}")]
    InvalidChat {
        chat_id: String,
        reason: &'static str,
    },

    /// A membership limit was hit.
    #[error(transparent)]
    Membership(#[from] MembershipError),

    /// The broker envelope could not be encoded.
    #[error("Failed to encode envelope: {0}")]
    Encode(#[from] ProtocolError),

    /// The broker rejected or timed out a publish.
    #[error("Publish to {channel} failed: {source}")]
    Publish {
        channel: String,
        #[source]
        source: BrokerError,
    },

    /// The startup subscription failed. Fatal to the instance.
    #[error("Broker subscription failed: {0}")]
    Subscribe(#[source] BrokerError),
}

impl GatewayError {
    /// Error code reported to the client.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            GatewayError::UnknownConnection(_) | GatewayError::NotRegistered(_) => {
                codes::NOT_REGISTERED
            }
            GatewayError::InvalidChat { .. } => codes::INVALID_CHAT,
            GatewayError::Membership(_) => codes::LIMIT_EXCEEDED,
            GatewayError::Encode(_) => codes::MALFORMED,
            GatewayError::Publish { .. } | GatewayError::Subscribe(_) => codes::SEND_FAILED,
        }
    }
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Upper bound on a single broker publish.
    pub publish_timeout: Duration,
    /// Upper bound on the startup subscription.
    pub subscribe_timeout: Duration,
    /// Maximum chats a single connection may belong to.
    pub max_chats_per_connection: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(5),
            subscribe_timeout: Duration::from_secs(10),
            max_chats_per_connection: crate::membership::DEFAULT_MAX_CHATS_PER_CONNECTION,
        }
    }
}

/// Result of a `register` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// The connection is now online with this many chat memberships.
    Registered { chats: usize },
    /// The connection was already registered; nothing changed.
    AlreadyRegistered,
}

/// The connection gateway for one instance.
pub struct Gateway {
    /// Single lock serializing every membership mutation on this instance.
    index: Arc<RwLock<MembershipIndex>>,
    sessions: Arc<SessionRegistry>,
    broker: Arc<dyn Broker>,
    config: GatewayConfig,
}

impl Gateway {
    /// Create a gateway on top of a broker.
    ///
    /// Nothing is delivered until [`Gateway::start`] subscribes.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, config: GatewayConfig) -> Self {
        info!(broker = broker.name(), ?config, "Creating gateway");
        Self {
            index: Arc::new(RwLock::new(MembershipIndex::with_limit(
                config.max_chats_per_connection,
            ))),
            sessions: Arc::new(SessionRegistry::new()),
            broker,
            config,
        }
    }

    /// Subscribe to every chat and typing channel and start dispatching.
    ///
    /// The returned task finishes only if the broker stream ends, after
    /// which nothing reaches local connections; callers treat that as fatal.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker cannot be subscribed to in time. The
    /// instance cannot take part in fan-out without it.
    pub async fn start(&self) -> Result<JoinHandle<()>, GatewayError> {
        self.start_with(|_, _| {}).await
    }

    /// Like [`Gateway::start`], reporting every dispatch outcome to `observer`.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker cannot be subscribed to in time.
    pub async fn start_with<F>(&self, observer: F) -> Result<JoinHandle<()>, GatewayError>
    where
        F: FnMut(&BrokerMessage, &Result<DispatchReport, DispatchError>) + Send + 'static,
    {
        let receiver = match tokio::time::timeout(
            self.config.subscribe_timeout,
            self.broker.listen(&SUBSCRIPTION_PATTERNS),
        )
        .await
        {
            Ok(Ok(receiver)) => receiver,
            Ok(Err(e)) => return Err(GatewayError::Subscribe(e)),
            Err(_) => return Err(GatewayError::Subscribe(BrokerError::Timeout)),
        };

        info!(broker = self.broker.name(), patterns = ?SUBSCRIPTION_PATTERNS, "Subscribed");
        Ok(tokio::spawn(self.dispatcher().run_with(receiver, observer)))
    }

    /// Get a dispatcher sharing this gateway's state.
    #[must_use]
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.index.clone(), self.sessions.clone())
    }

    /// Open a new connection. It has no user and no chats yet.
    pub fn connect(&self, outbox: Outbox) -> ConnectionId {
        let connection_id = ConnectionId::generate();
        self.sessions.open(connection_id.clone(), outbox);
        connection_id
    }

    /// Associate a connection with a user and the chats they belong to.
    ///
    /// A second registration of an online connection changes nothing. The
    /// chat list is validated as a whole before any state changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown, a chat id is invalid,
    /// or the list exceeds the per-connection limit.
    pub fn register(
        &self,
        connection_id: &ConnectionId,
        user_id: &str,
        chat_ids: &[ChatId],
    ) -> Result<RegisterOutcome, GatewayError> {
        if !self.sessions.is_open(connection_id.as_str()) {
            return Err(GatewayError::UnknownConnection(connection_id.to_string()));
        }
        for chat_id in chat_ids {
            check_chat_id(chat_id)?;
        }
        let unique: HashSet<&str> = chat_ids.iter().map(String::as_str).collect();
        if unique.len() > self.config.max_chats_per_connection {
            return Err(MembershipError::LimitReached(self.config.max_chats_per_connection).into());
        }

        if !self.sessions.register(connection_id, user_id) {
            debug!(connection = %connection_id, user = %user_id, "Already registered, ignoring");
            return Ok(RegisterOutcome::AlreadyRegistered);
        }

        if unique.is_empty() {
            info!(connection = %connection_id, user = %user_id, "Registered with no chats");
        } else {
            let mut index = self.index.write();
            for chat_id in &unique {
                index.add_membership(connection_id, chat_id)?;
            }
        }

        debug!(connection = %connection_id, user = %user_id, chats = unique.len(), "Registered");
        Ok(RegisterOutcome::Registered {
            chats: unique.len(),
        })
    }

    /// Mark a connection as viewing a chat. Grants membership if needed.
    ///
    /// Returns `true` if the connection was not already viewing it.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not registered, the chat id is
    /// invalid, or the membership limit is reached.
    pub fn join(&self, connection_id: &ConnectionId, chat_id: &str) -> Result<bool, GatewayError> {
        self.require_online(connection_id)?;
        check_chat_id(chat_id)?;

        let added = self.index.write().add_view(connection_id, chat_id)?;
        debug!(connection = %connection_id, chat = %chat_id, added, "Joined chat");
        Ok(added)
    }

    /// Stop a connection viewing a chat. Membership is kept, so the
    /// connection keeps receiving notifications for it.
    ///
    /// Returns `true` if the connection was viewing the chat.
    pub fn leave(&self, connection_id: &ConnectionId, chat_id: &str) -> bool {
        let removed = self.index.write().remove_view(connection_id, chat_id);
        debug!(connection = %connection_id, chat = %chat_id, removed, "Left chat");
        removed
    }

    /// Publish a message to a chat on behalf of a connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not registered, the chat id is
    /// invalid, or the broker publish fails or times out. Failed publishes
    /// are not retried.
    pub async fn send_message(
        &self,
        connection_id: &ConnectionId,
        chat_id: &str,
        message: Value,
    ) -> Result<(), GatewayError> {
        self.require_online(connection_id)?;
        check_chat_id(chat_id)?;

        let payload = envelope::encode(&ChatEnvelope::new(message, connection_id.as_str()))?;
        self.publish(chat_channel(chat_id), payload).await?;

        debug!(connection = %connection_id, chat = %chat_id, "Message published");
        Ok(())
    }

    /// Announce that the connection's user started typing in a chat.
    ///
    /// # Errors
    ///
    /// Same as [`Gateway::send_message`].
    pub async fn typing(
        &self,
        connection_id: &ConnectionId,
        chat_id: &str,
        name: &str,
    ) -> Result<(), GatewayError> {
        self.publish_typing(TYPING_CHANNEL, connection_id, chat_id, Some(name))
            .await
    }

    /// Announce that the connection's user stopped typing in a chat.
    ///
    /// # Errors
    ///
    /// Same as [`Gateway::send_message`].
    pub async fn stopped_typing(
        &self,
        connection_id: &ConnectionId,
        chat_id: &str,
    ) -> Result<(), GatewayError> {
        self.publish_typing(STOPPED_TYPING_CHANNEL, connection_id, chat_id, None)
            .await
    }

    /// Tear a connection down: drop every membership and view it held, and
    /// take it offline.
    ///
    /// Must run on every disconnection, clean or not. Safe to call twice.
    /// Returns the chats the connection was removed from.
    pub fn disconnect(&self, connection_id: &ConnectionId) -> Vec<ChatId> {
        let chats = self.index.write().cleanup_connection(connection_id.as_str());
        let user = self.sessions.close(connection_id.as_str());

        debug!(
            connection = %connection_id,
            user = user.as_deref().unwrap_or("-"),
            chats = chats.len(),
            "Disconnected"
        );
        chats
    }

    /// Handle one inbound client event.
    ///
    /// # Errors
    ///
    /// Returns the error of the underlying operation.
    pub async fn handle(
        &self,
        connection_id: &ConnectionId,
        event: ClientEvent,
    ) -> Result<(), GatewayError> {
        match event {
            ClientEvent::Register { user_id, chat_ids } => {
                self.register(connection_id, &user_id, &chat_ids)?;
            }
            ClientEvent::JoinChat { chat_id } => {
                self.join(connection_id, &chat_id)?;
            }
            ClientEvent::LeaveChat { chat_id } => {
                self.leave(connection_id, &chat_id);
            }
            ClientEvent::SendMessage { chat_id, message } => {
                self.send_message(connection_id, &chat_id, message).await?;
            }
            ClientEvent::Typing { chat_id, name } => {
                self.typing(connection_id, &chat_id, &name).await?;
            }
            ClientEvent::StoppedTyping { chat_id, .. } => {
                self.stopped_typing(connection_id, &chat_id).await?;
            }
        }
        Ok(())
    }

    /// Check if a connection is registered on this instance.
    #[must_use]
    pub fn is_online(&self, connection_id: &str) -> bool {
        self.sessions.is_online(connection_id)
    }

    /// Check if a user has a registered connection on this instance.
    #[must_use]
    pub fn is_user_online(&self, user_id: &str) -> bool {
        self.sessions.is_user_online(user_id)
    }

    /// Get a user's registered connections on this instance.
    #[must_use]
    pub fn connections_of(&self, user_id: &str) -> Vec<ConnectionId> {
        self.sessions.connections_of(user_id)
    }

    /// Get the local member connections of a chat.
    #[must_use]
    pub fn members_of(&self, chat_id: &str) -> HashSet<ConnectionId> {
        self.index.read().members_of(chat_id)
    }

    /// Get the local connections viewing a chat.
    #[must_use]
    pub fn viewers_of(&self, chat_id: &str) -> HashSet<ConnectionId> {
        self.index.read().viewers_of(chat_id)
    }

    /// Check if any local connection belongs to a chat.
    #[must_use]
    pub fn has_chat(&self, chat_id: &str) -> bool {
        self.index.read().contains_chat(chat_id)
    }

    /// Get the broker name.
    #[must_use]
    pub fn broker_name(&self) -> &'static str {
        self.broker.name()
    }

    /// Get gateway statistics.
    #[must_use]
    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            sessions: self.sessions.stats(),
            membership: self.index.read().stats(),
        }
    }

    fn require_online(&self, connection_id: &ConnectionId) -> Result<(), GatewayError> {
        if self.sessions.is_online(connection_id.as_str()) {
            Ok(())
        } else {
            Err(GatewayError::NotRegistered(connection_id.to_string()))
        }
    }

    async fn publish_typing(
        &self,
        channel: &str,
        connection_id: &ConnectionId,
        chat_id: &str,
        name: Option<&str>,
    ) -> Result<(), GatewayError> {
        self.require_online(connection_id)?;
        check_chat_id(chat_id)?;

        let payload = envelope::encode(&TypingEnvelope {
            chat_id: chat_id.to_string(),
            name: name.filter(|n| !n.is_empty()).map(str::to_string),
            sender: connection_id.to_string(),
        })?;
        self.publish(channel.to_string(), payload).await
    }

    /// Publish with the configured timeout.
    async fn publish(&self, channel: String, payload: Bytes) -> Result<(), GatewayError> {
        let publish = self.broker.publish(&channel, payload);
        let result = tokio::time::timeout(self.config.publish_timeout, publish).await;

        let source = match result {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e,
            Err(_) => BrokerError::Timeout,
        };

        error!(channel = %channel, error = %source, "Broker publish failed");
        Err(GatewayError::Publish { channel, source })
    }
}

/// Gateway statistics.
#[derive(Debug, Clone, Copy)]
pub struct GatewayStats {
    /// Session registry statistics.
    pub sessions: SessionStats,
    /// Membership index statistics.
    pub membership: MembershipStats,
}

fn check_chat_id(chat_id: &str) -> Result<(), GatewayError> {
    validate_chat_id(chat_id).map_err(|reason| {
        warn!(chat = %chat_id, reason, "Rejected chat id");
        GatewayError::InvalidChat {
            chat_id: chat_id.to_string(),
            reason,
        }
    })
}
