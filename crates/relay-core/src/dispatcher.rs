//! Fan-out dispatcher for Relay.
//!
//! Turns one broker message into emits to the qualifying local connections.
//! For a chat message, viewers of the chat get `received-message` and the
//! remaining members get `message-notification`; no connection gets both.
//! The publishing connection never receives its own event back.
//!
//! Broker messages are handled strictly one at a time in arrival order, so
//! the broker's per-channel ordering carries through to every connection.

use crate::broker::{BrokerMessage, BrokerReceiver};
use crate::membership::{Audience, MembershipIndex};
use crate::session::SessionRegistry;
use parking_lot::RwLock;
use relay_protocol::channel::{chat_id_from_channel, STOPPED_TYPING_CHANNEL, TYPING_CHANNEL};
use relay_protocol::{
    envelope, validate_chat_id, ChatEnvelope, ProtocolError, ServerEvent, TypingEnvelope,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// Dispatch errors. None of them affect other messages or connections.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The payload is not a valid envelope for its channel.
    #[error("Malformed payload on {channel}: {source}")]
    Malformed {
        channel: String,
        #[source]
        source: ProtocolError,
    },

    /// A typing envelope named an unacceptable chat id.
    #[error("Invalid chat id on {channel}: {reason}")]
    InvalidChat {
        channel: String,
        reason: &'static str,
    },

    /// The channel is outside the gateway's namespace.
    #[error("Unexpected channel: {0}")]
    UnknownChannel(String),
}

/// What a single dispatch emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// `received-message` emits.
    pub messages: usize,
    /// `message-notification` emits.
    pub notifications: usize,
    /// `user_typing` / `user_stopped_typing` emits.
    pub typing: usize,
    /// Targets that disconnected before the emit.
    pub skipped: usize,
}

impl DispatchReport {
    /// Total number of emits.
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.messages + self.notifications + self.typing
    }
}

/// Consumes broker messages and emits to local connections.
#[derive(Clone)]
pub struct Dispatcher {
    index: Arc<RwLock<MembershipIndex>>,
    sessions: Arc<SessionRegistry>,
}

impl Dispatcher {
    /// Create a dispatcher reading the given index and sessions.
    #[must_use]
    pub fn new(index: Arc<RwLock<MembershipIndex>>, sessions: Arc<SessionRegistry>) -> Self {
        Self { index, sessions }
    }

    /// Dispatch one broker message.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be interpreted. Nothing is
    /// emitted in that case.
    pub fn dispatch(&self, message: &BrokerMessage) -> Result<DispatchReport, DispatchError> {
        match message.channel.as_str() {
            TYPING_CHANNEL => self.dispatch_typing(message, false),
            STOPPED_TYPING_CHANNEL => self.dispatch_typing(message, true),
            channel => match chat_id_from_channel(channel) {
                Some(chat_id) => self.dispatch_chat(chat_id, message),
                None => Err(DispatchError::UnknownChannel(channel.to_string())),
            },
        }
    }

    /// Consume the broker stream until it ends, reporting every message
    /// and its outcome to `observer`.
    ///
    /// Returning means the instance no longer receives broker traffic.
    pub async fn run_with<F>(self, mut receiver: BrokerReceiver, mut observer: F)
    where
        F: FnMut(&BrokerMessage, &Result<DispatchReport, DispatchError>) + Send,
    {
        debug!("Dispatcher started");

        while let Some(message) = receiver.recv().await {
            let outcome = self.dispatch(&message);
            if let Err(e) = &outcome {
                warn!(channel = %message.channel, error = %e, "Dropping broker message");
            }
            observer(&message, &outcome);
        }

        error!("Broker stream ended, dispatcher stopped");
    }

    fn dispatch_chat(
        &self,
        chat_id: &str,
        message: &BrokerMessage,
    ) -> Result<DispatchReport, DispatchError> {
        let envelope: ChatEnvelope =
            envelope::decode(&message.payload).map_err(|source| DispatchError::Malformed {
                channel: message.channel.clone(),
                source,
            })?;

        let Audience { viewers, members } = self.index.read().audience(chat_id);
        let mut report = DispatchReport::default();

        for conn in viewers.iter().filter(|c| c.as_str() != envelope.sender) {
            let event = ServerEvent::ReceivedMessage {
                chat_id: chat_id.to_string(),
                message: envelope.message.clone(),
                sender: envelope.sender.clone(),
            };
            if self.sessions.deliver(conn.as_str(), event) {
                report.messages += 1;
            } else {
                report.skipped += 1;
            }
        }

        for conn in members.iter().filter(|c| c.as_str() != envelope.sender) {
            let event = ServerEvent::MessageNotification {
                chat_id: chat_id.to_string(),
                message: envelope.message.clone(),
                sender: envelope.sender.clone(),
            };
            if self.sessions.deliver(conn.as_str(), event) {
                report.notifications += 1;
            } else {
                report.skipped += 1;
            }
        }

        trace!(
            chat = %chat_id,
            sender = %envelope.sender,
            messages = report.messages,
            notifications = report.notifications,
            "Chat message dispatched"
        );
        Ok(report)
    }

    fn dispatch_typing(
        &self,
        message: &BrokerMessage,
        stopped: bool,
    ) -> Result<DispatchReport, DispatchError> {
        let envelope: TypingEnvelope =
            envelope::decode(&message.payload).map_err(|source| DispatchError::Malformed {
                channel: message.channel.clone(),
                source,
            })?;
        validate_chat_id(&envelope.chat_id).map_err(|reason| DispatchError::InvalidChat {
            channel: message.channel.clone(),
            reason,
        })?;

        let audience = self.index.read().audience(&envelope.chat_id);
        let mut report = DispatchReport::default();

        let targets = audience
            .viewers
            .iter()
            .chain(audience.members.iter())
            .filter(|c| c.as_str() != envelope.sender);

        for conn in targets {
            let event = if stopped {
                ServerEvent::UserStoppedTyping {
                    chat_id: envelope.chat_id.clone(),
                    sender: envelope.sender.clone(),
                }
            } else {
                ServerEvent::UserTyping {
                    chat_id: envelope.chat_id.clone(),
                    name: envelope.name.clone().unwrap_or_default(),
                    sender: envelope.sender.clone(),
                }
            };
            if self.sessions.deliver(conn.as_str(), event) {
                report.typing += 1;
            } else {
                report.skipped += 1;
            }
        }

        trace!(chat = %envelope.chat_id, stopped, recipients = report.typing, "Typing dispatched");
        Ok(report)
    }
}
