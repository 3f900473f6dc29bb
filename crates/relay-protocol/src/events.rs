//! Client-facing events.
//!
//! Every event is a JSON object `{"event": <name>, "data": {...}}`. Field
//! names inside `data` are camelCase. Message bodies are opaque to the
//! gateway and carried as raw JSON values.

use crate::{ChatId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error codes carried by [`ServerEvent::Error`].
pub mod codes {
    /// The inbound payload could not be decoded or is missing fields.
    pub const MALFORMED: u16 = 1001;
    /// The connection has not registered a user yet.
    pub const NOT_REGISTERED: u16 = 1002;
    /// The chat id is not acceptable.
    pub const INVALID_CHAT: u16 = 1003;
    /// A per-connection limit was exceeded.
    pub const LIMIT_EXCEEDED: u16 = 1004;
    /// The broker rejected or timed out the publish.
    pub const SEND_FAILED: u16 = 1005;
}

/// An event sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Associate the connection with a user and the chats they belong to.
    #[serde(rename = "register", rename_all = "camelCase")]
    Register {
        /// Opaque user identifier, trusted as given.
        user_id: UserId,
        /// Chats the user participates in, fetched by the caller.
        #[serde(default)]
        chat_ids: Vec<ChatId>,
    },

    /// The client opened a chat.
    #[serde(rename = "join-chat", rename_all = "camelCase")]
    JoinChat {
        /// Chat being opened.
        chat_id: ChatId,
    },

    /// The client closed a chat.
    #[serde(rename = "leave-chat", rename_all = "camelCase")]
    LeaveChat {
        /// Chat being closed.
        chat_id: ChatId,
    },

    /// Publish a message to a chat.
    #[serde(rename = "send-message", alias = "chat-message", rename_all = "camelCase")]
    SendMessage {
        /// Target chat.
        chat_id: ChatId,
        /// Message body, relayed verbatim.
        message: Value,
    },

    /// The user started typing in a chat.
    #[serde(rename = "typing", rename_all = "camelCase")]
    Typing {
        /// Chat being typed in.
        chat_id: ChatId,
        /// Display name shown to other participants.
        name: String,
    },

    /// The user stopped typing in a chat.
    #[serde(rename = "stopped-typing", rename_all = "camelCase")]
    StoppedTyping {
        /// Chat that was being typed in.
        chat_id: ChatId,
        /// Display name, not forwarded.
        #[serde(default)]
        name: String,
    },
}

impl ClientEvent {
    /// Get the wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Register { .. } => "register",
            ClientEvent::JoinChat { .. } => "join-chat",
            ClientEvent::LeaveChat { .. } => "leave-chat",
            ClientEvent::SendMessage { .. } => "send-message",
            ClientEvent::Typing { .. } => "typing",
            ClientEvent::StoppedTyping { .. } => "stopped-typing",
        }
    }

    /// Create a new Register event.
    #[must_use]
    pub fn register<I, S>(user_id: impl Into<UserId>, chat_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ChatId>,
    {
        ClientEvent::Register {
            user_id: user_id.into(),
            chat_ids: chat_ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Create a new JoinChat event.
    #[must_use]
    pub fn join(chat_id: impl Into<ChatId>) -> Self {
        ClientEvent::JoinChat {
            chat_id: chat_id.into(),
        }
    }

    /// Create a new LeaveChat event.
    #[must_use]
    pub fn leave(chat_id: impl Into<ChatId>) -> Self {
        ClientEvent::LeaveChat {
            chat_id: chat_id.into(),
        }
    }

    /// Create a new SendMessage event.
    #[must_use]
    pub fn send_message(chat_id: impl Into<ChatId>, message: impl Into<Value>) -> Self {
        ClientEvent::SendMessage {
            chat_id: chat_id.into(),
            message: message.into(),
        }
    }

    /// Create a new Typing event.
    #[must_use]
    pub fn typing(chat_id: impl Into<ChatId>, name: impl Into<String>) -> Self {
        ClientEvent::Typing {
            chat_id: chat_id.into(),
            name: name.into(),
        }
    }

    /// Create a new StoppedTyping event.
    #[must_use]
    pub fn stopped_typing(chat_id: impl Into<ChatId>, name: impl Into<String>) -> Self {
        ClientEvent::StoppedTyping {
            chat_id: chat_id.into(),
            name: name.into(),
        }
    }
}

/// An event emitted to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Sent once the transport is up.
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected {
        /// Identifier assigned to this connection.
        connection_id: String,
        /// Protocol version spoken by the gateway.
        version: String,
    },

    /// A message in a chat the connection is viewing.
    #[serde(rename = "received-message", rename_all = "camelCase")]
    ReceivedMessage {
        chat_id: ChatId,
        message: Value,
        /// Connection that published the message.
        sender: String,
    },

    /// A message in a chat the connection belongs to but is not viewing.
    #[serde(rename = "message-notification", rename_all = "camelCase")]
    MessageNotification {
        chat_id: ChatId,
        message: Value,
        sender: String,
    },

    #[serde(rename = "user_typing", rename_all = "camelCase")]
    UserTyping {
        chat_id: ChatId,
        name: String,
        sender: String,
    },

    #[serde(rename = "user_stopped_typing", rename_all = "camelCase")]
    UserStoppedTyping { chat_id: ChatId, sender: String },

    /// A client action was rejected or failed.
    #[serde(rename = "error")]
    Error {
        /// Error code, see [`codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },
}

impl ServerEvent {
    /// Get the wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::ReceivedMessage { .. } => "received-message",
            ServerEvent::MessageNotification { .. } => "message-notification",
            ServerEvent::UserTyping { .. } => "user_typing",
            ServerEvent::UserStoppedTyping { .. } => "user_stopped_typing",
            ServerEvent::Error { .. } => "error",
        }
    }

    /// Create a new Connected event.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>) -> Self {
        ServerEvent::Connected {
            connection_id: connection_id.into(),
            version: crate::PROTOCOL_VERSION.to_string(),
        }
    }

    /// Create a new Error event.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }

    /// Get the chat this event belongs to, if any.
    #[must_use]
    pub fn chat_id(&self) -> Option<&str> {
        match self {
            ServerEvent::ReceivedMessage { chat_id, .. }
            | ServerEvent::MessageNotification { chat_id, .. }
            | ServerEvent::UserTyping { chat_id, .. }
            | ServerEvent::UserStoppedTyping { chat_id, .. } => Some(chat_id),
            ServerEvent::Connected { .. } | ServerEvent::Error { .. } => None,
        }
    }
}
