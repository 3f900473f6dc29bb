//! # relay-protocol
//!
//! Wire protocol definitions for the Relay chat gateway.
//!
//! This crate defines everything that crosses a process boundary:
//! events exchanged with clients, envelopes exchanged with other gateway
//! instances through the broker, and the channel naming convention that
//! ties the two together.
//!
//! ## Events
//!
//! - `register` / `join-chat` / `leave-chat` - Connection and chat bookkeeping
//! - `send-message` - Publish a message to a chat
//! - `typing` / `stopped-typing` - Ephemeral typing indicators
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, ClientEvent};
//!
//! let event = codec::decode(r#"{"event":"join-chat","data":{"chatId":"42"}}"#).unwrap();
//! assert_eq!(event, ClientEvent::join("42"));
//! ```

pub mod channel;
pub mod codec;
pub mod envelope;
pub mod events;

pub use channel::{chat_channel, chat_id_from_channel, validate_chat_id};
pub use codec::{decode, encode, ProtocolError, WireFormat};
pub use envelope::{ChatEnvelope, TypingEnvelope};
pub use events::{ClientEvent, ServerEvent};

/// Protocol version announced in the `connected` event.
pub const PROTOCOL_VERSION: &str = "1.0";

/// A chat identifier, opaque to the gateway.
pub type ChatId = String;

/// A user identifier, opaque to the gateway.
pub type UserId = String;
