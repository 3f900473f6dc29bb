//! # relay-core
//!
//! Connection bookkeeping and message fan-out for the Relay chat gateway.
//!
//! This crate provides the building blocks of one gateway instance:
//!
//! - **MembershipIndex** - Which local connections belong to / view which chats
//! - **SessionRegistry** - Live connections, their users and outboxes
//! - **Broker** - Publish/subscribe bus shared by every instance
//! - **Dispatcher** - Turns broker events into per-connection emits
//! - **Gateway** - Connection lifecycle and inbound event handling
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  publish  ┌─────────────┐  listen   ┌─────────────┐
//! │   Gateway   │──────────▶│   Broker    │──────────▶│ Dispatcher  │
//! └─────────────┘           └─────────────┘           └─────────────┘
//!        │ writes                                        reads │
//!        ▼                                                     ▼
//! ┌─────────────┐                                     ┌─────────────┐
//! │ Membership  │◀────────────────────────────────────│  Sessions   │
//! └─────────────┘                                     └─────────────┘
//! ```
//!
//! Messages are never delivered locally by the publishing gateway; every
//! instance, including the publisher's, delivers only what it observes on
//! the broker.

pub mod broker;
pub mod dispatcher;
pub mod gateway;
pub mod membership;
pub mod session;

pub use broker::{Broker, BrokerError, BrokerMessage, BrokerReceiver, LocalBroker};
pub use dispatcher::{DispatchError, DispatchReport, Dispatcher};
pub use gateway::{Gateway, GatewayConfig, GatewayError, GatewayStats, RegisterOutcome};
pub use membership::{MembershipIndex, MembershipStats};
pub use session::{ConnectionId, Outbox, SessionRegistry, SessionStats};
