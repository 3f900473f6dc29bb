//! Broker bridge for Relay.
//!
//! Gateway instances never talk to each other directly. Everything crosses
//! instances through a publish/subscribe bus behind the [`Broker`] trait.
//! Publishing and listening are separate so a slow consumer never holds up
//! outgoing publishes.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use relay_protocol::channel::matches_pattern;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Stream of messages matching a listener's patterns, in publish order per channel.
pub type BrokerReceiver = mpsc::UnboundedReceiver<BrokerMessage>;

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker cannot be reached.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The broker did not answer in time.
    #[error("Broker operation timed out")]
    Timeout,

    /// The listener stream has ended.
    #[error("Broker subscription closed")]
    Closed,

    /// Backend-specific failure.
    #[error("Broker error: {0}")]
    Backend(String),
}

/// A message observed on the broker.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Raw payload as published.
    pub payload: Bytes,
    /// When this instance received the message.
    pub received_at: Instant,
}

impl BrokerMessage {
    /// Create a new broker message.
    #[must_use]
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
            received_at: Instant::now(),
        }
    }
}

/// A publish/subscribe bus shared by every gateway instance.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a payload to a channel.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Subscribe to every channel matching one of the patterns.
    ///
    /// Patterns use `*` and `?` globbing. Messages on a single channel are
    /// yielded in publish order.
    async fn listen(&self, patterns: &[&str]) -> Result<BrokerReceiver, BrokerError>;

    /// Get the broker name (e.g., "redis", "local").
    fn name(&self) -> &'static str;
}

/// A listener registered with the local broker.
struct Listener {
    patterns: Vec<String>,
    sender: mpsc::UnboundedSender<BrokerMessage>,
}

/// In-process broker.
///
/// Serves single-instance deployments, and lets several gateways share one
/// bus in the same process as if they were separate instances.
pub struct LocalBroker {
    listeners: Mutex<Vec<Listener>>,
    available: AtomicBool,
}

impl LocalBroker {
    /// Create a new local broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the broker going down or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Get the number of live listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .iter()
            .filter(|l| !l.sender.is_closed())
            .count()
    }

    fn ensure_available(&self) -> Result<(), BrokerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("local broker is down".into()))
        }
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for LocalBroker {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.ensure_available()?;

        // Holding the lock across the fan-out keeps per-channel order identical
        // for every listener.
        let mut listeners = self.listeners.lock();
        listeners.retain(|l| !l.sender.is_closed());

        let mut delivered = 0;
        for listener in listeners.iter() {
            if listener
                .patterns
                .iter()
                .any(|p| matches_pattern(p, channel))
                && listener
                    .sender
                    .send(BrokerMessage::new(channel, payload.clone()))
                    .is_ok()
            {
                delivered += 1;
            }
        }

        trace!(channel = %channel, listeners = delivered, "Published to local broker");
        Ok(())
    }

    async fn listen(&self, patterns: &[&str]) -> Result<BrokerReceiver, BrokerError> {
        self.ensure_available()?;

        if patterns.is_empty() {
            warn!("Listening with no patterns; nothing will be received");
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        self.listeners.lock().push(Listener {
            patterns: patterns.iter().map(|p| (*p).to_string()).collect(),
            sender,
        });

        debug!(?patterns, "Local broker listener added");
        Ok(receiver)
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
