//! Redis broker bridge.
//!
//! Publishing goes through a multiplexed [`ConnectionManager`] that
//! reconnects on its own. Each listener gets a dedicated pub/sub connection,
//! since a Redis connection in subscribe mode cannot publish.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use relay_core::{Broker, BrokerError, BrokerMessage, BrokerReceiver};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Broker backed by Redis pub/sub.
pub struct RedisBroker {
    client: redis::Client,
    publisher: ConnectionManager,
    timeout: Duration,
}

impl RedisBroker {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or Redis cannot be reached in time.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let publisher = bounded(timeout, client.get_connection_manager()).await?;

        info!(url = %url, "Connected to Redis");
        Ok(Self {
            client,
            publisher,
            timeout,
        })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn
            .publish(channel, &payload[..])
            .await
            .map_err(backend)?;

        debug!(channel = %channel, receivers, "Published to Redis");
        Ok(())
    }

    async fn listen(&self, patterns: &[&str]) -> Result<BrokerReceiver, BrokerError> {
        let mut pubsub = bounded(self.timeout, self.client.get_async_pubsub()).await?;

        for pattern in patterns {
            let subscribed = if is_glob(pattern) {
                bounded(self.timeout, pubsub.psubscribe(*pattern)).await
            } else {
                bounded(self.timeout, pubsub.subscribe(*pattern)).await
            };
            subscribed?;
        }
        info!(?patterns, "Subscribed to Redis");

        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut messages = std::pin::pin!(pubsub.into_on_message());
            while let Some(msg) = messages.next().await {
                let message = BrokerMessage::new(
                    msg.get_channel_name(),
                    Bytes::copy_from_slice(msg.get_payload_bytes()),
                );
                if sender.send(message).is_err() {
                    debug!("Redis listener dropped");
                    return;
                }
            }
            warn!("Redis subscription stream ended");
        });

        Ok(receiver)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(|c: char| c == '*' || c == '?')
}

async fn bounded<T, F>(timeout: Duration, operation: F) -> Result<T, BrokerError>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result.map_err(unavailable),
        Err(_) => Err(BrokerError::Timeout),
    }
}

fn unavailable(e: redis::RedisError) -> BrokerError {
    BrokerError::Unavailable(e.to_string())
}

fn backend(e: redis::RedisError) -> BrokerError {
    if e.is_connection_dropped() || e.is_io_error() {
        BrokerError::Unavailable(e.to_string())
    } else {
        BrokerError::Backend(e.to_string())
    }
}
