//! Work queues, completion signals and the per-application log bus
//!
//! Queues are Redis lists (`LPUSH` in, `BRPOP` out, so FIFO); the log bus is
//! Redis pub/sub. The pipelines only see the `WorkQueue` and `LogBus` traits.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::wait::Backoff;

/// Broker errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// Connection lost, refused or timed out
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The broker answered with an error
    #[error("broker command failed: {0}")]
    Command(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            Self::Unavailable(err.to_string())
        } else {
            Self::Command(err.to_string())
        }
    }
}

/// Durable FIFO lists with a blocking pop
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Pop the oldest item from the first non-empty queue, as `(queue, payload)`
    ///
    /// Blocks until an item exists or `timeout` elapses (`None` blocks
    /// indefinitely); a timeout yields `Ok(None)`.
    async fn pop(
        &self,
        queues: &[String],
        timeout: Option<Duration>,
    ) -> Result<Option<(String, String)>, QueueError>;

    /// Append an item
    async fn push(&self, queue: &str, payload: &str) -> Result<(), QueueError>;

    /// Drop every pending item
    async fn clear(&self, queue: &str) -> Result<(), QueueError>;
}

/// Fire-and-forget publish/subscribe channels
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LogBus: Send + Sync {
    async fn publish(&self, channel: &str, message: &str) -> Result<(), QueueError>;
}

/// Redis-backed `WorkQueue` and `LogBus`
///
/// Pushes and publishes share one auto-reconnecting `ConnectionManager`.
/// `BRPOP` holds its connection for the whole wait, so every pop opens its own
/// connection instead of stalling the shared one.
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        debug!("Connected to broker");
        Ok(Self { client, conn })
    }

    /// Retry `connect` until it succeeds, sleeping with `backoff` in between
    pub async fn connect_with_backoff(url: &str, backoff: &mut Backoff) -> Self {
        loop {
            match Self::connect(url).await {
                Ok(broker) => {
                    backoff.reset();
                    return broker;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!("Broker connection failed: {}. Retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Subscribe to a channel; yields every message published after this call
    pub async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, QueueError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        Ok(pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() })
            .boxed())
    }

    /// Round-trip check used by health checks
    pub async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for RedisBroker {
    async fn pop(
        &self,
        queues: &[String],
        timeout: Option<Duration>,
    ) -> Result<Option<(String, String)>, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        // BRPOP takes fractional seconds; 0 means forever
        let seconds = timeout.map_or(0.0, |t| t.as_secs_f64());

        let mut cmd = redis::cmd("BRPOP");
        for queue in queues {
            cmd.arg(queue);
        }
        cmd.arg(seconds);

        let popped: Option<(String, String)> = cmd.query_async(&mut conn).await?;
        Ok(popped)
    }

    async fn push(&self, queue: &str, payload: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.lpush(queue, payload).await?;
        Ok(())
    }

    async fn clear(&self, queue: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(queue).await?;
        Ok(())
    }
}

#[async_trait]
impl LogBus for RedisBroker {
    async fn publish(&self, channel: &str, message: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(channel, message).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_errors_are_unavailable() {
        let err = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(matches!(QueueError::from(err), QueueError::Unavailable(_)));
    }

    #[test]
    fn test_server_errors_are_command_failures() {
        let err = redis::RedisError::from((redis::ErrorKind::TypeError, "WRONGTYPE"));
        assert!(matches!(QueueError::from(err), QueueError::Command(_)));
    }
}
