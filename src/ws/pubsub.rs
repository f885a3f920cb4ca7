//! Distributed publish/subscribe transports used for cross-instance fan-out.
//!
//! A transport only needs three things: connect, publish to a channel, and
//! pattern-subscribe. Echo suppression lives in the room manager, not here.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

pub type MessageStream = BoxStream<'static, PubSubMessage>;

#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Establish (or verify) the connection to the broker
    async fn connect(&self) -> Result<(), TransportError>;

    async fn publish(&self, channel: &str, payload: String) -> Result<(), TransportError>;

    /// Subscribe to every channel matching one of the glob `patterns`
    async fn psubscribe(&self, patterns: &[String]) -> Result<MessageStream, TransportError>;
}

/// Glob match supporting `*` as "any run of characters"
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == channel;
    }

    let mut rest = channel;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(idx) => rest = &rest[idx + part.len()..],
                None => return false,
            }
        }
    }
    true
}

/// In-process bus. Every clone shares the same channel, so several room managers
/// built on clones behave like instances behind one broker.
#[derive(Clone)]
pub struct InMemoryPubSub {
    sender: broadcast::Sender<PubSubMessage>,
    available: Arc<AtomicBool>,
}

impl InMemoryPubSub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate a broker outage (or recovery)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), TransportError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Connect("in-memory bus unavailable".to_string()))
        }
    }
}

impl Default for InMemoryPubSub {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl PubSubTransport for InMemoryPubSub {
    async fn connect(&self) -> Result<(), TransportError> {
        self.ensure_available()
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), TransportError> {
        self.ensure_available()
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        // No subscribers is not an error
        let _ = self.sender.send(PubSubMessage {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }

    async fn psubscribe(&self, patterns: &[String]) -> Result<MessageStream, TransportError> {
        self.ensure_available()
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let patterns = patterns.to_vec();
        let rx = self.sender.subscribe();
        let messages = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => return Some((msg, rx)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("In-memory pub/sub subscriber lagged, {} messages dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |msg| {
            let matched = patterns.iter().any(|p| pattern_matches(p, &msg.channel));
            futures_util::future::ready(matched)
        })
        .boxed();

        Ok(messages)
    }
}

#[cfg(feature = "redis")]
pub use self::redis_transport::RedisPubSub;

#[cfg(feature = "redis")]
mod redis_transport {
    use super::*;
    use redis::aio::MultiplexedConnection;
    use redis::AsyncCommands;
    use tokio::sync::OnceCell;

    /// Redis Pub/Sub: one multiplexed connection for publishing, a dedicated one per subscription.
    pub struct RedisPubSub {
        client: redis::Client,
        publisher: OnceCell<MultiplexedConnection>,
    }

    impl RedisPubSub {
        pub fn new(url: &str) -> Result<Self, TransportError> {
            let client = redis::Client::open(url).map_err(|e| TransportError::Connect(e.to_string()))?;
            Ok(Self {
                client,
                publisher: OnceCell::new(),
            })
        }

        async fn publisher(&self) -> Result<MultiplexedConnection, TransportError> {
            self.publisher
                .get_or_try_init(|| async {
                    self.client
                        .get_multiplexed_async_connection()
                        .await
                        .map_err(|e| TransportError::Connect(e.to_string()))
                })
                .await
                .cloned()
        }
    }

    #[async_trait]
    impl PubSubTransport for RedisPubSub {
        async fn connect(&self) -> Result<(), TransportError> {
            let mut conn = self.publisher().await?;
            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            Ok(())
        }

        async fn publish(&self, channel: &str, payload: String) -> Result<(), TransportError> {
            let mut conn = self.publisher().await?;
            let _: i64 = conn
                .publish(channel, payload)
                .await
                .map_err(|e| TransportError::Publish(e.to_string()))?;
            Ok(())
        }

        async fn psubscribe(&self, patterns: &[String]) -> Result<MessageStream, TransportError> {
            let mut pubsub = self
                .client
                .get_async_pubsub()
                .await
                .map_err(|e| TransportError::Subscribe(e.to_string()))?;
            for pattern in patterns {
                pubsub
                    .psubscribe(pattern.as_str())
                    .await
                    .map_err(|e| TransportError::Subscribe(e.to_string()))?;
            }

            let messages = pubsub
                .into_on_message()
                .filter_map(|msg| async move {
                    let channel = msg.get_channel_name().to_string();
                    match msg.get_payload::<String>() {
                        Ok(payload) => Some(PubSubMessage { channel, payload }),
                        Err(e) => {
                            warn!("Dropping non-text pub/sub payload on {}: {}", channel, e);
                            None
                        }
                    }
                })
                .boxed();
            Ok(messages)
        }
    }
}
