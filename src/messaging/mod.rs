// ============================================================================
// Messaging - broker transport, publisher and consumer registry
// ============================================================================
//
// Layers:
// - Connector / Channel   transport seam (AMQP via lapin, or in-memory)
// - BrokerConnection      owned connection with an explicit lifecycle
// - Publisher             durable, confirmed publish guarded by a breaker
// - ConsumerRegistry      one sequential consumer per durable queue
//
// ============================================================================

mod amqp;
mod connection;
mod consumer;
mod memory;
mod publisher;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;

use crate::utils::IsTransient;

pub use amqp::AmqpConnector;
pub use connection::{BrokerConnection, ConnectionConfig, ConnectionState};
pub use consumer::{decide, ConsumerConfig, ConsumerRegistry, Disposition, HandlerError, MessageHandler};
pub use memory::InMemoryBroker;
pub use publisher::Publisher;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("connection is closed")]
    Closed,

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: &'static str, after: Duration },

    #[error("circuit breaker open, broker calls suspended")]
    CircuitOpen,

    #[error("failed to declare queue {queue}: {reason}")]
    Declare { queue: String, reason: String },

    #[error("failed to publish to {queue}: {reason}")]
    Publish { queue: String, reason: String },

    #[error("failed to consume from {queue}: {reason}")]
    Consume { queue: String, reason: String },

    #[error("failed to acknowledge delivery: {0}")]
    Ack(String),

    #[error("queue {0} already has a consumer")]
    AlreadySubscribed(String),

    #[error("failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    /// The broker could not be reached at all, as opposed to refusing one
    /// particular message.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_) | BrokerError::Closed | BrokerError::Timeout { .. } | BrokerError::CircuitOpen
        )
    }
}

impl IsTransient for BrokerError {
    fn is_transient(&self) -> bool {
        !matches!(
            self,
            BrokerError::Serialization(_) | BrokerError::Closed | BrokerError::AlreadySubscribed(_)
        )
    }
}

/// Run a broker call under a deadline.
pub(crate) async fn with_timeout<T, F>(operation: &'static str, after: Duration, fut: F) -> Result<T, BrokerError>
where
    F: std::future::Future<Output = Result<T, BrokerError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(BrokerError::Timeout { operation, after }),
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Opens channels to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn Channel>, BrokerError>;

    /// Human-readable target, for logs. Must not contain credentials.
    fn describe(&self) -> String;
}

/// A live channel on which queues are declared, published to and consumed.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declare a queue that survives broker restarts. Idempotent.
    async fn declare_durable_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Send a persistent message and wait until the broker has taken it.
    async fn send(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError>;

    /// Start consuming with manual acknowledgement and at most one
    /// unacknowledged delivery in flight.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// One message handed to a consumer.
pub struct Delivery {
    pub queue: String,
    pub body: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(queue: impl Into<String>, body: Vec<u8>, delivery_count: u32, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            queue: queue.into(),
            body,
            delivery_count: delivery_count.max(1),
            acker,
        }
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("bytes", &self.body.len())
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}

/// Pick a transport from the broker URL scheme.
pub fn connector_for(url: &str) -> Result<Arc<dyn Connector>, BrokerError> {
    if url.starts_with("memory://") {
        Ok(Arc::new(InMemoryBroker::new()))
    } else if url.starts_with("amqp://") || url.starts_with("amqps://") {
        Ok(Arc::new(AmqpConnector::new(url)))
    } else {
        Err(BrokerError::Connection(format!(
            "unsupported broker url scheme in `{}`",
            url.split("://").next().unwrap_or(url)
        )))
    }
}
