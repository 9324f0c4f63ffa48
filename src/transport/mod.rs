//! Broker transport abstraction
//!
//! Workers and the publisher never talk to a broker client directly. They go
//! through the three traits in this module:
//!
//! - [`Transport`] establishes the connection and hands out subscriptions and
//!   a producer
//! - [`Subscription`] is owned by exactly one worker and yields
//!   [`TransportEvent`]s and commits delivery tags
//! - [`Producer`] sends outbound records and reports delivery metadata
//!
//! The in-memory broker is always available. Kafka and Redis Streams sit
//! behind the `kafka` and `redis` features.

pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryBroker;

use crate::message::{DeliveryTag, Headers, RawMessage, TopicPartition};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors raised by transport implementations
#[derive(Error, Debug)]
pub enum TransportError {
    /// Could not connect or lost the connection
    #[error("Connection error: {0}")]
    Connection(String),

    /// Topic does not exist and the transport does not create topics on demand
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    /// Subscribing to the binding's topics failed
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Committing or acknowledging delivery tags failed
    #[error("Commit error: {0}")]
    Commit(String),

    /// The broker rejected or failed to deliver an outbound record
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Operation did not complete in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Kafka client errors
    #[cfg(feature = "kafka")]
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Redis client errors
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// What a worker subscribes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Unique binding id (`consumer::handler`)
    pub id: String,
    /// Consumer group shared by every binding of a service
    pub group_id: String,
    /// Resolved topic, queue or stream names
    pub topics: Vec<String>,
    /// Upper bound on messages fetched per broker round-trip
    pub fetch_size: usize,
}

/// Event yielded by a [`Subscription`]
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A message was received
    Message(RawMessage),
    /// Partitions were assigned to this subscription
    PartitionsAssigned(Vec<TopicPartition>),
    /// Partitions are being revoked from this subscription
    PartitionsRevoked(Vec<TopicPartition>),
}

/// Outbound record handed to a [`Producer`]
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRecord {
    /// Destination topic, queue or stream
    pub topic: String,
    /// Optional partitioning key
    pub key: Option<Vec<u8>>,
    /// Serialized payload
    pub payload: Vec<u8>,
    /// Headers to attach
    pub headers: Headers,
}

impl OutboundRecord {
    /// Create a record without key or headers
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload: payload.into(),
            headers: Headers::new(),
        }
    }

    /// Set the partitioning key
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Delivery metadata returned once the broker acknowledged a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    /// Destination topic
    pub topic: String,
    /// Partition the record landed on, for partitioned transports
    pub partition: Option<i32>,
    /// Offset assigned by the broker, for log-based transports
    pub offset: Option<i64>,
    /// Broker-assigned id (e.g. a Redis stream entry id)
    pub id: Option<String>,
    /// Whether the broker confirmed the delivery
    pub delivered: bool,
}

/// Connection to a broker
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Short transport name for logs (`kafka`, `redis`, `memory`)
    fn name(&self) -> &str;

    /// Establish or verify the broker connection
    async fn connect(&self) -> TransportResult<()>;

    /// Open a subscription for one worker
    async fn subscribe(&self, binding: &Binding) -> TransportResult<Box<dyn Subscription>>;

    /// Producer used by the publisher and for dead-lettering
    async fn producer(&self) -> TransportResult<Arc<dyn Producer>>;
}

/// A stream of events for exactly one worker
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next event; `None` once the subscription is exhausted.
    ///
    /// Implementations must be cancel safe: dropping the future before it
    /// completes must not lose an event that was not returned.
    async fn next_event(&mut self) -> Option<TransportResult<TransportEvent>>;

    /// Mark the given delivery tags as durably processed
    async fn commit(&mut self, tags: &[DeliveryTag]) -> TransportResult<()>;

    /// The worker has flushed and committed everything it received before the
    /// last [`TransportEvent::PartitionsRevoked`].
    ///
    /// Transports that hold a revocation open until then release it here.
    fn revocation_handled(&mut self) {}

    /// Release broker resources
    async fn close(&mut self) {}
}

/// Sends outbound records
#[async_trait]
pub trait Producer: Send + Sync {
    /// Send a record and wait for the broker acknowledgement
    async fn send(&self, record: OutboundRecord, timeout: Duration)
        -> TransportResult<DeliveryReport>;
}

/// Highest offset per topic/partition among the given tags
pub(crate) fn max_offsets(tags: &[DeliveryTag]) -> std::collections::BTreeMap<(String, i32), i64> {
    let mut offsets = std::collections::BTreeMap::new();
    for tag in tags {
        if let DeliveryTag::Offset {
            topic,
            partition,
            offset,
        } = tag
        {
            let entry = offsets.entry((topic.clone(), *partition)).or_insert(*offset);
            if *offset > *entry {
                *entry = *offset;
            }
        }
    }
    offsets
}
