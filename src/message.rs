//! Raw and decoded message types shared by transports, workers and handlers

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// String headers attached to a message
pub type Headers = BTreeMap<String, String>;

/// Transport-specific token used to acknowledge a consumed message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryTag {
    /// Partitioned log position (Kafka, in-memory broker)
    Offset {
        /// Topic name
        topic: String,
        /// Partition number
        partition: i32,
        /// Offset of the message itself (the commit position is `offset + 1`)
        offset: i64,
    },
    /// Redis stream entry id
    Stream {
        /// Stream key
        key: String,
        /// Entry id (e.g. `1700000000000-0`)
        id: String,
    },
    /// Opaque per-channel acknowledgement tag
    Ack(u64),
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryTag::Offset {
                topic,
                partition,
                offset,
            } => write!(f, "{}[{}]@{}", topic, partition, offset),
            DeliveryTag::Stream { key, id } => write!(f, "{}#{}", key, id),
            DeliveryTag::Ack(tag) => write!(f, "ack:{}", tag),
        }
    }
}

/// A topic/partition pair as reported by rebalance events
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    /// Topic name
    pub topic: String,
    /// Partition number
    pub partition: i32,
}

impl TopicPartition {
    /// Create a new topic/partition pair
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// Message as received from a transport, before decoding
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    /// Topic, queue or stream the message was read from
    pub topic: String,
    /// Acknowledgement token
    pub tag: DeliveryTag,
    /// Message key (if present)
    pub key: Option<Vec<u8>>,
    /// Message payload (if present)
    pub payload: Option<Vec<u8>>,
    /// Message headers
    pub headers: Headers,
    /// Broker or producer timestamp
    pub timestamp: Option<DateTime<Utc>>,
}

impl RawMessage {
    /// Create a message with a payload and no key or headers
    pub fn new(topic: impl Into<String>, tag: DeliveryTag, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            tag,
            key: None,
            payload: Some(payload.into()),
            headers: Headers::new(),
            timestamp: None,
        }
    }

    /// Partition of the message, for partitioned transports
    pub fn partition(&self) -> Option<i32> {
        match &self.tag {
            DeliveryTag::Offset { partition, .. } => Some(*partition),
            _ => None,
        }
    }

    /// Key decoded as UTF-8, if present and valid
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_deref().and_then(|k| std::str::from_utf8(k).ok())
    }

    /// Payload length in bytes
    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map(Vec::len).unwrap_or(0)
    }
}

/// Reason a raw message could not be turned into an [`Envelope`]
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The message carried no payload
    #[error("message {0} has an empty payload")]
    EmptyPayload(DeliveryTag),

    /// The payload is not valid JSON for the declared message type
    #[error("message {tag} could not be decoded as {message_type}: {source}")]
    Json {
        /// Tag of the offending message
        tag: DeliveryTag,
        /// Declared handler message type
        message_type: &'static str,
        /// Underlying serde error
        #[source]
        source: serde_json::Error,
    },
}

/// A decoded message together with its transport metadata
#[derive(Debug, Clone)]
pub struct Envelope<M> {
    /// The decoded message
    pub message: M,
    /// Topic the message was read from
    pub topic: String,
    /// Acknowledgement token
    pub tag: DeliveryTag,
    /// Message key (if present)
    pub key: Option<Vec<u8>>,
    /// Message headers
    pub headers: Headers,
    /// Broker or producer timestamp
    pub timestamp: Option<DateTime<Utc>>,
}

impl<M: DeserializeOwned> Envelope<M> {
    /// Decode a raw message's JSON payload into `M`
    pub fn decode(raw: &RawMessage) -> Result<Self, DecodeError> {
        let payload = raw
            .payload
            .as_deref()
            .ok_or_else(|| DecodeError::EmptyPayload(raw.tag.clone()))?;

        let message = serde_json::from_slice(payload).map_err(|source| DecodeError::Json {
            tag: raw.tag.clone(),
            message_type: std::any::type_name::<M>(),
            source,
        })?;

        Ok(Self {
            message,
            topic: raw.topic.clone(),
            tag: raw.tag.clone(),
            key: raw.key.clone(),
            headers: raw.headers.clone(),
            timestamp: raw.timestamp,
        })
    }
}

impl<M> Envelope<M> {
    /// Consume the envelope, returning the message
    pub fn into_message(self) -> M {
        self.message
    }

    /// Key decoded as UTF-8, if present and valid
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_deref().and_then(|k| std::str::from_utf8(k).ok())
    }
}
