//! Dead-letter forwarding for messages that cannot be handled

use crate::message::{DeliveryTag, Headers, RawMessage};
use crate::publisher::{PublishError, Publisher};
use crate::transport::OutboundRecord;
use tracing::{debug, error};

/// Header prefix reserved for dead-letter metadata
pub const DLQ_HEADER_PREFIX: &str = "dlq.";

/// Why a message was dead-lettered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// The payload could not be decoded into the handler's message type
    Undecodable,
    /// The handler failed on the message after all retries
    HandlerFailed,
}

impl DeadLetterReason {
    fn as_str(self) -> &'static str {
        match self {
            DeadLetterReason::Undecodable => "undecodable",
            DeadLetterReason::HandlerFailed => "handler_failed",
        }
    }
}

/// Forwards messages to a dead-letter topic with metadata headers.
///
/// Records go through the shared [`Publisher`], so dead-lettering uses the
/// same producer, acknowledgement timeout and shutdown ordering as every
/// other outbound message.
#[derive(Clone)]
pub struct DeadLetterSink {
    publisher: Publisher,
    topic: String,
}

impl DeadLetterSink {
    /// Create a sink writing to `topic`
    pub fn new(publisher: Publisher, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
        }
    }

    /// Dead-letter topic name
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Forward `original` with its key and payload unchanged
    pub async fn send(
        &self,
        original: &RawMessage,
        binding_id: &str,
        reason: DeadLetterReason,
        error: &str,
        attempts: u32,
    ) -> Result<(), PublishError> {
        let record = OutboundRecord {
            topic: self.topic.clone(),
            key: original.key.clone(),
            payload: original.payload.clone().unwrap_or_default(),
            headers: dead_letter_headers(original, binding_id, reason, error, attempts),
        };

        match self.publisher.publish_raw(record).await {
            Ok(report) => {
                debug!(
                    dlq_topic = %self.topic,
                    partition = ?report.partition,
                    offset = ?report.offset,
                    original = %original.tag,
                    "message dead-lettered"
                );
                Ok(())
            }
            Err(e) => {
                error!(dlq_topic = %self.topic, original = %original.tag, error = %e, "failed to dead-letter message");
                Err(e)
            }
        }
    }
}

fn dead_letter_headers(
    original: &RawMessage,
    binding_id: &str,
    reason: DeadLetterReason,
    error: &str,
    attempts: u32,
) -> Headers {
    let mut headers = Headers::new();

    headers.insert("dlq.original.topic".into(), original.topic.clone());
    match &original.tag {
        DeliveryTag::Offset {
            partition, offset, ..
        } => {
            headers.insert("dlq.original.partition".into(), partition.to_string());
            headers.insert("dlq.original.offset".into(), offset.to_string());
        }
        DeliveryTag::Stream { id, .. } => {
            headers.insert("dlq.original.id".into(), id.clone());
        }
        DeliveryTag::Ack(tag) => {
            headers.insert("dlq.original.ack".into(), tag.to_string());
        }
    }
    headers.insert("dlq.binding".into(), binding_id.to_string());
    headers.insert("dlq.reason".into(), reason.as_str().to_string());
    headers.insert("dlq.error.message".into(), error.to_string());
    headers.insert("dlq.error.attempts".into(), attempts.to_string());
    headers.insert("dlq.timestamp".into(), chrono::Utc::now().timestamp().to_string());

    for (key, value) in &original.headers {
        if !key.starts_with(DLQ_HEADER_PREFIX) {
            headers.insert(format!("dlq.original.header.{}", key), value.clone());
        }
    }

    headers
}
