//! Batch accumulation

use crate::message::{DeliveryTag, RawMessage};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// A closed batch, handed to exactly one handler invocation
#[derive(Debug, Clone)]
pub struct Batch {
    /// Unique batch id
    pub id: Uuid,
    /// Binding that formed the batch
    pub binding_id: Arc<str>,
    /// Topic group label of the binding
    pub topic_group: Option<Arc<str>>,
    /// Messages in arrival order
    pub messages: Vec<RawMessage>,
    /// When the first message arrived
    pub started_at: DateTime<Utc>,
    /// When the batch was closed
    pub completed_at: DateTime<Utc>,
}

impl Batch {
    /// Delivery tags of every message, in order
    pub fn tags(&self) -> Vec<DeliveryTag> {
        self.messages.iter().map(|m| m.tag.clone()).collect()
    }

    /// Number of messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True when the batch holds no messages
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Open batch owned by a worker
///
/// Closes when it reaches `max_size` messages or when `timeout` has passed
/// since its first message.
#[derive(Debug)]
pub(crate) struct BatchBuffer {
    binding_id: Arc<str>,
    topic_group: Option<Arc<str>>,
    max_size: usize,
    timeout: Duration,
    messages: Vec<RawMessage>,
    deadline: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
}

impl BatchBuffer {
    pub fn new(
        binding_id: Arc<str>,
        topic_group: Option<Arc<str>>,
        max_size: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            binding_id,
            topic_group,
            max_size,
            timeout,
            messages: Vec::with_capacity(max_size.min(1024)),
            deadline: None,
            started_at: None,
        }
    }

    /// Add a message; returns true when the batch is now full
    pub fn push(&mut self, message: RawMessage) -> bool {
        if self.messages.is_empty() {
            self.deadline = Some(Instant::now() + self.timeout);
            self.started_at = Some(Utc::now());
        }
        self.messages.push(message);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.messages.len() >= self.max_size
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Instant at which the open batch times out
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Close the open batch, if any
    pub fn take(&mut self) -> Option<Batch> {
        if self.messages.is_empty() {
            return None;
        }
        let messages = std::mem::replace(
            &mut self.messages,
            Vec::with_capacity(self.max_size.min(1024)),
        );
        self.deadline = None;
        let completed_at = Utc::now();

        Some(Batch {
            id: Uuid::new_v4(),
            binding_id: self.binding_id.clone(),
            topic_group: self.topic_group.clone(),
            messages,
            started_at: self.started_at.take().unwrap_or(completed_at),
            completed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(offset: i64) -> RawMessage {
        RawMessage::new(
            "t",
            DeliveryTag::Offset {
                topic: "t".to_string(),
                partition: 0,
                offset,
            },
            b"{}".to_vec(),
        )
    }

    #[test]
    fn test_buffer_fills_and_resets() {
        let mut buffer = BatchBuffer::new(Arc::from("C::h"), None, 3, Duration::from_secs(1));
        assert!(buffer.take().is_none());
        assert!(buffer.deadline().is_none());

        assert!(!buffer.push(message(0)));
        assert!(buffer.deadline().is_some());
        assert!(!buffer.push(message(1)));
        assert!(buffer.push(message(2)));

        let batch = buffer.take().unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.tags()[2], message(2).tag);
        assert!(batch.started_at <= batch.completed_at);

        assert!(buffer.is_empty());
        assert!(buffer.deadline().is_none());
    }

    #[tokio::test]
    async fn test_deadline_counts_from_first_message() {
        let mut buffer = BatchBuffer::new(Arc::from("C::h"), None, 10, Duration::from_millis(500));
        let before = Instant::now();
        buffer.push(message(0));
        let deadline = buffer.deadline().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.push(message(1));
        assert_eq!(buffer.deadline().unwrap(), deadline);
        assert!(deadline >= before + Duration::from_millis(500));
    }
}
