//! Outbound publishing
//!
//! A [`Publisher`] is a cheap handle to a single actor task that owns the
//! transport producer. Callers send commands over a bounded channel and
//! await a reply; the actor keeps many sends in flight at once and answers
//! each caller as its delivery completes.

use crate::transport::{DeliveryReport, OutboundRecord, Producer, TransportError};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Publishing failures
#[derive(Error, Debug)]
pub enum PublishError {
    /// The message could not be serialized
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The broker rejected the record or could not be reached
    #[error("delivery failed: {0}")]
    Delivery(#[from] TransportError),

    /// No acknowledgement within the publish timeout
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),

    /// The publisher has been closed
    #[error("publisher is closed")]
    Closed,
}

/// Publisher settings
#[derive(Debug, Clone, Copy)]
pub struct PublisherConfig {
    /// Capacity of the command channel
    pub buffer: usize,
    /// Time to wait for each acknowledgement
    pub timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            buffer: 1024,
            timeout: Duration::from_secs(10),
        }
    }
}

impl From<&crate::config::DispatchConfig> for PublisherConfig {
    fn from(config: &crate::config::DispatchConfig) -> Self {
        Self {
            buffer: config.publisher_buffer,
            timeout: config.publish_timeout,
        }
    }
}

type Reply = oneshot::Sender<Result<DeliveryReport, PublishError>>;

enum Command {
    Send { record: OutboundRecord, reply: Reply },
    Close { done: oneshot::Sender<()> },
}

/// Handle to the publishing actor
#[derive(Clone)]
pub struct Publisher {
    commands: mpsc::Sender<Command>,
    timeout: Duration,
}

impl Publisher {
    /// Spawn the actor on the current runtime
    pub fn spawn(producer: Arc<dyn Producer>, config: PublisherConfig) -> Self {
        let (commands, rx) = mpsc::channel(config.buffer.max(1));
        tokio::spawn(run_actor(producer, rx, config.timeout));
        Self {
            commands,
            timeout: config.timeout,
        }
    }

    /// Serialize `message` as JSON and publish it to `topic`
    pub async fn publish<M: Serialize>(
        &self,
        topic: &str,
        message: &M,
        key: Option<&str>,
    ) -> Result<DeliveryReport, PublishError> {
        let record = encode(topic, message, key)?;
        self.publish_raw(record).await
    }

    /// Publish every message concurrently.
    ///
    /// `key` picks a record key per message. The first failure is returned;
    /// the other sends still run to completion.
    pub async fn publish_batch<M, K>(
        &self,
        topic: &str,
        messages: &[M],
        key: Option<K>,
    ) -> Result<Vec<DeliveryReport>, PublishError>
    where
        M: Serialize,
        K: Fn(&M) -> String,
    {
        let mut records = Vec::with_capacity(messages.len());
        for message in messages {
            let k = key.as_ref().map(|select| select(message));
            records.push(encode(topic, message, k.as_deref())?);
        }

        debug!(topic, messages = records.len(), "publishing batch");
        futures::future::try_join_all(records.into_iter().map(|r| self.publish_raw(r))).await
    }

    /// Publish a pre-built record
    pub async fn publish_raw(&self, record: OutboundRecord) -> Result<DeliveryReport, PublishError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send { record, reply })
            .await
            .map_err(|_| PublishError::Closed)?;
        rx.await.map_err(|_| PublishError::Closed)?
    }

    /// Finish outstanding sends and stop the actor.
    ///
    /// Later publishes fail with [`PublishError::Closed`].
    pub async fn close(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Close { done }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Per-message acknowledgement timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// True once the actor has stopped
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

fn encode<M: Serialize>(
    topic: &str,
    message: &M,
    key: Option<&str>,
) -> Result<OutboundRecord, PublishError> {
    let payload =
        serde_json::to_vec(message).map_err(|e| PublishError::Serialization(e.to_string()))?;
    let record = OutboundRecord::new(topic, payload).with_header("content-type", "application/json");
    Ok(match key {
        Some(key) => record.with_key(key.as_bytes().to_vec()),
        None => record,
    })
}

async fn run_actor(
    producer: Arc<dyn Producer>,
    mut commands: mpsc::Receiver<Command>,
    timeout: Duration,
) {
    let mut inflight = FuturesUnordered::new();
    let mut close_waiter: Option<oneshot::Sender<()>> = None;

    loop {
        tokio::select! {
            command = commands.recv(), if close_waiter.is_none() => match command {
                Some(Command::Send { record, reply }) => {
                    let producer = producer.clone();
                    inflight.push(async move {
                        let result = deliver(producer.as_ref(), record, timeout).await;
                        let _ = reply.send(result);
                    });
                }
                Some(Command::Close { done }) => {
                    commands.close();
                    close_waiter = Some(done);
                }
                None => break,
            },
            Some(()) = inflight.next(), if !inflight.is_empty() => {}
            else => break,
        }

        if close_waiter.is_some() && inflight.is_empty() {
            break;
        }
    }

    // Answer anything queued behind the close request.
    while let Ok(command) = commands.try_recv() {
        match command {
            Command::Send { reply, .. } => {
                let _ = reply.send(Err(PublishError::Closed));
            }
            Command::Close { done } => {
                let _ = done.send(());
            }
        }
    }

    if let Some(done) = close_waiter {
        let _ = done.send(());
    }
    info!("Publisher stopped");
}

async fn deliver(
    producer: &dyn Producer,
    record: OutboundRecord,
    timeout: Duration,
) -> Result<DeliveryReport, PublishError> {
    let topic = record.topic.clone();
    match tokio::time::timeout(timeout, producer.send(record, timeout)).await {
        Ok(Ok(report)) => {
            debug!(topic = %topic, partition = ?report.partition, offset = ?report.offset, "published");
            Ok(report)
        }
        Ok(Err(TransportError::Timeout(_))) => {
            warn!(topic = %topic, "publish timed out");
            Err(PublishError::Timeout(timeout))
        }
        Ok(Err(e)) => {
            warn!(topic = %topic, error = %e, "publish failed");
            Err(PublishError::Delivery(e))
        }
        Err(_) => {
            warn!(topic = %topic, "publish timed out");
            Err(PublishError::Timeout(timeout))
        }
    }
}
