//! Redis Streams transport
//!
//! Topics map to stream keys and each binding reads through its own consumer
//! group. A background task per subscription owns the blocking
//! `XREADGROUP` connection: it first drains the consumer's pending entries
//! (delivered before a restart but never acknowledged) and then waits for new
//! ones. Commits are `XACK`s on a second connection.
//!
//! The consumer name is derived from the binding id and, when configured,
//! the [`CONSUMER_INSTANCE_PROPERTY`] value. It does not change across
//! restarts of the worker or of the process, so entries left pending by a
//! crash are picked up again by the next run. Replicas sharing a group must
//! each set a distinct instance.

use super::{
    Binding, DeliveryReport, OutboundRecord, Producer, Subscription, Transport, TransportError,
    TransportEvent, TransportResult,
};
use crate::config::DispatchConfig;
use crate::message::{DeliveryTag, Headers, RawMessage, TopicPartition};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Stream field holding the payload
pub const PAYLOAD_FIELD: &str = "payload";
/// Stream field holding the record key
pub const KEY_FIELD: &str = "key";
/// Prefix of stream fields carrying headers
pub const HEADER_FIELD_PREFIX: &str = "header.";

/// Property naming this process among replicas of the same service
pub const CONSUMER_INSTANCE_PROPERTY: &str = "consumer.instance";

const PENDING: &str = "0";
const NEW_ENTRIES: &str = ">";
const BLOCK: Duration = Duration::from_millis(1000);

/// Redis Streams transport for one server
pub struct RedisTransport {
    client: redis::Client,
    instance: Option<String>,
}

impl RedisTransport {
    /// Create a transport for the `redis://` URL in `config.brokers`
    pub fn new(config: &DispatchConfig) -> TransportResult<Self> {
        let client = redis::Client::open(config.brokers.as_str())?;
        let instance = config
            .properties
            .get(CONSUMER_INSTANCE_PROPERTY)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        Ok(Self { client, instance })
    }

    /// Consumer name used in the binding's group
    pub fn consumer_name(&self, binding_id: &str) -> String {
        match &self.instance {
            Some(instance) => format!("{}@{}", binding_id, instance),
            None => binding_id.to_string(),
        }
    }

    async fn connection(&self) -> TransportResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }
}

#[async_trait]
impl Transport for RedisTransport {
    fn name(&self) -> &str {
        "redis"
    }

    async fn connect(&self) -> TransportResult<()> {
        let mut con = self.connection().await?;
        let pong: String = redis::cmd("PING").query_async(&mut con).await?;
        info!(reply = %pong, "Connected to Redis");
        Ok(())
    }

    async fn subscribe(&self, binding: &Binding) -> TransportResult<Box<dyn Subscription>> {
        let mut read_con = self.connection().await?;
        let ack_con = self.connection().await?;

        for key in &binding.topics {
            create_group(&mut read_con, key, &binding.group_id).await?;
        }

        let consumer = self.consumer_name(&binding.id);
        let (tx, rx) = mpsc::channel(binding.fetch_size.max(1));

        let reader = tokio::spawn(read_loop(
            read_con,
            binding.topics.clone(),
            binding.group_id.clone(),
            consumer.clone(),
            binding.fetch_size.max(1),
            tx,
        ));

        info!(binding = %binding.id, group = %binding.group_id, consumer = %consumer, streams = ?binding.topics, "Subscribed to Redis streams");

        let assigned = binding
            .topics
            .iter()
            .map(|key| TopicPartition::new(key.clone(), 0))
            .collect();

        Ok(Box::new(RedisSubscription {
            binding_id: binding.id.clone(),
            group: binding.group_id.clone(),
            ack_con,
            events: rx,
            assigned: Some(assigned),
            reader,
        }))
    }

    async fn producer(&self) -> TransportResult<Arc<dyn Producer>> {
        Ok(Arc::new(RedisProducer {
            con: self.connection().await?,
        }))
    }
}

async fn create_group(
    con: &mut MultiplexedConnection,
    key: &str,
    group: &str,
) -> TransportResult<()> {
    match con
        .xgroup_create_mkstream::<_, _, _, ()>(key, group, PENDING)
        .await
    {
        Ok(()) => {
            debug!(stream = key, group, "Created consumer group");
            Ok(())
        }
        Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
        Err(e) => Err(TransportError::Subscription(format!(
            "cannot create group '{}' on '{}': {}",
            group, key, e
        ))),
    }
}

async fn read_loop(
    mut con: MultiplexedConnection,
    keys: Vec<String>,
    group: String,
    consumer: String,
    count: usize,
    tx: mpsc::Sender<TransportResult<TransportEvent>>,
) {
    let mut ids: Vec<String> = vec![PENDING.to_string(); keys.len()];
    let options = StreamReadOptions::default()
        .group(&group, &consumer)
        .count(count)
        .block(BLOCK.as_millis() as usize);

    loop {
        let reply: Option<StreamReadReply> =
            match con.xread_options(&keys, &ids, &options).await {
                Ok(reply) => reply,
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            };

        let streams = reply.map(|r| r.keys).unwrap_or_default();

        for (index, key) in keys.iter().enumerate() {
            if ids[index] == NEW_ENTRIES {
                continue;
            }
            // Pending entries are exhausted once a history read returns nothing.
            match streams.iter().find(|s| s.key == *key).and_then(|s| s.ids.last()) {
                Some(last) => ids[index] = last.id.clone(),
                None => ids[index] = NEW_ENTRIES.to_string(),
            }
        }

        for stream in streams {
            for entry in stream.ids {
                let message = to_raw(&stream.key, entry);
                if tx.send(Ok(TransportEvent::Message(message))).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn to_raw(key: &str, entry: StreamId) -> RawMessage {
    let headers: Headers = entry
        .map
        .iter()
        .filter_map(|(field, value)| {
            let name = field.strip_prefix(HEADER_FIELD_PREFIX)?;
            redis::from_redis_value::<String>(value)
                .ok()
                .map(|v| (name.to_string(), v))
        })
        .collect();

    RawMessage {
        topic: key.to_string(),
        key: entry.get::<Vec<u8>>(KEY_FIELD),
        payload: entry.get::<Vec<u8>>(PAYLOAD_FIELD),
        headers,
        timestamp: stream_id_timestamp(&entry.id),
        tag: DeliveryTag::Stream {
            key: key.to_string(),
            id: entry.id,
        },
    }
}

/// Stream ids start with the insertion time in milliseconds
fn stream_id_timestamp(id: &str) -> Option<chrono::DateTime<Utc>> {
    let millis: i64 = id.split('-').next()?.parse().ok()?;
    chrono::DateTime::from_timestamp_millis(millis)
}

struct RedisSubscription {
    binding_id: String,
    group: String,
    ack_con: MultiplexedConnection,
    events: mpsc::Receiver<TransportResult<TransportEvent>>,
    assigned: Option<Vec<TopicPartition>>,
    reader: JoinHandle<()>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_event(&mut self) -> Option<TransportResult<TransportEvent>> {
        if let Some(partitions) = self.assigned.take() {
            return Some(Ok(TransportEvent::PartitionsAssigned(partitions)));
        }
        self.events.recv().await
    }

    async fn commit(&mut self, tags: &[DeliveryTag]) -> TransportResult<()> {
        let mut by_stream: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for tag in tags {
            if let DeliveryTag::Stream { key, id } = tag {
                by_stream.entry(key.as_str()).or_default().push(id.as_str());
            }
        }

        for (key, ids) in by_stream {
            let acked: usize = self
                .ack_con
                .xack(key, &self.group, &ids)
                .await
                .map_err(|e| TransportError::Commit(e.to_string()))?;
            if acked != ids.len() {
                warn!(binding = %self.binding_id, stream = key, acked, expected = ids.len(), "Some entries were already acknowledged");
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.reader.abort();
        self.events.close();
        debug!(binding = %self.binding_id, "Redis subscription closed");
    }
}

impl Drop for RedisSubscription {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

struct RedisProducer {
    con: MultiplexedConnection,
}

fn stream_fields(record: &OutboundRecord) -> Vec<(String, Vec<u8>)> {
    let mut fields = vec![(PAYLOAD_FIELD.to_string(), record.payload.clone())];
    if let Some(key) = &record.key {
        fields.push((KEY_FIELD.to_string(), key.clone()));
    }
    for (name, value) in &record.headers {
        fields.push((
            format!("{}{}", HEADER_FIELD_PREFIX, name),
            value.clone().into_bytes(),
        ));
    }
    fields
}

#[async_trait]
impl Producer for RedisProducer {
    async fn send(
        &self,
        record: OutboundRecord,
        timeout: Duration,
    ) -> TransportResult<DeliveryReport> {
        let fields = stream_fields(&record);
        let mut con = self.con.clone();

        let id: String = tokio::time::timeout(timeout, con.xadd(&record.topic, "*", &fields))
            .await
            .map_err(|_| TransportError::Timeout(format!("XADD to '{}'", record.topic)))?
            .map_err(|e| TransportError::Delivery(e.to_string()))?;

        Ok(DeliveryReport {
            topic: record.topic,
            partition: None,
            offset: None,
            id: Some(id),
            delivered: true,
        })
    }
}
