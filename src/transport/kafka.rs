//! Kafka / Redpanda transport built on `rdkafka`
//!
//! Each binding gets its own `BaseConsumer` with auto-commit disabled;
//! offsets are committed synchronously when the worker asks for it.
//!
//! The consumer is polled on a dedicated thread that forwards messages and
//! rebalance events to the worker over one bounded channel, so events keep
//! their broker order. librdkafka runs rebalance callbacks on that thread.
//! On revocation the callback forwards the event and then blocks until the
//! worker reports through [`Subscription::revocation_handled`] that it has
//! flushed and committed its open batch, or until the revocation timeout
//! passes. Partitions are only released after that, so the final commit
//! still belongs to the current generation.

use super::{
    max_offsets, Binding, DeliveryReport, OutboundRecord, Producer, Subscription, Transport,
    TransportError, TransportEvent, TransportResult,
};
use crate::config::DispatchConfig;
use crate::message::{DeliveryTag, Headers, RawMessage, TopicPartition};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::message::{BorrowedMessage, Header, Headers as _, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, ClientContext, Message, Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Client properties that may be passed through from configuration
const ALLOWED_KAFKA_PROPS: &[&str] = &[
    // Security
    "security.protocol",
    "sasl.mechanism",
    "sasl.username",
    "sasl.password",
    "ssl.ca.location",
    // Compression settings
    "compression.type",
    "compression.level",
    // Fetch settings
    "fetch.min.bytes",
    "fetch.max.wait.ms",
    "fetch.max.bytes",
    "max.partition.fetch.bytes",
    // Consumer settings
    "auto.offset.reset",
    "session.timeout.ms",
    "max.poll.interval.ms",
    "partition.assignment.strategy",
    // Producer settings
    "acks",
    "linger.ms",
    "enable.idempotence",
    "message.max.bytes",
    // Connection settings
    "request.timeout.ms",
    "reconnect.backoff.ms",
    "reconnect.backoff.max.ms",
    "socket.keepalive.enable",
    "client.id",
];

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

type EventSender = mpsc::Sender<TransportResult<TransportEvent>>;

/// Kafka transport for one cluster
pub struct KafkaTransport {
    brokers: String,
    properties: HashMap<String, String>,
    revocation_timeout: Duration,
    producer: Mutex<Option<Arc<KafkaProducer>>>,
}

impl KafkaTransport {
    /// Create a transport from configuration.
    ///
    /// Rejects client properties outside the allowed set. A revocation is held
    /// open for at most `shutdown_timeout`, the same bound a stopping worker
    /// gets to flush its open batch.
    pub fn new(config: &DispatchConfig) -> TransportResult<Self> {
        for key in config.properties.keys() {
            if !ALLOWED_KAFKA_PROPS.contains(&key.as_str()) {
                return Err(TransportError::Connection(format!(
                    "Disallowed Kafka property '{}'. Allowed properties: {:?}",
                    key, ALLOWED_KAFKA_PROPS
                )));
            }
        }

        Ok(Self {
            brokers: config.brokers.clone(),
            properties: config.properties.clone(),
            revocation_timeout: config.shutdown_timeout,
            producer: Mutex::new(None),
        })
    }

    /// Client config with `defaults` applied before the configured properties
    fn client_config(&self, defaults: &[(&str, &str)]) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.brokers);
        for (key, value) in defaults {
            config.set(*key, *value);
        }
        for (key, value) in &self.properties {
            config.set(key, value);
        }
        config
    }

    fn shared_producer(&self) -> TransportResult<Arc<KafkaProducer>> {
        let mut slot = self.producer.lock();
        if let Some(producer) = slot.as_ref() {
            return Ok(producer.clone());
        }

        let producer: FutureProducer = self
            .client_config(&[("message.timeout.ms", "30000")])
            .create()?;
        let producer = Arc::new(KafkaProducer { producer });
        *slot = Some(producer.clone());
        Ok(producer)
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    fn name(&self) -> &str {
        "kafka"
    }

    async fn connect(&self) -> TransportResult<()> {
        let producer = self.shared_producer()?;
        let brokers = self.brokers.clone();

        tokio::task::spawn_blocking(move || {
            producer
                .producer
                .client()
                .fetch_metadata(None, Timeout::After(METADATA_TIMEOUT))
                .map(|metadata| metadata.brokers().len())
        })
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?
        .map(|count| info!(brokers = %brokers, reachable = count, "Connected to Kafka"))
        .map_err(|e| TransportError::Connection(format!("metadata request failed: {}", e)))
    }

    async fn subscribe(&self, binding: &Binding) -> TransportResult<Box<dyn Subscription>> {
        let (events, rx) = mpsc::channel(binding.fetch_size.max(1));
        let (revocation_done, revocation_wait) = std_mpsc::channel();
        let context = RebalanceContext::new(
            binding.id.clone(),
            events.clone(),
            revocation_wait,
            self.revocation_timeout,
        );

        let consumer: BaseConsumer<RebalanceContext> = self
            .client_config(&[("auto.offset.reset", "earliest")])
            .set("group.id", &binding.group_id)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .create_with_context(context)?;

        let topics: Vec<&str> = binding.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| TransportError::Subscription(format!("Failed to subscribe: {}", e)))?;

        let consumer = Arc::new(consumer);
        let running = Arc::new(AtomicBool::new(true));
        {
            let binding_id = binding.id.clone();
            let consumer = consumer.clone();
            let running = running.clone();
            std::thread::Builder::new()
                .name(format!("kafka-poll-{}", binding.id))
                .spawn(move || poll_loop(binding_id, consumer, events, running))
                .map_err(|e| {
                    TransportError::Subscription(format!("cannot start poll thread: {}", e))
                })?;
        }

        info!(binding = %binding.id, group = %binding.group_id, topics = ?binding.topics, "Subscribed to Kafka topics");

        Ok(Box::new(KafkaSubscription {
            binding_id: binding.id.clone(),
            consumer,
            events: rx,
            revocation_done: Some(revocation_done),
            running,
        }))
    }

    async fn producer(&self) -> TransportResult<Arc<dyn Producer>> {
        Ok(self.shared_producer()?)
    }
}

/// Polls the consumer until the subscription is closed or dropped
fn poll_loop(
    binding_id: String,
    consumer: Arc<BaseConsumer<RebalanceContext>>,
    events: EventSender,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Acquire) {
        let event = match consumer.poll(POLL_INTERVAL) {
            None => continue,
            Some(Ok(message)) => Ok(TransportEvent::Message(to_raw(&message))),
            Some(Err(e)) => Err(TransportError::from(e)),
        };
        if events.blocking_send(event).is_err() {
            break;
        }
    }
    debug!(binding = %binding_id, "Kafka poll loop stopped");
}

struct RebalanceContext {
    binding_id: String,
    events: EventSender,
    revocation_done: Mutex<std_mpsc::Receiver<()>>,
    revocation_timeout: Duration,
}

impl RebalanceContext {
    fn new(
        binding_id: String,
        events: EventSender,
        revocation_done: std_mpsc::Receiver<()>,
        revocation_timeout: Duration,
    ) -> Self {
        Self {
            binding_id,
            events,
            revocation_done: Mutex::new(revocation_done),
            revocation_timeout,
        }
    }

    /// Forward an event from a librdkafka callback.
    ///
    /// Callbacks normally run on the poll thread and may block. When one runs
    /// inside the async runtime instead (the consumer being torn down there),
    /// the event is offered without waiting.
    fn forward(&self, event: TransportEvent) -> bool {
        if tokio::runtime::Handle::try_current().is_ok() {
            self.events.try_send(Ok(event)).is_ok()
        } else {
            self.events.blocking_send(Ok(event)).is_ok()
        }
    }

    /// Hand a revocation to the worker and wait until it has been handled
    fn hold_revocation(&self, partitions: Vec<TopicPartition>) {
        let done = self.revocation_done.lock();
        // Acknowledgements of a revocation that already timed out
        while done.try_recv().is_ok() {}

        let count = partitions.len();
        if !self.forward(TransportEvent::PartitionsRevoked(partitions)) {
            return;
        }
        if tokio::runtime::Handle::try_current().is_ok() {
            return;
        }

        match done.recv_timeout(self.revocation_timeout) {
            Ok(()) => debug!(binding = %self.binding_id, partitions = count, "Revocation handled"),
            Err(std_mpsc::RecvTimeoutError::Timeout) => error!(
                binding = %self.binding_id,
                partitions = count,
                timeout_ms = self.revocation_timeout.as_millis() as u64,
                "Worker did not finish the revoked batch in time, releasing partitions"
            ),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {}
        }
    }
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(list) = rebalance {
            if list.count() == 0 {
                return;
            }
            debug!(binding = %self.binding_id, partitions = list.count(), "Revoking partitions");
            self.hold_revocation(partitions(list));
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(list) if list.count() > 0 => {
                debug!(binding = %self.binding_id, partitions = list.count(), "Assigned partitions");
                self.forward(TransportEvent::PartitionsAssigned(partitions(list)));
            }
            Rebalance::Error(e) => warn!(binding = %self.binding_id, error = %e, "Rebalance error"),
            _ => {}
        }
    }
}

fn partitions(list: &TopicPartitionList) -> Vec<TopicPartition> {
    list.elements()
        .iter()
        .map(|e| TopicPartition::new(e.topic(), e.partition()))
        .collect()
}

fn to_raw(message: &BorrowedMessage<'_>) -> RawMessage {
    let headers: Headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .filter_map(|h| {
                    h.value
                        .map(|v| (h.key.to_string(), String::from_utf8_lossy(v).into_owned()))
                })
                .collect()
        })
        .unwrap_or_default();

    RawMessage {
        topic: message.topic().to_string(),
        tag: DeliveryTag::Offset {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
        },
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec),
        headers,
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
    }
}

struct KafkaSubscription {
    binding_id: String,
    consumer: Arc<BaseConsumer<RebalanceContext>>,
    events: mpsc::Receiver<TransportResult<TransportEvent>>,
    revocation_done: Option<std_mpsc::Sender<()>>,
    running: Arc<AtomicBool>,
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn next_event(&mut self) -> Option<TransportResult<TransportEvent>> {
        self.events.recv().await
    }

    async fn commit(&mut self, tags: &[DeliveryTag]) -> TransportResult<()> {
        let offsets = max_offsets(tags);
        if offsets.is_empty() {
            return Ok(());
        }

        let mut list = TopicPartitionList::new();
        for ((topic, partition), offset) in &offsets {
            list.add_partition_offset(topic, *partition, Offset::Offset(offset + 1))?;
        }

        self.consumer
            .commit(&list, CommitMode::Sync)
            .map_err(|e| TransportError::Commit(e.to_string()))?;
        debug!(binding = %self.binding_id, partitions = offsets.len(), "Committed offsets");
        Ok(())
    }

    fn revocation_handled(&mut self) {
        if let Some(done) = &self.revocation_done {
            let _ = done.send(());
        }
    }

    async fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        // Unblocks a rebalance callback still waiting on this worker
        self.revocation_done.take();
        self.events.close();
        self.consumer.unsubscribe();
        debug!(binding = %self.binding_id, "Kafka subscription closed");
    }
}

impl Drop for KafkaSubscription {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

struct KafkaProducer {
    producer: FutureProducer,
}

#[async_trait]
impl Producer for KafkaProducer {
    async fn send(
        &self,
        record: OutboundRecord,
        timeout: Duration,
    ) -> TransportResult<DeliveryReport> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &record.headers {
            headers = headers.insert(Header {
                key,
                value: Some(value.as_str()),
            });
        }

        let mut future_record = FutureRecord::to(&record.topic)
            .payload(&record.payload)
            .headers(headers);
        if let Some(key) = &record.key {
            future_record = future_record.key(key);
        }

        match self.producer.send(future_record, Timeout::After(timeout)).await {
            Ok((partition, offset)) => Ok(DeliveryReport {
                topic: record.topic.clone(),
                partition: Some(partition),
                offset: Some(offset),
                id: None,
                delivered: true,
            }),
            Err((e, _)) => Err(TransportError::Delivery(e.to_string())),
        }
    }
}
