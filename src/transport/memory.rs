//! In-process broker with Kafka-like semantics
//!
//! Each topic is a single-partition append-only log. Consumer groups keep a
//! committed position per topic; a new subscription starts reading from that
//! position, so anything that was consumed but not committed is redelivered
//! after a restart.
//!
//! Test hooks allow injecting subscription failures, mid-stream transport
//! errors and rebalance events, and record when a worker releases a
//! revocation.

use super::{
    max_offsets, Binding, DeliveryReport, OutboundRecord, Producer, Subscription, Transport,
    TransportError, TransportEvent, TransportResult,
};
use crate::message::{DeliveryTag, RawMessage, TopicPartition};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

const PARTITION: i32 = 0;

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Vec<RawMessage>>,
    /// Next offset to read, per (group, topic)
    committed: HashMap<(String, String), i64>,
    /// Remaining subscribe failures per topic
    subscribe_failures: HashMap<String, usize>,
    /// Subscribe attempts per topic, including failed ones
    subscribe_attempts: HashMap<String, usize>,
    /// Events queued for live subscriptions
    pending: HashMap<u64, VecDeque<PendingEvent>>,
    /// Live subscriptions: id -> (group, topics)
    live: HashMap<u64, (String, Vec<String>)>,
    next_subscription_id: u64,
    commit_calls: usize,
    /// Committed position per group each time a worker released a revocation
    revocations_handled: HashMap<String, Vec<i64>>,
}

#[derive(Debug)]
enum PendingEvent {
    Event(TransportEvent),
    Error(String),
}

/// In-memory broker, cheap to clone
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    version: Arc<watch::Sender<u64>>,
    auto_create_topics: bool,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Broker that creates topics on first publish
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            version: Arc::new(version),
            auto_create_topics: true,
        }
    }

    /// Broker that rejects publishes to topics not created up front
    pub fn with_precreated_topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut broker = Self::new();
        broker.auto_create_topics = false;
        for topic in topics {
            broker.create_topic(topic);
        }
        broker
    }

    /// Create an empty topic
    pub fn create_topic(&self, topic: impl Into<String>) {
        self.state.lock().topics.entry(topic.into()).or_default();
    }

    /// Append a JSON payload directly, bypassing the producer
    pub fn push(&self, topic: &str, payload: impl Into<Vec<u8>>) -> i64 {
        let offset = {
            let mut state = self.state.lock();
            append(&mut state, OutboundRecord::new(topic, payload))
        };
        self.wake();
        offset
    }

    /// Number of messages stored on a topic
    pub fn topic_len(&self, topic: &str) -> usize {
        self.state.lock().topics.get(topic).map(Vec::len).unwrap_or(0)
    }

    /// Payloads stored on a topic, in order
    pub fn messages(&self, topic: &str) -> Vec<RawMessage> {
        self.state.lock().topics.get(topic).cloned().unwrap_or_default()
    }

    /// Next offset the group will read from the topic
    pub fn committed_offset(&self, group: &str, topic: &str) -> i64 {
        self.state
            .lock()
            .committed
            .get(&(group.to_string(), topic.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Total number of commit calls received
    pub fn commit_calls(&self) -> usize {
        self.state.lock().commit_calls
    }

    /// For each revocation the group's worker released, the group's committed
    /// position summed over its topics at that moment
    pub fn revocations_handled(&self, group: &str) -> Vec<i64> {
        self.state
            .lock()
            .revocations_handled
            .get(group)
            .cloned()
            .unwrap_or_default()
    }

    /// Make the next `count` subscriptions touching `topic` fail
    pub fn fail_subscriptions(&self, topic: &str, count: usize) {
        self.state
            .lock()
            .subscribe_failures
            .insert(topic.to_string(), count);
    }

    /// Subscribe attempts (successful or not) that included `topic`
    pub fn subscribe_attempts(&self, topic: &str) -> usize {
        self.state
            .lock()
            .subscribe_attempts
            .get(topic)
            .copied()
            .unwrap_or(0)
    }

    /// Number of live subscriptions including `topic`
    pub fn live_subscriptions(&self, topic: &str) -> usize {
        self.state
            .lock()
            .live
            .values()
            .filter(|(_, topics)| topics.iter().any(|t| t == topic))
            .count()
    }

    /// Make every live subscription on `topic` fail with a transport error
    pub fn inject_error(&self, topic: &str, message: &str) {
        self.enqueue_for_topic(topic, || PendingEvent::Error(message.to_string()));
    }

    /// Revoke and reassign the partitions of every live subscription on `topic`
    pub fn trigger_rebalance(&self, topic: &str) {
        let mut state = self.state.lock();
        let ids: Vec<(u64, Vec<String>)> = state
            .live
            .iter()
            .filter(|(_, (_, topics))| topics.iter().any(|t| t == topic))
            .map(|(id, (_, topics))| (*id, topics.clone()))
            .collect();
        for (id, topics) in ids {
            let partitions = partitions_of(&topics);
            let queue = state.pending.entry(id).or_default();
            queue.push_back(PendingEvent::Event(TransportEvent::PartitionsRevoked(
                partitions.clone(),
            )));
            queue.push_back(PendingEvent::Event(TransportEvent::PartitionsAssigned(
                partitions,
            )));
        }
        drop(state);
        self.wake();
    }

    fn enqueue_for_topic(&self, topic: &str, event: impl Fn() -> PendingEvent) {
        let mut state = self.state.lock();
        let ids: Vec<u64> = state
            .live
            .iter()
            .filter(|(_, (_, topics))| topics.iter().any(|t| t == topic))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            state.pending.entry(id).or_default().push_back(event());
        }
        drop(state);
        self.wake();
    }

    fn wake(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }
}

fn partitions_of(topics: &[String]) -> Vec<TopicPartition> {
    topics
        .iter()
        .map(|t| TopicPartition::new(t.clone(), PARTITION))
        .collect()
}

fn append(state: &mut BrokerState, record: OutboundRecord) -> i64 {
    let log = state.topics.entry(record.topic.clone()).or_default();
    let offset = log.len() as i64;
    log.push(RawMessage {
        topic: record.topic.clone(),
        tag: DeliveryTag::Offset {
            topic: record.topic,
            partition: PARTITION,
            offset,
        },
        key: record.key,
        payload: Some(record.payload),
        headers: record.headers,
        timestamp: Some(Utc::now()),
    });
    offset
}

#[async_trait]
impl Transport for MemoryBroker {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn subscribe(&self, binding: &Binding) -> TransportResult<Box<dyn Subscription>> {
        let mut state = self.state.lock();

        for topic in &binding.topics {
            *state.subscribe_attempts.entry(topic.clone()).or_insert(0) += 1;
        }

        for topic in &binding.topics {
            if let Some(remaining) = state.subscribe_failures.get_mut(topic) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TransportError::Subscription(format!(
                        "injected subscribe failure for topic '{}'",
                        topic
                    )));
                }
            }
        }

        let id = state.next_subscription_id;
        state.next_subscription_id += 1;

        let positions = binding
            .topics
            .iter()
            .map(|topic| {
                let position = state
                    .committed
                    .get(&(binding.group_id.clone(), topic.clone()))
                    .copied()
                    .unwrap_or(0);
                (topic.clone(), position)
            })
            .collect();

        state
            .live
            .insert(id, (binding.group_id.clone(), binding.topics.clone()));
        state
            .pending
            .entry(id)
            .or_default()
            .push_back(PendingEvent::Event(TransportEvent::PartitionsAssigned(
                partitions_of(&binding.topics),
            )));

        debug!(binding = %binding.id, subscription = id, "memory subscription opened");

        Ok(Box::new(MemorySubscription {
            id,
            group: binding.group_id.clone(),
            positions,
            state: self.state.clone(),
            version: self.version.subscribe(),
            closed: false,
        }))
    }

    async fn producer(&self) -> TransportResult<Arc<dyn Producer>> {
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl Producer for MemoryBroker {
    async fn send(
        &self,
        record: OutboundRecord,
        _timeout: Duration,
    ) -> TransportResult<DeliveryReport> {
        let topic = record.topic.clone();
        let offset = {
            let mut state = self.state.lock();
            if !self.auto_create_topics && !state.topics.contains_key(&topic) {
                return Err(TransportError::UnknownTopic(topic));
            }
            append(&mut state, record)
        };
        self.wake();

        Ok(DeliveryReport {
            topic,
            partition: Some(PARTITION),
            offset: Some(offset),
            id: None,
            delivered: true,
        })
    }
}

struct MemorySubscription {
    id: u64,
    group: String,
    /// Next offset to read per topic, in subscription order
    positions: Vec<(String, i64)>,
    state: Arc<Mutex<BrokerState>>,
    version: watch::Receiver<u64>,
    closed: bool,
}

impl MemorySubscription {
    fn poll_ready(&mut self) -> Option<TransportResult<TransportEvent>> {
        let mut state = self.state.lock();

        if let Some(pending) = state.pending.get_mut(&self.id).and_then(VecDeque::pop_front) {
            return Some(match pending {
                PendingEvent::Event(event) => Ok(event),
                PendingEvent::Error(message) => Err(TransportError::Connection(message)),
            });
        }

        for (topic, position) in self.positions.iter_mut() {
            if let Some(message) = state
                .topics
                .get(topic.as_str())
                .and_then(|log| log.get(*position as usize))
            {
                *position += 1;
                return Some(Ok(TransportEvent::Message(message.clone())));
            }
        }

        None
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_event(&mut self) -> Option<TransportResult<TransportEvent>> {
        loop {
            if self.closed {
                return None;
            }
            self.version.borrow_and_update();
            if let Some(event) = self.poll_ready() {
                return Some(event);
            }
            if self.version.changed().await.is_err() {
                return None;
            }
        }
    }

    async fn commit(&mut self, tags: &[DeliveryTag]) -> TransportResult<()> {
        let mut state = self.state.lock();
        state.commit_calls += 1;
        for ((topic, _), offset) in max_offsets(tags) {
            let entry = state
                .committed
                .entry((self.group.clone(), topic))
                .or_insert(0);
            if offset + 1 > *entry {
                *entry = offset + 1;
            }
        }
        Ok(())
    }

    fn revocation_handled(&mut self) {
        let mut state = self.state.lock();
        let committed: i64 = self
            .positions
            .iter()
            .map(|(topic, _)| {
                state
                    .committed
                    .get(&(self.group.clone(), topic.clone()))
                    .copied()
                    .unwrap_or(0)
            })
            .sum();
        state
            .revocations_handled
            .entry(self.group.clone())
            .or_default()
            .push(committed);
    }

    async fn close(&mut self) {
        self.closed = true;
        let mut state = self.state.lock();
        state.live.remove(&self.id);
        state.pending.remove(&self.id);
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.live.remove(&self.id);
        state.pending.remove(&self.id);
    }
}
