//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use topic_dispatch::message::TopicPartition;
use topic_dispatch::{Consumer, MemoryBroker};

pub const GROUP_ID: &str = "topic-dispatch";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: u32,
}

/// Consumer that records everything that happens to it
#[derive(Default)]
pub struct Orders {
    pub seen: Mutex<Vec<u32>>,
    pub batches: Mutex<Vec<usize>>,
    pub events: Mutex<Vec<String>>,
}

impl Orders {
    pub fn seen(&self) -> Vec<u32> {
        self.seen.lock().clone()
    }

    pub fn batches(&self) -> Vec<usize> {
        self.batches.lock().clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn record(&self, event: String) {
        self.events.lock().push(event);
    }
}

#[async_trait]
impl Consumer for Orders {
    async fn on_started(&self, binding: &str) -> anyhow::Result<()> {
        self.record(format!("started {}", binding));
        Ok(())
    }

    async fn on_stopped(&self, binding: &str) -> anyhow::Result<()> {
        self.record(format!("stopped {}", binding));
        Ok(())
    }

    async fn on_error(&self, binding: &str, error: &anyhow::Error) -> anyhow::Result<()> {
        self.record(format!("error {}: {}", binding, error));
        Ok(())
    }

    async fn on_partitions_assigned(
        &self,
        _binding: &str,
        partitions: &[TopicPartition],
    ) -> anyhow::Result<()> {
        self.record(format!("assigned {}", partitions.len()));
        Ok(())
    }

    async fn on_partitions_revoked(
        &self,
        _binding: &str,
        partitions: &[TopicPartition],
    ) -> anyhow::Result<()> {
        self.record(format!("revoked {}", partitions.len()));
        Ok(())
    }
}

/// Consumer group a binding reads through
pub fn group_of(binding_id: &str) -> String {
    format!("{}.{}", GROUP_ID, binding_id)
}

pub fn push_orders(broker: &MemoryBroker, topic: &str, ids: impl IntoIterator<Item = u32>) {
    for id in ids {
        let payload = serde_json::to_vec(&Order { id }).expect("serialize order");
        broker.push(topic, payload);
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Run `fut`, failing the test if it takes longer than five seconds
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}
