//! Lifecycle callback delivery
//!
//! Callbacks run inside the worker task. A failing or panicking callback is
//! logged and otherwise ignored.

use crate::message::TopicPartition;
use crate::registry::Consumer;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub(crate) struct Lifecycle {
    consumer: Arc<dyn Consumer>,
    binding_id: Arc<str>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Lifecycle {
    pub fn new(consumer: Arc<dyn Consumer>, binding_id: Arc<str>) -> Self {
        Self {
            consumer,
            binding_id,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Deliver `on_started`, at most once per binding
    pub async fn started(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.guarded("on_started", self.consumer.on_started(&self.binding_id))
            .await;
    }

    /// Deliver `on_stopped`, at most once per binding
    pub async fn stopped(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.guarded("on_stopped", self.consumer.on_stopped(&self.binding_id))
            .await;
    }

    pub async fn error(&self, error: &anyhow::Error) {
        self.guarded("on_error", self.consumer.on_error(&self.binding_id, error))
            .await;
    }

    pub async fn assigned(&self, partitions: &[TopicPartition]) {
        self.guarded(
            "on_partitions_assigned",
            self.consumer
                .on_partitions_assigned(&self.binding_id, partitions),
        )
        .await;
    }

    pub async fn revoked(&self, partitions: &[TopicPartition]) {
        self.guarded(
            "on_partitions_revoked",
            self.consumer
                .on_partitions_revoked(&self.binding_id, partitions),
        )
        .await;
    }

    async fn guarded<F>(&self, callback: &'static str, fut: F)
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(())) => debug!(binding = %self.binding_id, callback, "lifecycle callback delivered"),
            Ok(Err(e)) => warn!(binding = %self.binding_id, callback, error = %e, "lifecycle callback failed"),
            Err(panic) => warn!(
                binding = %self.binding_id,
                callback,
                panic = %panic_message(&*panic),
                "lifecycle callback panicked"
            ),
        }
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
