//! Per-binding worker loop
//!
//! A worker owns one subscription and one batch buffer. It waits on three
//! things at once: the stop signal, the open batch's deadline and the next
//! transport event. A batch is handed to the handler as soon as it is full or
//! its deadline passes, and the handler is awaited before anything else is
//! read, so batches of one binding never overlap.

use crate::config::CommitStrategy;
use crate::consumer::batch::{Batch, BatchBuffer};
use crate::consumer::context::HandlerContext;
use crate::consumer::dlq::{DeadLetterReason, DeadLetterSink};
use crate::consumer::lifecycle::Lifecycle;
use crate::consumer::metrics::ConsumerMetrics;
use crate::consumer::retry::RetryExecutor;
use crate::consumer::shutdown::{InflightGuard, ShutdownState};
use crate::message::DeliveryTag;
use crate::registry::ConsumerMetadata;
use crate::transport::{Binding, Subscription, TransportError, TransportEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Why a worker stopped before it was asked to
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Subscribing, receiving or committing failed
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The handler failed and the batch was left uncommitted for redelivery
    #[error("batch {batch_id} left uncommitted after handler failure: {message}")]
    Uncommitted {
        /// Failed batch
        batch_id: Uuid,
        /// Handler error
        message: String,
    },

    /// The handler panicked
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The transport ended the subscription
    #[error("subscription closed unexpectedly")]
    SubscriptionClosed,
}

impl WorkerError {
    /// Short label used for error metrics
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::Transport(_) => "transport",
            WorkerError::Uncommitted { .. } => "handler",
            WorkerError::Panicked(_) => "panic",
            WorkerError::SubscriptionClosed => "subscription_closed",
        }
    }
}

enum Step {
    Stop,
    Deadline,
    Event(Option<Result<TransportEvent, TransportError>>),
}

/// Runs batches for one binding; survives restarts of its subscription
pub(crate) struct Worker {
    metadata: Arc<ConsumerMetadata>,
    binding_id: Arc<str>,
    topic_group: Option<Arc<str>>,
    retry: RetryExecutor,
    dead_letter: Option<DeadLetterSink>,
    lifecycle: Arc<Lifecycle>,
    metrics: ConsumerMetrics,
    shutdown: Arc<ShutdownState>,
    completed_batches: AtomicU64,
}

impl Worker {
    pub fn new(
        metadata: Arc<ConsumerMetadata>,
        dead_letter: Option<DeadLetterSink>,
        lifecycle: Arc<Lifecycle>,
        metrics: ConsumerMetrics,
        shutdown: Arc<ShutdownState>,
    ) -> Self {
        Self {
            binding_id: Arc::from(metadata.binding_id()),
            topic_group: metadata.topic_group.as_deref().map(Arc::from),
            retry: RetryExecutor::new(metadata.handler_retry.clone()),
            metadata,
            dead_letter,
            lifecycle,
            metrics,
            shutdown,
            completed_batches: AtomicU64::new(0),
        }
    }

    pub fn binding_id(&self) -> &Arc<str> {
        &self.binding_id
    }

    /// Batches that ran to completion, including their commit, across every
    /// run of this worker
    pub fn completed_batches(&self) -> u64 {
        self.completed_batches.load(Ordering::Relaxed)
    }

    /// What to ask the transport for.
    ///
    /// Every binding consumes as its own group, `<group_id>.<binding id>`, so
    /// two handlers on the same topic each see every message.
    pub fn transport_binding(&self, group_id: &str) -> Binding {
        Binding {
            id: self.binding_id.to_string(),
            group_id: format!("{}.{}", group_id, self.binding_id),
            topics: self.metadata.topics.clone(),
            fetch_size: self.metadata.batch_size,
        }
    }

    /// Consume until stopped or until something fails.
    ///
    /// On stop, the open batch is flushed before returning.
    pub async fn run(
        &self,
        subscription: &mut dyn Subscription,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<(), WorkerError> {
        self.lifecycle.started().await;

        let mut buffer = BatchBuffer::new(
            self.binding_id.clone(),
            self.topic_group.clone(),
            self.metadata.batch_size,
            self.metadata.batch_timeout,
        );

        info!(
            binding = %self.binding_id,
            topics = ?self.metadata.topics,
            batch_size = self.metadata.batch_size,
            commit_strategy = %self.metadata.commit_strategy,
            "worker started"
        );

        loop {
            let stopping = *stop.borrow();
            if stopping {
                return self.finish(&mut buffer, subscription).await;
            }

            let deadline = buffer.deadline();
            let step = tokio::select! {
                biased;
                _ = stop.changed() => Step::Stop,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => Step::Deadline,
                event = subscription.next_event() => Step::Event(event),
            };

            match step {
                Step::Stop => return self.finish(&mut buffer, subscription).await,
                Step::Deadline => {
                    debug!(binding = %self.binding_id, messages = buffer.len(), "batch timeout reached");
                    self.flush(&mut buffer, subscription).await?;
                }
                Step::Event(Some(Ok(TransportEvent::Message(message)))) => {
                    self.metrics.increment_consumed(&self.binding_id);
                    if buffer.push(message) {
                        self.flush(&mut buffer, subscription).await?;
                    }
                }
                Step::Event(Some(Ok(TransportEvent::PartitionsAssigned(partitions)))) => {
                    info!(binding = %self.binding_id, partitions = ?partitions, "partitions assigned");
                    self.metrics.increment_rebalance();
                    self.lifecycle.assigned(&partitions).await;
                }
                Step::Event(Some(Ok(TransportEvent::PartitionsRevoked(partitions)))) => {
                    info!(binding = %self.binding_id, partitions = ?partitions, "partitions revoked");
                    self.flush(&mut buffer, subscription).await?;
                    self.lifecycle.revoked(&partitions).await;
                    subscription.revocation_handled();
                }
                Step::Event(Some(Err(e))) => {
                    error!(binding = %self.binding_id, error = %e, "transport error");
                    self.metrics.record_error("transport");
                    self.lifecycle.error(&anyhow::anyhow!("transport error: {}", e)).await;
                    return Err(e.into());
                }
                Step::Event(None) => {
                    warn!(binding = %self.binding_id, "subscription closed");
                    return Err(WorkerError::SubscriptionClosed);
                }
            }
        }
    }

    async fn finish(
        &self,
        buffer: &mut BatchBuffer,
        subscription: &mut dyn Subscription,
    ) -> Result<(), WorkerError> {
        if !buffer.is_empty() {
            info!(binding = %self.binding_id, messages = buffer.len(), "flushing open batch before stop");
        }
        self.flush(buffer, subscription).await?;
        info!(binding = %self.binding_id, "worker stopped");
        Ok(())
    }

    async fn flush(
        &self,
        buffer: &mut BatchBuffer,
        subscription: &mut dyn Subscription,
    ) -> Result<(), WorkerError> {
        match buffer.take() {
            Some(batch) => self.process_batch(batch, subscription).await,
            None => Ok(()),
        }
    }

    async fn process_batch(
        &self,
        batch: Batch,
        subscription: &mut dyn Subscription,
    ) -> Result<(), WorkerError> {
        let _inflight = InflightGuard::new(&self.shutdown);
        let strategy = self.metadata.commit_strategy;
        let tags = batch.tags();

        debug!(
            binding = %self.binding_id,
            batch_id = %batch.id,
            messages = batch.len(),
            "dispatching batch"
        );

        if strategy == CommitStrategy::AfterBatchReceived {
            self.commit(subscription, &tags, batch.id).await?;
        }

        // Without a dead-letter target an at-least-once batch must stop at the
        // first failure so nothing after it is committed.
        let keep_going = !(strategy == CommitStrategy::AfterSuccessfulProcessing
            && self.dead_letter.is_none());

        let ctx = HandlerContext::new(
            self.binding_id.clone(),
            self.topic_group.clone(),
            batch.id,
            batch.len(),
        );
        let started = Instant::now();
        let invocation = self
            .metadata
            .handler
            .invoke(&batch.messages, &ctx, &self.retry, keep_going)
            .await;
        self.metrics.record_batch(started.elapsed());
        debug!(
            binding = %self.binding_id,
            batch_id = %batch.id,
            handled = invocation.handled,
            retries = invocation.retries,
            succeeded = invocation.succeeded(),
            "handler returned"
        );

        for (index, reason) in &invocation.undecodable {
            self.metrics.increment_undecodable();
            let message = &batch.messages[*index];
            let Some(sink) = &self.dead_letter else {
                warn!(
                    binding = %self.binding_id,
                    tag = %message.tag,
                    error = %reason,
                    "dropping undecodable message"
                );
                continue;
            };
            match sink
                .send(message, &self.binding_id, DeadLetterReason::Undecodable, reason, 0)
                .await
            {
                Ok(()) => self.metrics.increment_dead_lettered(),
                // Committing past a message that never reached the dead-letter
                // topic would lose it.
                Err(e) if strategy == CommitStrategy::AfterSuccessfulProcessing => {
                    self.metrics.record_error("dead_letter");
                    return Err(WorkerError::Uncommitted {
                        batch_id: batch.id,
                        message: format!("dead-lettering {} failed: {}", message.tag, e),
                    });
                }
                Err(e) => {
                    self.metrics.record_error("dead_letter");
                    error!(
                        binding = %self.binding_id,
                        tag = %message.tag,
                        error = %e,
                        "undecodable message could not be dead-lettered and is lost"
                    );
                }
            }
        }

        self.metrics.add_processed(invocation.handled);
        self.metrics.add_failed(invocation.failed.len());

        if let Some(err) = &invocation.error {
            self.metrics.record_error("handler");
            self.lifecycle.error(err).await;
        }

        match strategy {
            CommitStrategy::AfterSuccessfulProcessing => {
                if let Some(err) = &invocation.error {
                    let Some(sink) = &self.dead_letter else {
                        warn!(
                            binding = %self.binding_id,
                            batch_id = %batch.id,
                            "handler failed, batch left uncommitted for redelivery"
                        );
                        return Err(WorkerError::Uncommitted {
                            batch_id: batch.id,
                            message: format!("{:#}", err),
                        });
                    };

                    for (index, reason) in &invocation.failed {
                        let message = &batch.messages[*index];
                        let attempts = self.metadata.handler_retry.max_retries + 1;
                        if let Err(e) = sink
                            .send(message, &self.binding_id, DeadLetterReason::HandlerFailed, reason, attempts)
                            .await
                        {
                            self.metrics.record_error("dead_letter");
                            return Err(WorkerError::Uncommitted {
                                batch_id: batch.id,
                                message: format!("dead-lettering {} failed: {}", message.tag, e),
                            });
                        }
                        self.metrics.increment_dead_lettered();
                    }
                }
                self.commit(subscription, &tags, batch.id).await?;
            }
            CommitStrategy::AfterBatchReceived => {
                if invocation.error.is_some() {
                    warn!(
                        binding = %self.binding_id,
                        batch_id = %batch.id,
                        failed = invocation.failed.len(),
                        "handler failed on an already committed batch, messages are lost"
                    );
                }
            }
            CommitStrategy::Manual => {
                if ctx.commit_requested() {
                    self.commit(subscription, &tags, batch.id).await?;
                } else {
                    debug!(binding = %self.binding_id, batch_id = %batch.id, "manual batch not committed");
                }
            }
        }

        self.completed_batches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn commit(
        &self,
        subscription: &mut dyn Subscription,
        tags: &[DeliveryTag],
        batch_id: Uuid,
    ) -> Result<(), WorkerError> {
        let started = Instant::now();
        match subscription.commit(tags).await {
            Ok(()) => {
                self.metrics.record_commit(started.elapsed());
                debug!(binding = %self.binding_id, batch_id = %batch_id, messages = tags.len(), "batch committed");
                Ok(())
            }
            Err(e) => {
                error!(binding = %self.binding_id, batch_id = %batch_id, error = %e, "commit failed");
                self.metrics.record_error("commit");
                self.lifecycle.error(&anyhow::anyhow!("commit failed: {}", e)).await;
                Err(e.into())
            }
        }
    }
}
