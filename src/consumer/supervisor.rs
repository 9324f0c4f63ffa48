//! Worker supervision
//!
//! The supervisor spawns one task per binding. Each task subscribes, runs its
//! worker and, when the worker fails, restarts it with backoff until the
//! restart policy is exhausted. The budget counts consecutive failures: a run
//! that completes at least one batch before failing starts it over. A binding that gives up is marked failed and
//! leaves the supervisor degraded; every other binding keeps running.

use crate::config::DispatchConfig;
use crate::consumer::dlq::DeadLetterSink;
use crate::consumer::lifecycle::{panic_message, Lifecycle};
use crate::consumer::metrics::ConsumerMetrics;
use crate::consumer::retry::RetryPolicy;
use crate::consumer::shutdown::ShutdownState;
use crate::consumer::worker::{Worker, WorkerError};
use crate::error::{DispatchError, Result};
use crate::publisher::{Publisher, PublisherConfig};
use crate::registry::ConsumerMetadata;
use crate::transport::Transport;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Supervisor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SupervisorState {
    /// `start` has not been called
    NotStarted,
    /// Connecting and spawning workers
    Starting,
    /// All bindings are supervised
    Running,
    /// Running, but at least one binding exhausted its restarts
    Degraded,
    /// `stop` is in progress
    Stopping,
    /// Every worker has exited
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SupervisorState::NotStarted => "not_started",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Degraded => "degraded",
            SupervisorState::Stopping => "stopping",
            SupervisorState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// State of one supervised binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BindingStatus {
    /// Subscribing for the first time
    Starting,
    /// Worker is consuming
    Running,
    /// Waiting to resubscribe after a failure
    Restarting {
        /// Restart number, starting at 1
        attempt: u32,
    },
    /// Restarts exhausted; the binding is no longer consuming
    Failed(String),
    /// Worker exited after a stop request
    Stopped,
}

/// Outcome of [`Supervisor::stop`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Supervised bindings
    pub total: usize,
    /// Workers that finished their open batch and exited in time
    pub graceful: usize,
    /// Workers aborted at the deadline
    pub forced: usize,
    /// Batches still being handled when workers were aborted
    pub inflight_lost: usize,
}

impl ShutdownReport {
    /// True when no worker had to be aborted
    pub fn is_graceful(&self) -> bool {
        self.forced == 0
    }
}

struct SupervisedTask {
    binding_id: String,
    lifecycle: Arc<Lifecycle>,
    handle: JoinHandle<()>,
}

type Statuses = Arc<RwLock<BTreeMap<String, BindingStatus>>>;

/// Runs and restarts workers for every scanned binding
pub struct Supervisor {
    transport: Arc<dyn Transport>,
    group_id: String,
    restart_policy: RetryPolicy,
    publisher_config: PublisherConfig,
    publisher: Option<Publisher>,
    owns_publisher: bool,
    state: Arc<RwLock<SupervisorState>>,
    statuses: Statuses,
    metrics: ConsumerMetrics,
    shutdown: Arc<ShutdownState>,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<SupervisedTask>,
}

impl Supervisor {
    /// Create an idle supervisor
    pub fn new(transport: Arc<dyn Transport>, config: &DispatchConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            transport,
            group_id: config.group_id.clone(),
            restart_policy: config.restart_policy.clone(),
            publisher_config: PublisherConfig::from(config),
            publisher: None,
            owns_publisher: false,
            state: Arc::new(RwLock::new(SupervisorState::NotStarted)),
            statuses: Arc::new(RwLock::new(BTreeMap::new())),
            metrics: ConsumerMetrics::new(),
            shutdown: Arc::new(ShutdownState::new()),
            stop_tx,
            tasks: Vec::new(),
        }
    }

    /// Dead-letter through an existing publisher instead of spawning one
    pub fn with_publisher(mut self, publisher: Publisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Current state; a degraded supervisor still reports `Running`
    pub fn state(&self) -> SupervisorState {
        match *self.state.read() {
            SupervisorState::Degraded => SupervisorState::Running,
            state => state,
        }
    }

    /// True when at least one binding has exhausted its restarts
    pub fn is_degraded(&self) -> bool {
        *self.state.read() == SupervisorState::Degraded
    }

    /// Status of one binding
    pub fn binding_status(&self, binding_id: &str) -> Option<BindingStatus> {
        self.statuses.read().get(binding_id).cloned()
    }

    /// Status of every binding, keyed by binding id
    pub fn binding_statuses(&self) -> BTreeMap<String, BindingStatus> {
        self.statuses.read().clone()
    }

    /// Shared metrics of all workers
    pub fn metrics(&self) -> &ConsumerMetrics {
        &self.metrics
    }

    /// Connect and spawn one supervised worker per binding.
    ///
    /// With no bindings the supervisor goes straight to `Running` without
    /// touching the transport.
    pub async fn start(&mut self, bindings: Vec<ConsumerMetadata>) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != SupervisorState::NotStarted {
                return Err(DispatchError::InvalidState(format!(
                    "supervisor cannot start from state {}",
                    *state
                )));
            }
            *state = SupervisorState::Starting;
        }

        if bindings.is_empty() {
            info!("No consumer bindings registered, supervisor idle");
            *self.state.write() = SupervisorState::Running;
            return Ok(());
        }

        info!(
            transport = self.transport.name(),
            bindings = bindings.len(),
            "Starting supervisor"
        );

        if let Err(e) = self.transport.connect().await {
            error!(transport = self.transport.name(), error = %e, "Transport connection failed");
            *self.state.write() = SupervisorState::Stopped;
            return Err(e.into());
        }

        let publisher = if bindings.iter().any(|b| b.dead_letter.is_some()) {
            match self.dead_letter_publisher().await {
                Ok(publisher) => Some(publisher),
                Err(e) => {
                    *self.state.write() = SupervisorState::Stopped;
                    return Err(e);
                }
            }
        } else {
            None
        };

        for metadata in bindings {
            let dead_letter = match (&metadata.dead_letter, &publisher) {
                (Some(topic), Some(publisher)) => {
                    Some(DeadLetterSink::new(publisher.clone(), topic.clone()))
                }
                _ => None,
            };
            self.spawn_binding(metadata, dead_letter);
        }

        {
            let mut state = self.state.write();
            if *state == SupervisorState::Starting {
                *state = SupervisorState::Running;
            }
        }
        info!(bindings = self.tasks.len(), "Supervisor running");
        Ok(())
    }

    async fn dead_letter_publisher(&mut self) -> Result<Publisher> {
        if let Some(publisher) = &self.publisher {
            return Ok(publisher.clone());
        }
        let producer = self.transport.producer().await?;
        let publisher = Publisher::spawn(producer, self.publisher_config);
        self.publisher = Some(publisher.clone());
        self.owns_publisher = true;
        Ok(publisher)
    }

    fn spawn_binding(&mut self, metadata: ConsumerMetadata, dead_letter: Option<DeadLetterSink>) {
        let binding_id = metadata.binding_id();
        let lifecycle = Arc::new(Lifecycle::new(
            metadata.lifecycle.clone(),
            Arc::from(binding_id.as_str()),
        ));
        let worker = Worker::new(
            Arc::new(metadata),
            dead_letter,
            lifecycle.clone(),
            self.metrics.clone(),
            self.shutdown.clone(),
        );

        self.statuses
            .write()
            .insert(binding_id.clone(), BindingStatus::Starting);

        let supervised = Supervised {
            transport: self.transport.clone(),
            group_id: self.group_id.clone(),
            restart_policy: self.restart_policy.clone(),
            lifecycle: lifecycle.clone(),
            statuses: self.statuses.clone(),
            state: self.state.clone(),
            metrics: self.metrics.clone(),
        };
        let stop = self.stop_tx.subscribe();
        let handle = tokio::spawn(supervised.run(worker, stop));

        self.tasks.push(SupervisedTask {
            binding_id,
            lifecycle,
            handle,
        });
    }

    /// Signal every worker to stop and wait up to `timeout` for them.
    ///
    /// Workers still running at the deadline are aborted and reported as
    /// forced. Never fails.
    pub async fn stop(&mut self, timeout: Duration) -> ShutdownReport {
        {
            let mut state = self.state.write();
            match *state {
                SupervisorState::Stopped => return ShutdownReport::default(),
                SupervisorState::NotStarted => {
                    *state = SupervisorState::Stopped;
                    return ShutdownReport::default();
                }
                _ => *state = SupervisorState::Stopping,
            }
        }

        let total = self.tasks.len();
        info!(bindings = total, timeout_ms = timeout.as_millis() as u64, "Stopping supervisor");

        self.shutdown.begin_shutdown();
        self.stop_tx.send_replace(true);

        let deadline = Instant::now() + timeout;
        let mut report = ShutdownReport {
            total,
            ..Default::default()
        };
        let mut inflight_at_deadline = None;

        for mut task in self.tasks.drain(..) {
            match tokio::time::timeout_at(deadline, &mut task.handle).await {
                Ok(Ok(())) => {
                    report.graceful += 1;
                    debug!(binding = %task.binding_id, "Worker stopped gracefully");
                }
                Ok(Err(e)) => {
                    warn!(binding = %task.binding_id, error = %e, "Worker task ended abnormally");
                    report.forced += 1;
                    task.lifecycle.stopped().await;
                }
                Err(_) => {
                    let inflight =
                        *inflight_at_deadline.get_or_insert_with(|| self.shutdown.inflight_count());
                    warn!(
                        binding = %task.binding_id,
                        inflight,
                        "Worker did not stop within timeout, forcing termination"
                    );
                    task.handle.abort();
                    report.forced += 1;
                    task.lifecycle.stopped().await;
                    self.statuses
                        .write()
                        .insert(task.binding_id.clone(), BindingStatus::Stopped);
                }
            }
        }

        report.inflight_lost = inflight_at_deadline.unwrap_or(0);
        if self.owns_publisher {
            if let Some(publisher) = &self.publisher {
                publisher.close().await;
            }
        }
        self.shutdown.complete_shutdown();
        *self.state.write() = SupervisorState::Stopped;

        info!(
            "Shutdown complete: {}/{} bindings shutdown gracefully",
            report.graceful, report.total
        );
        if report.inflight_lost > 0 {
            warn!(inflight_lost = report.inflight_lost, "Batches abandoned during shutdown");
        }
        report
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

/// Everything a supervised task needs besides its worker
struct Supervised {
    transport: Arc<dyn Transport>,
    group_id: String,
    restart_policy: RetryPolicy,
    lifecycle: Arc<Lifecycle>,
    statuses: Statuses,
    state: Arc<RwLock<SupervisorState>>,
    metrics: ConsumerMetrics,
}

impl Supervised {
    async fn run(self, worker: Worker, mut stop: watch::Receiver<bool>) {
        let binding = worker.transport_binding(&self.group_id);
        let binding_id = worker.binding_id().to_string();
        let mut restarts = 0u32;

        loop {
            let stopping = *stop.borrow();
            if stopping {
                self.set_status(&binding_id, BindingStatus::Stopped);
                break;
            }

            let completed_before = worker.completed_batches();
            let outcome = match self.transport.subscribe(&binding).await {
                Ok(mut subscription) => {
                    self.set_status(&binding_id, BindingStatus::Running);
                    let result = AssertUnwindSafe(worker.run(subscription.as_mut(), &mut stop))
                        .catch_unwind()
                        .await;
                    subscription.close().await;
                    match result {
                        Ok(result) => result,
                        Err(panic) => Err(WorkerError::Panicked(panic_message(&*panic))),
                    }
                }
                Err(e) => {
                    warn!(binding = %binding_id, error = %e, "Subscription failed");
                    self.lifecycle
                        .error(&anyhow::anyhow!("subscription failed: {}", e))
                        .await;
                    Err(WorkerError::Transport(e))
                }
            };

            let err = match outcome {
                Ok(()) => {
                    self.set_status(&binding_id, BindingStatus::Stopped);
                    break;
                }
                Err(err) => err,
            };

            self.metrics.record_error(err.kind());

            let stopping = *stop.borrow();
            if stopping {
                warn!(binding = %binding_id, error = %err, "Worker failed during shutdown");
                self.set_status(&binding_id, BindingStatus::Stopped);
                break;
            }

            // The restart budget bounds consecutive failures only.
            if restarts > 0 && worker.completed_batches() > completed_before {
                debug!(binding = %binding_id, restarts, "Worker made progress, restart budget reset");
                restarts = 0;
            }

            if !self.restart_policy.should_retry(restarts) {
                error!(
                    binding = %binding_id,
                    restarts,
                    error = %err,
                    "Worker failed permanently, restarts exhausted"
                );
                self.set_status(&binding_id, BindingStatus::Failed(err.to_string()));
                self.mark_degraded();
                break;
            }

            restarts += 1;
            self.metrics.increment_restart();
            let backoff = self.restart_policy.next_backoff(restarts);
            warn!(
                binding = %binding_id,
                attempt = restarts,
                max_restarts = self.restart_policy.max_retries,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Worker failed, restarting"
            );
            self.set_status(&binding_id, BindingStatus::Restarting { attempt: restarts });

            tokio::select! {
                _ = stop.changed() => {
                    self.set_status(&binding_id, BindingStatus::Stopped);
                    break;
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        self.lifecycle.stopped().await;
    }

    fn set_status(&self, binding_id: &str, status: BindingStatus) {
        self.statuses.write().insert(binding_id.to_string(), status);
    }

    fn mark_degraded(&self) {
        let mut state = self.state.write();
        if matches!(*state, SupervisorState::Running | SupervisorState::Starting) {
            *state = SupervisorState::Degraded;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::context::HandlerContext;
    use crate::message::Envelope;
    use crate::registry::{Consumer, ConsumerRegistry, HandlerBinding};
    use crate::transport::MemoryBroker;
    use async_trait::async_trait;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Ping {
        #[allow(dead_code)]
        n: u32,
    }

    struct Pinger;

    #[async_trait]
    impl Consumer for Pinger {}

    fn config() -> DispatchConfig {
        DispatchConfig::builder()
            .restart_policy(RetryPolicy::fixed(1, Duration::from_millis(10)))
            .build()
    }

    #[tokio::test]
    async fn test_idle_start_and_stop() {
        let broker = MemoryBroker::new();
        let mut supervisor = Supervisor::new(Arc::new(broker), &config());
        assert_eq!(supervisor.state(), SupervisorState::NotStarted);

        supervisor.start(Vec::new()).await.unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Running);

        let report = supervisor.stop(Duration::from_secs(1)).await;
        assert_eq!(report, ShutdownReport::default());
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let mut supervisor = Supervisor::new(Arc::new(MemoryBroker::new()), &config());
        supervisor.start(Vec::new()).await.unwrap();

        let err = supervisor.start(Vec::new()).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_binding_fails_after_restarts() {
        let broker = MemoryBroker::new();
        broker.fail_subscriptions("pings", 10);

        let mut registry = ConsumerRegistry::new();
        registry.consumer(Arc::new(Pinger)).on(
            HandlerBinding::new("on_ping").topics(["pings"]),
            |_: Arc<Pinger>, _ping: Envelope<Ping>, _ctx: HandlerContext| async move {
                anyhow::Ok(())
            },
        );
        let cfg = config();
        let bindings = registry.scan(&cfg).unwrap();

        let mut supervisor = Supervisor::new(Arc::new(broker.clone()), &cfg);
        supervisor.start(bindings).await.unwrap();

        for _ in 0..100 {
            if supervisor.is_degraded() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(supervisor.is_degraded());
        assert_eq!(supervisor.state(), SupervisorState::Running);
        assert!(matches!(
            supervisor.binding_status("Pinger::on_ping"),
            Some(BindingStatus::Failed(_))
        ));
        assert_eq!(broker.subscribe_attempts("pings"), 2);
        assert_eq!(supervisor.metrics().snapshot().restarts, 1);

        let report = supervisor.stop(Duration::from_secs(1)).await;
        assert_eq!(report.graceful, 1);
    }

    #[tokio::test]
    async fn test_dead_letters_go_through_the_given_publisher() {
        let broker = MemoryBroker::new();
        broker.push("pings", b"oops".to_vec());

        let publisher = Publisher::spawn(Arc::new(broker.clone()), PublisherConfig::default());
        publisher.close().await;

        let mut registry = ConsumerRegistry::new();
        registry.consumer(Arc::new(Pinger)).on(
            HandlerBinding::new("on_ping")
                .topics(["pings"])
                .batch_timeout(Duration::from_millis(10))
                .dead_letter("pings.dlq"),
            |_: Arc<Pinger>, _ping: Envelope<Ping>, _ctx: HandlerContext| async move {
                anyhow::Ok(())
            },
        );
        let cfg = config();
        let bindings = registry.scan(&cfg).unwrap();

        let mut supervisor =
            Supervisor::new(Arc::new(broker.clone()), &cfg).with_publisher(publisher);
        supervisor.start(bindings).await.unwrap();

        for _ in 0..100 {
            if supervisor.is_degraded() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(supervisor.is_degraded());
        assert_eq!(broker.topic_len("pings.dlq"), 0);
        assert_eq!(broker.committed_offset("topic-dispatch.Pinger::on_ping", "pings"), 0);

        supervisor.stop(Duration::from_secs(1)).await;
    }
}
