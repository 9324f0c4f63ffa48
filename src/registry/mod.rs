//! Consumer registration and startup scanning
//!
//! Applications register consumer instances and their handler functions in a
//! [`ConsumerRegistry`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use topic_dispatch::{Consumer, ConsumerRegistry, DispatchConfig, Envelope, HandlerBinding};
//!
//! #[derive(serde::Deserialize)]
//! struct PageView { url: String }
//!
//! struct Analytics;
//!
//! #[async_trait::async_trait]
//! impl Consumer for Analytics {}
//!
//! # fn main() -> topic_dispatch::Result<()> {
//! let mut registry = ConsumerRegistry::new();
//! registry
//!     .consumer(Arc::new(Analytics))
//!     .on(
//!         HandlerBinding::new("on_page_view").group("Analytics").batch_size(50),
//!         |_me: Arc<Analytics>, view: Envelope<PageView>, _ctx| async move {
//!             tracing::info!(url = %view.message.url, "page view");
//!             anyhow::Ok(())
//!         },
//!     );
//!
//! let config = DispatchConfig::builder()
//!     .topic_group("Analytics", ["topic.a", "topic.b"])
//!     .build();
//! let metadata = registry.scan(&config)?;
//! assert_eq!(metadata[0].topics, vec!["topic.a", "topic.b"]);
//! # Ok(())
//! # }
//! ```
//!
//! [`ConsumerRegistry::scan`] validates every registration against the
//! configuration and produces the immutable [`ConsumerMetadata`] list the
//! supervisor runs.

pub(crate) mod handler;

use crate::config::{CommitStrategy, DispatchConfig, ProcessingConfig};
use crate::consumer::context::HandlerContext;
use crate::consumer::retry::RetryPolicy;
use crate::error::{DispatchError, Result};
use crate::message::{Envelope, TopicPartition};
use crate::resolver::{resolve, validate_groups, TopicSpec, TopicsConfig};
use async_trait::async_trait;
use handler::{BulkHandler, ErasedHandler, SingleHandler};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Lifecycle callbacks of a registered consumer
///
/// Every callback receives the binding id (`Consumer::handler`) it concerns
/// and defaults to doing nothing. Errors and panics raised here are logged
/// and never stop the worker.
#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    /// A worker for `binding` is about to receive its first batch
    async fn on_started(&self, _binding: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// The worker for `binding` stopped for good
    async fn on_stopped(&self, _binding: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// A handler or transport failure occurred in `binding`
    async fn on_error(&self, _binding: &str, _error: &anyhow::Error) -> anyhow::Result<()> {
        Ok(())
    }

    /// Partitions were assigned to `binding`
    async fn on_partitions_assigned(
        &self,
        _binding: &str,
        _partitions: &[TopicPartition],
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Partitions are being revoked from `binding`
    async fn on_partitions_revoked(
        &self,
        _binding: &str,
        _partitions: &[TopicPartition],
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Declares which topics a handler consumes and how
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerBinding {
    /// Handler name, unique per consumer
    pub name: String,
    /// Topic source
    pub topics: TopicSpec,
    /// Code-level processing overrides
    pub processing: ProcessingConfig,
    /// Dead-letter topic for messages that cannot be handled
    pub dead_letter: Option<String>,
}

impl HandlerBinding {
    /// A binding that uses the global fallback topics until told otherwise
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topics: TopicSpec::fallback(),
            processing: ProcessingConfig::default(),
            dead_letter: None,
        }
    }

    /// Consume explicit topics
    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics.direct = topics.into_iter().map(Into::into).collect();
        self
    }

    /// Consume a named topic group
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.topics.group = Some(group.into());
        self
    }

    /// Consume topics listed at a configuration path
    pub fn config_path(mut self, path: impl Into<String>) -> Self {
        self.topics.config_path = Some(path.into());
        self
    }

    /// Override the batch size
    pub fn batch_size(mut self, size: usize) -> Self {
        self.processing.batch_size = Some(size);
        self
    }

    /// Override the batch timeout
    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.processing.batch_timeout = Some(timeout);
        self
    }

    /// Override the commit strategy
    pub fn commit_strategy(mut self, strategy: CommitStrategy) -> Self {
        self.processing.commit_strategy = Some(strategy);
        self
    }

    /// Send undecodable and failed messages to `topic`
    pub fn dead_letter(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter = Some(topic.into());
        self
    }
}

struct Registration {
    consumer_name: String,
    binding: HandlerBinding,
    handler: Arc<dyn ErasedHandler>,
    lifecycle: Arc<dyn Consumer>,
}

impl Registration {
    fn binding_id(&self) -> String {
        format!("{}::{}", self.consumer_name, self.binding.name)
    }
}

/// Everything a worker needs to run one handler binding
#[derive(Clone)]
pub struct ConsumerMetadata {
    /// Registered consumer name
    pub consumer_name: String,
    /// Handler name
    pub handler_name: String,
    /// Resolved topics, never empty
    pub topics: Vec<String>,
    /// Topic group the topics came from
    pub topic_group: Option<String>,
    /// Effective batch size
    pub batch_size: usize,
    /// Effective batch timeout
    pub batch_timeout: Duration,
    /// Effective commit strategy
    pub commit_strategy: CommitStrategy,
    /// Whether the handler takes the whole batch
    pub bulk: bool,
    /// Dead-letter topic
    pub dead_letter: Option<String>,
    /// Declared message type
    pub message_type: &'static str,
    /// Handler retry policy
    pub handler_retry: RetryPolicy,
    pub(crate) handler: Arc<dyn ErasedHandler>,
    pub(crate) lifecycle: Arc<dyn Consumer>,
}

impl ConsumerMetadata {
    /// `Consumer::handler` id, unique across the registry
    pub fn binding_id(&self) -> String {
        format!("{}::{}", self.consumer_name, self.handler_name)
    }
}

impl fmt::Debug for ConsumerMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerMetadata")
            .field("binding", &self.binding_id())
            .field("topics", &self.topics)
            .field("topic_group", &self.topic_group)
            .field("batch_size", &self.batch_size)
            .field("batch_timeout", &self.batch_timeout)
            .field("commit_strategy", &self.commit_strategy)
            .field("bulk", &self.bulk)
            .field("dead_letter", &self.dead_letter)
            .field("message_type", &self.message_type)
            .finish()
    }
}

/// Explicit table of consumers and their handlers
#[derive(Default)]
pub struct ConsumerRegistry {
    registrations: Vec<Registration>,
}

impl ConsumerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Start registering handlers for `consumer`
    ///
    /// The consumer is named after its type; use
    /// [`ConsumerRegistration::named`] to pick another name.
    pub fn consumer<C: Consumer>(&mut self, consumer: Arc<C>) -> ConsumerRegistration<'_, C> {
        ConsumerRegistration {
            name: short_type_name::<C>().to_string(),
            registry: self,
            consumer,
        }
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Binding ids in registration order
    pub fn binding_ids(&self) -> Vec<String> {
        self.registrations.iter().map(Registration::binding_id).collect()
    }

    /// Validate every registration and build the runtime metadata.
    ///
    /// Malformed registrations fail fast on the first one found. Missing or
    /// empty topic groups are collected across all handlers and reported in
    /// a single [`DispatchError::MissingGroups`]. Performs no I/O.
    pub fn scan(&self, config: &DispatchConfig) -> Result<Vec<ConsumerMetadata>> {
        config.validate().map_err(DispatchError::Config)?;

        let mut seen = HashSet::new();
        for registration in &self.registrations {
            let id = registration.binding_id();
            check_binding(&id, &registration.binding)?;
            if !seen.insert(id.clone()) {
                return Err(DispatchError::InvalidRegistration {
                    handler: id,
                    reason: "handler is registered more than once".to_string(),
                });
            }
        }

        let topics_config = TopicsConfig::from(config);
        let ids: Vec<String> = self.binding_ids();
        validate_groups(
            ids.iter()
                .zip(&self.registrations)
                .map(|(id, r)| (id.as_str(), &r.binding.topics)),
            topics_config,
        )?;

        let global = config.global_processing();
        let mut metadata = Vec::with_capacity(self.registrations.len());

        for (id, registration) in ids.iter().zip(&self.registrations) {
            let binding = &registration.binding;
            let topics = resolve(&binding.topics, topics_config)?;
            let effective = global
                .overridden_by(&binding.processing)
                .overridden_by(&config.handler_overrides(id, &binding.name));

            let entry = ConsumerMetadata {
                consumer_name: registration.consumer_name.clone(),
                handler_name: binding.name.clone(),
                topic_group: binding
                    .topics
                    .direct
                    .is_empty()
                    .then(|| binding.topics.group.clone())
                    .flatten(),
                topics,
                batch_size: effective.batch_size.unwrap_or(config.batch_size),
                batch_timeout: effective.batch_timeout.unwrap_or(config.batch_timeout),
                commit_strategy: effective.commit_strategy.unwrap_or(config.commit_strategy),
                bulk: registration.handler.is_bulk(),
                dead_letter: binding
                    .dead_letter
                    .clone()
                    .or_else(|| config.dead_letter_topic.clone()),
                message_type: registration.handler.message_type(),
                handler_retry: config.handler_retry.clone(),
                handler: registration.handler.clone(),
                lifecycle: registration.lifecycle.clone(),
            };

            if entry.batch_size == 0 || entry.batch_timeout.is_zero() {
                return Err(DispatchError::InvalidRegistration {
                    handler: id.clone(),
                    reason: "effective batch size and timeout must be greater than 0".to_string(),
                });
            }

            debug!(
                binding = %id,
                topics = ?entry.topics,
                batch_size = entry.batch_size,
                batch_timeout_ms = entry.batch_timeout.as_millis() as u64,
                commit_strategy = %entry.commit_strategy,
                "resolved handler binding"
            );
            metadata.push(entry);
        }

        info!(bindings = metadata.len(), "consumer scan complete");
        Ok(metadata)
    }
}

fn check_binding(id: &str, binding: &HandlerBinding) -> Result<()> {
    let invalid = |reason: &str| DispatchError::InvalidRegistration {
        handler: id.to_string(),
        reason: reason.to_string(),
    };

    if binding.name.trim().is_empty() {
        return Err(invalid("handler name cannot be blank"));
    }
    if binding.topics.direct.iter().any(|t| t.trim().is_empty()) {
        return Err(invalid("topic names cannot be blank"));
    }
    if matches!(&binding.topics.group, Some(g) if g.trim().is_empty()) {
        return Err(invalid("topic group name cannot be blank"));
    }
    if binding.processing.batch_size == Some(0) {
        return Err(invalid("batch size must be greater than 0"));
    }
    if binding.processing.batch_timeout == Some(Duration::ZERO) {
        return Err(invalid("batch timeout must be greater than 0"));
    }
    if matches!(&binding.dead_letter, Some(t) if t.trim().is_empty()) {
        return Err(invalid("dead-letter topic cannot be blank"));
    }
    if binding.topics.direct.is_empty() && binding.topics.group.is_none() {
        if let Some(path) = &binding.topics.config_path {
            return Err(DispatchError::NotImplemented(format!(
                "config-path topic source '{}' used by handler '{}'",
                path, id
            )));
        }
    }
    Ok(())
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Handler registration builder for one consumer
pub struct ConsumerRegistration<'r, C> {
    registry: &'r mut ConsumerRegistry,
    consumer: Arc<C>,
    name: String,
}

impl<'r, C: Consumer> ConsumerRegistration<'r, C> {
    /// Register under an explicit consumer name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Register a handler invoked once per message, in batch order
    pub fn on<M, F, Fut>(self, binding: HandlerBinding, handler: F) -> Self
    where
        M: DeserializeOwned + Send + 'static,
        F: Fn(Arc<C>, Envelope<M>, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler = SingleHandler::new(self.consumer.clone(), handler);
        self.push(binding, Arc::new(handler))
    }

    /// Register a handler invoked once per batch with every decoded message
    pub fn on_batch<M, F, Fut>(self, binding: HandlerBinding, handler: F) -> Self
    where
        M: DeserializeOwned + Send + 'static,
        F: Fn(Arc<C>, Vec<Envelope<M>>, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler = BulkHandler::new(self.consumer.clone(), handler);
        self.push(binding, Arc::new(handler))
    }

    fn push(self, binding: HandlerBinding, handler: Arc<dyn ErasedHandler>) -> Self {
        self.registry.registrations.push(Registration {
            consumer_name: self.name.clone(),
            binding,
            handler,
            lifecycle: self.consumer.clone(),
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Alert {
        #[allow(dead_code)]
        level: String,
    }

    struct AlertConsumer;

    #[async_trait]
    impl Consumer for AlertConsumer {}

    fn noop(
        _c: Arc<AlertConsumer>,
        _m: Envelope<Alert>,
        _ctx: HandlerContext,
    ) -> impl Future<Output = anyhow::Result<()>> + Send {
        async { Ok(()) }
    }

    fn config() -> DispatchConfig {
        DispatchConfig::builder()
            .topic_group("Analytics", ["topic.a", "topic.b"])
            .topics(["general"])
            .batch_size(100)
            .handler(
                "on_tuned",
                ProcessingConfig {
                    batch_size: Some(5),
                    ..Default::default()
                },
            )
            .build()
    }

    #[test]
    fn test_scan_resolves_and_merges() {
        let mut registry = ConsumerRegistry::new();
        registry
            .consumer(Arc::new(AlertConsumer))
            .on(
                HandlerBinding::new("on_critical")
                    .topics(["alerts.critical", "alerts.emergency"])
                    .group("Analytics"),
                noop,
            )
            .on(HandlerBinding::new("on_group").group("Analytics"), noop)
            .on(
                HandlerBinding::new("on_tuned")
                    .batch_size(10)
                    .commit_strategy(CommitStrategy::Manual),
                noop,
            );

        let metadata = registry.scan(&config()).unwrap();
        assert_eq!(metadata.len(), 3);

        assert_eq!(metadata[0].binding_id(), "AlertConsumer::on_critical");
        assert_eq!(metadata[0].topics, vec!["alerts.critical", "alerts.emergency"]);
        assert_eq!(metadata[0].topic_group, None);

        assert_eq!(metadata[1].topics, vec!["topic.a", "topic.b"]);
        assert_eq!(metadata[1].topic_group.as_deref(), Some("Analytics"));
        assert_eq!(metadata[1].batch_size, 100);

        assert_eq!(metadata[2].topics, vec!["general"]);
        assert_eq!(metadata[2].batch_size, 5);
        assert_eq!(metadata[2].commit_strategy, CommitStrategy::Manual);
        assert!(!metadata[2].bulk);
        assert!(metadata[2].message_type.ends_with("Alert"));
    }

    #[test]
    fn test_scan_rejects_duplicates_and_blank_topics() {
        let mut registry = ConsumerRegistry::new();
        registry
            .consumer(Arc::new(AlertConsumer))
            .on(HandlerBinding::new("same"), noop)
            .on(HandlerBinding::new("same"), noop);
        assert!(matches!(
            registry.scan(&config()),
            Err(DispatchError::InvalidRegistration { .. })
        ));

        let mut registry = ConsumerRegistry::new();
        registry
            .consumer(Arc::new(AlertConsumer))
            .on(HandlerBinding::new("blank").topics(["ok", " "]), noop);
        assert!(matches!(
            registry.scan(&config()),
            Err(DispatchError::InvalidRegistration { .. })
        ));
    }

    #[test]
    fn test_scan_config_path_is_not_implemented() {
        let mut registry = ConsumerRegistry::new();
        registry
            .consumer(Arc::new(AlertConsumer))
            .on(HandlerBinding::new("by_path").config_path("alerts:topics"), noop);
        assert!(matches!(
            registry.scan(&config()),
            Err(DispatchError::NotImplemented(_))
        ));
    }

    #[test]
    fn test_scan_aggregates_missing_groups() {
        let mut registry = ConsumerRegistry::new();
        registry
            .consumer(Arc::new(AlertConsumer))
            .named("Alerts")
            .on(HandlerBinding::new("a").group("Billing"), noop)
            .on(HandlerBinding::new("b").group("Audit"), noop);

        match registry.scan(&config()) {
            Err(DispatchError::MissingGroups { missing, available }) => {
                assert_eq!(missing.len(), 2);
                assert_eq!(missing[0].handler, "Alerts::a");
                assert_eq!(available, vec!["Analytics"]);
            }
            other => panic!("unexpected: {:?}", other.map(|m| m.len())),
        }
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<AlertConsumer>(), "AlertConsumer");
        assert_eq!(short_type_name::<Vec<String>>(), "Vec");
    }
}
