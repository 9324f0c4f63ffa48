//! Dispatch configuration
//!
//! A single [`DispatchConfig`] describes one transport: connection settings,
//! the named topic groups handlers may bind to, global batching and commit
//! defaults, restart and retry policies, and per-handler overrides.
//!
//! Configuration can be built in code via [`DispatchConfig::builder`], loaded
//! from a YAML or JSON file, and adjusted through `DISPATCH_*` environment
//! variables.

use crate::consumer::retry::RetryPolicy;
use crate::error::{DispatchError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Serde helpers for durations stored as integer milliseconds
pub mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize a duration as milliseconds
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    /// Deserialize milliseconds into a duration
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// When a worker commits (acknowledges) a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStrategy {
    /// Commit only after the handler succeeded (at-least-once)
    #[default]
    #[serde(alias = "AfterSuccessfulProcessing")]
    AfterSuccessfulProcessing,
    /// Commit as soon as the batch is formed, before the handler runs (at-most-once)
    #[serde(alias = "AfterBatchReceived")]
    AfterBatchReceived,
    /// Never commit automatically; the handler requests commits explicitly
    #[serde(alias = "Manual")]
    Manual,
}

impl std::fmt::Display for CommitStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CommitStrategy::AfterSuccessfulProcessing => "after_successful_processing",
            CommitStrategy::AfterBatchReceived => "after_batch_received",
            CommitStrategy::Manual => "manual",
        };
        f.write_str(name)
    }
}

impl FromStr for CommitStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "aftersuccessfulprocessing" => Ok(CommitStrategy::AfterSuccessfulProcessing),
            "afterbatchreceived" => Ok(CommitStrategy::AfterBatchReceived),
            "manual" => Ok(CommitStrategy::Manual),
            other => Err(format!("unknown commit strategy '{}'", other)),
        }
    }
}

/// Negative numbers mean "unset" so `-1` can be used in config files
fn sentinel_usize<'de, D>(deserializer: D) -> std::result::Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<i64>::deserialize(deserializer)?;
    Ok(value.and_then(|v| usize::try_from(v).ok()))
}

fn sentinel_millis<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<i64>::deserialize(deserializer)?;
    Ok(value
        .and_then(|v| u64::try_from(v).ok())
        .map(Duration::from_millis))
}

fn serialize_option_millis<S>(
    value: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
        None => serializer.serialize_none(),
    }
}

/// Per-handler overrides of the global batching and commit settings
///
/// Every field is optional; an unset field falls back to the next layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Messages per batch
    #[serde(deserialize_with = "sentinel_usize", skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    /// Maximum time a batch stays open after its first message
    #[serde(
        rename = "batch_timeout_ms",
        deserialize_with = "sentinel_millis",
        serialize_with = "serialize_option_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub batch_timeout: Option<Duration>,
    /// Commit strategy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_strategy: Option<CommitStrategy>,
}

impl ProcessingConfig {
    /// Layer `other` on top of `self`: fields set in `other` win
    pub fn overridden_by(&self, other: &ProcessingConfig) -> ProcessingConfig {
        ProcessingConfig {
            batch_size: other.batch_size.or(self.batch_size),
            batch_timeout: other.batch_timeout.or(self.batch_timeout),
            commit_strategy: other.commit_strategy.or(self.commit_strategy),
        }
    }

    /// True when no field is set
    pub fn is_empty(&self) -> bool {
        self.batch_size.is_none() && self.batch_timeout.is_none() && self.commit_strategy.is_none()
    }
}

/// Configuration of one transport and every handler bound to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Broker connection string (comma-separated bootstrap servers or URL)
    pub brokers: String,

    /// Consumer group shared by every handler of this service
    pub group_id: String,

    /// Named topic groups handlers can bind to
    pub topic_groups: BTreeMap<String, Vec<String>>,

    /// Fallback topics for handlers that name neither topics nor a group
    pub topics: Vec<String>,

    /// Default messages per batch
    pub batch_size: usize,

    /// Default batch timeout
    #[serde(rename = "batch_timeout_ms", with = "millis")]
    pub batch_timeout: Duration,

    /// Default commit strategy
    pub commit_strategy: CommitStrategy,

    /// Worker restart policy applied by the supervisor
    pub restart_policy: RetryPolicy,

    /// Handler retry policy applied inside a worker before a batch is failed
    pub handler_retry: RetryPolicy,

    /// Dead-letter topic used when a handler names none
    pub dead_letter_topic: Option<String>,

    /// Grace period for in-flight batches at shutdown
    #[serde(rename = "shutdown_timeout_ms", with = "millis")]
    pub shutdown_timeout: Duration,

    /// Time a publish call waits for the broker acknowledgement
    #[serde(rename = "publish_timeout_ms", with = "millis")]
    pub publish_timeout: Duration,

    /// Capacity of the publisher's request queue
    pub publisher_buffer: usize,

    /// Overrides keyed by handler name or `Consumer::handler` binding id
    pub handlers: BTreeMap<String, ProcessingConfig>,

    /// Extra client properties passed through to the broker client
    pub properties: HashMap<String, String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            group_id: "topic-dispatch".to_string(),
            topic_groups: BTreeMap::new(),
            topics: Vec::new(),
            batch_size: 100,
            batch_timeout: Duration::from_millis(1000),
            commit_strategy: CommitStrategy::default(),
            restart_policy: RetryPolicy::exponential(
                3,
                Duration::from_millis(500),
                Duration::from_secs(30),
            ),
            handler_retry: RetryPolicy::no_retry(),
            dead_letter_topic: None,
            shutdown_timeout: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(10),
            publisher_buffer: 1024,
            handlers: BTreeMap::new(),
            properties: HashMap::new(),
        }
    }
}

impl DispatchConfig {
    /// Create a new config builder
    pub fn builder() -> DispatchConfigBuilder {
        DispatchConfigBuilder::new()
    }

    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Parse a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a `.json`, `.yaml` or `.yml` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        debug!(path = %path.display(), "loading dispatch configuration");

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            _ => Self::from_yaml_str(&contents),
        }
    }

    /// Apply `DISPATCH_*` environment variables on top of the loaded values
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(brokers) = lookup("DISPATCH_BROKERS") {
            self.brokers = brokers;
        }
        if let Some(group_id) = lookup("DISPATCH_GROUP_ID") {
            self.group_id = group_id;
        }
        if let Some(topics) = lookup("DISPATCH_TOPICS") {
            self.topics = topics
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(size) = lookup("DISPATCH_BATCH_SIZE") {
            self.batch_size = size.parse().map_err(|_| {
                DispatchError::Config(format!("DISPATCH_BATCH_SIZE '{}' is not a number", size))
            })?;
        }
        if let Some(timeout) = lookup("DISPATCH_BATCH_TIMEOUT_MS") {
            let millis: u64 = timeout.parse().map_err(|_| {
                DispatchError::Config(format!(
                    "DISPATCH_BATCH_TIMEOUT_MS '{}' is not a number",
                    timeout
                ))
            })?;
            self.batch_timeout = Duration::from_millis(millis);
        }
        if let Some(strategy) = lookup("DISPATCH_COMMIT_STRATEGY") {
            self.commit_strategy = strategy.parse().map_err(DispatchError::Config)?;
        }
        Ok(())
    }

    /// Overrides configured for a handler
    ///
    /// A `Consumer::handler` key takes precedence over a bare handler name.
    pub fn handler_overrides(&self, binding_id: &str, handler_name: &str) -> ProcessingConfig {
        self.handlers
            .get(binding_id)
            .or_else(|| self.handlers.get(handler_name))
            .cloned()
            .unwrap_or_default()
    }

    /// Global settings expressed as a fully-populated [`ProcessingConfig`]
    pub fn global_processing(&self) -> ProcessingConfig {
        ProcessingConfig {
            batch_size: Some(self.batch_size),
            batch_timeout: Some(self.batch_timeout),
            commit_strategy: Some(self.commit_strategy),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.brokers.trim().is_empty() {
            return Err("Brokers cannot be empty".to_string());
        }

        if self.group_id.trim().is_empty() {
            return Err("Group ID cannot be empty".to_string());
        }

        if self.batch_size == 0 {
            return Err("Batch size must be greater than 0".to_string());
        }

        if self.batch_timeout.is_zero() {
            return Err("Batch timeout must be greater than 0".to_string());
        }

        if self.shutdown_timeout.is_zero() {
            return Err("Shutdown timeout must be greater than 0".to_string());
        }

        if self.publish_timeout.is_zero() {
            return Err("Publish timeout must be greater than 0".to_string());
        }

        if self.publisher_buffer == 0 {
            return Err("Publisher buffer must be greater than 0".to_string());
        }

        for (name, topics) in &self.topic_groups {
            if name.trim().is_empty() {
                return Err("Topic group names cannot be blank".to_string());
            }
            if topics.iter().any(|t| t.trim().is_empty()) {
                return Err(format!("Topic group '{}' contains a blank topic", name));
            }
        }

        if self.topics.iter().any(|t| t.trim().is_empty()) {
            return Err("Fallback topics cannot contain a blank topic".to_string());
        }

        if matches!(&self.dead_letter_topic, Some(t) if t.trim().is_empty()) {
            return Err("Dead-letter topic cannot be blank".to_string());
        }

        for (handler, overrides) in &self.handlers {
            if overrides.batch_size == Some(0) {
                return Err(format!("Handler '{}': batch size must be greater than 0", handler));
            }
            if overrides.batch_timeout == Some(Duration::ZERO) {
                return Err(format!(
                    "Handler '{}': batch timeout must be greater than 0",
                    handler
                ));
            }
        }

        self.restart_policy
            .validate()
            .map_err(|e| format!("restart_policy: {}", e))?;
        self.handler_retry
            .validate()
            .map_err(|e| format!("handler_retry: {}", e))?;

        Ok(())
    }
}

/// Builder for [`DispatchConfig`]
#[derive(Debug, Default)]
pub struct DispatchConfigBuilder {
    config: DispatchConfig,
}

impl DispatchConfigBuilder {
    /// Create a builder starting from the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the broker connection string
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.config.brokers = brokers.into();
        self
    }

    /// Set the consumer group id
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.config.group_id = group_id.into();
        self
    }

    /// Define a named topic group
    pub fn topic_group<I, S>(mut self, name: impl Into<String>, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config
            .topic_groups
            .insert(name.into(), topics.into_iter().map(Into::into).collect());
        self
    }

    /// Set the fallback topic list
    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    /// Set the default batch size
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the default batch timeout
    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.config.batch_timeout = timeout;
        self
    }

    /// Set the default commit strategy
    pub fn commit_strategy(mut self, strategy: CommitStrategy) -> Self {
        self.config.commit_strategy = strategy;
        self
    }

    /// Set the worker restart policy
    pub fn restart_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.restart_policy = policy;
        self
    }

    /// Set the handler retry policy
    pub fn handler_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.handler_retry = policy;
        self
    }

    /// Set the default dead-letter topic
    pub fn dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.config.dead_letter_topic = Some(topic.into());
        self
    }

    /// Set the shutdown grace period
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Set the publish acknowledgement timeout
    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.config.publish_timeout = timeout;
        self
    }

    /// Set the publisher queue capacity
    pub fn publisher_buffer(mut self, capacity: usize) -> Self {
        self.config.publisher_buffer = capacity;
        self
    }

    /// Override processing settings for one handler
    pub fn handler(mut self, key: impl Into<String>, overrides: ProcessingConfig) -> Self {
        self.config.handlers.insert(key.into(), overrides);
        self
    }

    /// Add a broker client property
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.properties.insert(key.into(), value.into());
        self
    }

    /// Build the configuration
    pub fn build(self) -> DispatchConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = DispatchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.commit_strategy, CommitStrategy::AfterSuccessfulProcessing);
        assert_eq!(config.handler_retry.max_retries, 0);
    }

    #[test]
    fn test_yaml_with_sentinels() {
        let yaml = r#"
brokers: "kafka-1:9092,kafka-2:9092"
group_id: analytics-service
topic_groups:
  Analytics: ["topic.a", "topic.b"]
batch_size: 50
batch_timeout_ms: 250
commit_strategy: after_batch_received
restart_policy:
  max_retries: 5
  initial_backoff_ms: 100
handlers:
  on_page_view:
    batch_size: -1
    batch_timeout_ms: 2000
    commit_strategy: Manual
"#;
        let config = DispatchConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.group_id, "analytics-service");
        assert_eq!(
            config.topic_groups["Analytics"],
            vec!["topic.a".to_string(), "topic.b".to_string()]
        );
        assert_eq!(config.batch_timeout, Duration::from_millis(250));
        assert_eq!(config.commit_strategy, CommitStrategy::AfterBatchReceived);
        assert_eq!(config.restart_policy.max_retries, 5);

        let overrides = &config.handlers["on_page_view"];
        assert_eq!(overrides.batch_size, None);
        assert_eq!(overrides.batch_timeout, Some(Duration::from_secs(2)));
        assert_eq!(overrides.commit_strategy, Some(CommitStrategy::Manual));
    }

    #[test]
    fn test_validation_failures() {
        let cases = vec![
            DispatchConfig::builder().brokers("").build(),
            DispatchConfig::builder().group_id(" ").build(),
            DispatchConfig::builder().batch_size(0).build(),
            DispatchConfig::builder().batch_timeout(Duration::ZERO).build(),
            DispatchConfig::builder().topic_group("Empty", [""]).build(),
            DispatchConfig::builder()
                .handler(
                    "h",
                    ProcessingConfig {
                        batch_size: Some(0),
                        ..Default::default()
                    },
                )
                .build(),
        ];

        for config in cases {
            assert!(config.validate().is_err(), "accepted {:?}", config);
        }
    }

    #[test]
    fn test_validation_covers_restart_policy() {
        let mut policy = RetryPolicy::fixed(3, Duration::from_secs(1));
        policy.max_backoff = Duration::from_millis(10);
        let config = DispatchConfig::builder().restart_policy(policy).build();

        let err = config.validate().unwrap_err();
        assert!(err.starts_with("restart_policy:"), "{}", err);
    }

    #[test]
    fn test_processing_layers() {
        let global = DispatchConfig::default().global_processing();
        let code = ProcessingConfig {
            batch_size: Some(10),
            commit_strategy: Some(CommitStrategy::Manual),
            ..Default::default()
        };
        let file = ProcessingConfig {
            batch_size: Some(20),
            ..Default::default()
        };

        let effective = global.overridden_by(&code).overridden_by(&file);
        assert_eq!(effective.batch_size, Some(20));
        assert_eq!(effective.commit_strategy, Some(CommitStrategy::Manual));
        assert_eq!(effective.batch_timeout, Some(Duration::from_millis(1000)));
    }

    #[test]
    fn test_handler_override_lookup_prefers_binding_id() {
        let config = DispatchConfig::builder()
            .handler(
                "on_order",
                ProcessingConfig {
                    batch_size: Some(1),
                    ..Default::default()
                },
            )
            .handler(
                "Orders::on_order",
                ProcessingConfig {
                    batch_size: Some(2),
                    ..Default::default()
                },
            )
            .build();

        assert_eq!(
            config.handler_overrides("Orders::on_order", "on_order").batch_size,
            Some(2)
        );
        assert_eq!(
            config.handler_overrides("Other::on_order", "on_order").batch_size,
            Some(1)
        );
        assert!(config.handler_overrides("X::y", "y").is_empty());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = DispatchConfig::default();
        let env: HashMap<&str, &str> = [
            ("DISPATCH_BROKERS", "broker:9092"),
            ("DISPATCH_TOPICS", "a, b,,c"),
            ("DISPATCH_BATCH_SIZE", "7"),
            ("DISPATCH_COMMIT_STRATEGY", "after-batch-received"),
        ]
        .into_iter()
        .collect();

        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.brokers, "broker:9092");
        assert_eq!(config.topics, vec!["a", "b", "c"]);
        assert_eq!(config.batch_size, 7);
        assert_eq!(config.commit_strategy, CommitStrategy::AfterBatchReceived);

        let bad = config.apply_overrides(|key| {
            (key == "DISPATCH_BATCH_SIZE").then(|| "many".to_string())
        });
        assert!(matches!(bad, Err(DispatchError::Config(_))));
    }

    #[test]
    fn test_json_file_loading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.json");
        std::fs::write(
            &path,
            r#"{"group_id": "from-json", "topics": ["fallback"], "handler_retry": {"max_retries": 2}}"#,
        )
        .unwrap();

        let config = DispatchConfig::from_file(&path).unwrap();
        assert_eq!(config.group_id, "from-json");
        assert_eq!(config.topics, vec!["fallback"]);
        assert_eq!(config.handler_retry.max_retries, 2);
    }
}
