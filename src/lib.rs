//! Transport-agnostic consumer dispatch and supervision for broker-backed services
//!
//! Applications register consumers and handler functions bound to topics,
//! either directly, through named topic groups from configuration, or through
//! the global fallback topic list. At startup every registration is validated,
//! one supervised worker is spawned per handler, and workers batch, decode,
//! dispatch and commit messages according to each handler's commit strategy.
//! A single publisher actor per transport sends outbound messages.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use topic_dispatch::{
//!     Consumer, ConsumerRegistry, DispatchConfig, DispatchHost, Envelope, HandlerBinding,
//!     MemoryBroker,
//! };
//!
//! #[derive(serde::Deserialize)]
//! struct Alert {
//!     level: String,
//! }
//!
//! struct Alerts;
//!
//! #[async_trait::async_trait]
//! impl Consumer for Alerts {}
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut registry = ConsumerRegistry::new();
//! registry.consumer(Arc::new(Alerts)).on(
//!     HandlerBinding::new("on_alert").topics(["alerts.critical", "alerts.emergency"]),
//!     |_me: Arc<Alerts>, alert: Envelope<Alert>, _ctx| async move {
//!         tracing::warn!(level = %alert.message.level, topic = %alert.topic, "alert");
//!         anyhow::Ok(())
//!     },
//! );
//!
//! let config = DispatchConfig::from_file("dispatch.yaml")?;
//! let host = DispatchHost::startup(config, Arc::new(MemoryBroker::new()), &registry).await?;
//! host.publisher().publish("alerts.critical", &serde_json::json!({"level": "high"}), None).await?;
//! host.run_until_signal().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Kafka
//!
//! With the `kafka` feature, `transport::kafka::KafkaTransport` connects the
//! same registrations to a Kafka or Redpanda cluster:
//!
//! ```ignore
//! let transport = Arc::new(KafkaTransport::new(&config)?);
//! let host = DispatchHost::startup(config, transport, &registry).await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_inception)]

// Re-export commonly used items
pub use config::{CommitStrategy, DispatchConfig, ProcessingConfig};
pub use consumer::{
    BindingStatus, ConsumerMetrics, HandlerContext, RetryPolicy, ShutdownReport, Supervisor,
    SupervisorState,
};
pub use error::{DispatchError, Result};
pub use host::DispatchHost;
pub use message::{DeliveryTag, Envelope, RawMessage};
pub use publisher::{PublishError, Publisher};
pub use registry::{Consumer, ConsumerMetadata, ConsumerRegistry, HandlerBinding};
pub use resolver::{resolve, TopicSpec};
pub use transport::MemoryBroker;

/// Messages as received from and decoded for handlers
pub mod message;

/// Error types
pub mod error;

/// Configuration loading and validation
pub mod config;

/// Topic resolution
pub mod resolver;

/// Consumer registration and startup scanning
pub mod registry;

/// Broker abstraction and implementations
pub mod transport;

/// Batching, commit handling and supervision
pub mod consumer;

/// Outbound publishing
pub mod publisher;

/// Runtime wiring
pub mod host;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the tracing subscriber with default settings
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
