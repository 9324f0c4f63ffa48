//! Runtime boundary: wires scanning, supervision and publishing together

use crate::config::DispatchConfig;
use crate::consumer::supervisor::{ShutdownReport, Supervisor};
use crate::error::Result;
use crate::publisher::{Publisher, PublisherConfig};
use crate::registry::ConsumerRegistry;
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A running dispatch layer over one transport
pub struct DispatchHost {
    supervisor: Supervisor,
    publisher: Publisher,
    shutdown_timeout: Duration,
}

impl DispatchHost {
    /// Scan and validate every registration, then start the publisher and
    /// all workers.
    ///
    /// Configuration problems are reported before anything connects. Workers
    /// dead-letter through the same publisher, which is closed only after
    /// they have stopped.
    pub async fn startup(
        config: DispatchConfig,
        transport: Arc<dyn Transport>,
        registry: &ConsumerRegistry,
    ) -> Result<Self> {
        let bindings = registry.scan(&config)?;
        info!(
            transport = transport.name(),
            bindings = bindings.len(),
            "Starting dispatch host"
        );

        let producer = transport.producer().await?;
        let publisher = Publisher::spawn(producer, PublisherConfig::from(&config));

        let mut supervisor =
            Supervisor::new(transport.clone(), &config).with_publisher(publisher.clone());
        if let Err(e) = supervisor.start(bindings).await {
            publisher.close().await;
            return Err(e);
        }

        Ok(Self {
            supervisor,
            publisher,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// Handle for publishing outbound messages
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// The supervisor running the workers
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Stop every worker, then the publisher they dead-letter through
    pub async fn shutdown(mut self) -> ShutdownReport {
        let report = self.supervisor.stop(self.shutdown_timeout).await;
        self.publisher.close().await;
        if !report.is_graceful() {
            warn!(
                forced = report.forced,
                inflight_lost = report.inflight_lost,
                "Dispatch host stopped with forced terminations"
            );
        }
        report
    }

    /// Run until Ctrl-C, then shut down
    pub async fn run_until_signal(self) -> Result<ShutdownReport> {
        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received");
        Ok(self.shutdown().await)
    }
}
