//! Prometheus metrics for observability and monitoring.
//!
//! This module installs the Prometheus recorder and describes the metrics emitted
//! across the workspace:
//! - Store reducer execution and effect handling
//! - Optimistic transaction conflicts
//! - Allocation outcomes and best-effort side-channel failures
//!
//! # Example
//!
//! ```rust,no_run
//! use vending_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! println!("{}", server.render().unwrap_or_default());
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Installs the global recorder; the scrape address is reported in logs and
/// served by whichever HTTP layer embeds the rendered output.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server for `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Address metrics are advertised on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Describe all metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed. A recorder that
    /// is already installed (e.g. by another test) is not an error.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder was not installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!("store.commands.total", "Actions sent to a Store");
    describe_counter!("store.effects.executed", "Effects executed, labelled by type");
    describe_counter!("store.shutdown.initiated", "Graceful shutdowns started");
    describe_counter!("store.shutdown.timeout", "Drains that timed out with effects still running");
    describe_counter!(
        "store.shutdown.rejected_actions",
        "Actions rejected because the Store was shutting down"
    );
    describe_histogram!("store.reducer.duration_seconds", "Reducer execution time");

    describe_counter!("transaction.conflicts", "Compare-and-swap attempts that lost a race");
    describe_counter!(
        "transaction.committed_after_conflict",
        "Transactions that committed after at least one conflict"
    );

    describe_counter!("vending.allocation.reserved", "Orders that reserved rows");
    describe_counter!("vending.allocation.replayed", "Reservations answered from the order ledger");
    describe_counter!("vending.allocation.rejected", "Reservations that failed, labelled by reason");
    describe_counter!("vending.allocation.units", "Units reserved across all orders");
    describe_counter!(
        "vending.status.superseded",
        "Status updates skipped because their order had already moved on"
    );
    describe_counter!(
        "vending.side_channel.failures",
        "Best-effort status syncs and audit appends that were dropped"
    );
}
