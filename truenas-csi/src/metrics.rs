//! Prometheus metrics for the CSI driver
//!
//! Every Controller and Node handler reports its outcome and latency through
//! [`OperationTimer`]. Node attach retries and controller rollback steps have
//! their own counters.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tonic::Status;
use tracing::info;

use crate::error::code_label;

/// Metric names
pub mod names {
    /// Counter: CSI RPCs by operation and outcome (`success` or gRPC code)
    pub const CSI_OPERATIONS_TOTAL: &str = "csi_operations_total";
    /// Histogram: CSI RPC latency in seconds
    pub const CSI_OPERATION_DURATION_SECONDS: &str = "csi_operation_duration_seconds";
    /// Counter: iscsiadm calls repeated because the node database was locked
    pub const ISCSIADM_RETRIES_TOTAL: &str = "iscsiadm_retries_total";
    /// Counter: compensating deletes after a failed CreateVolume
    pub const CSI_ROLLBACK_STEPS_TOTAL: &str = "csi_rollback_steps_total";
}

/// Install the Prometheus recorder and serve `/metrics` on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!(%addr, "Metrics endpoint enabled at /metrics");
    Ok(())
}

pub fn record_iscsiadm_retry(mode: &str) {
    counter!(names::ISCSIADM_RETRIES_TOTAL, "mode" => mode.to_string()).increment(1);
}

pub fn record_rollback_step(step: &'static str, success: bool) {
    let outcome = if success { "deleted" } else { "failed" };
    counter!(names::CSI_ROLLBACK_STEPS_TOTAL, "step" => step, "outcome" => outcome).increment(1);
}

/// Outcome label for a handler result.
fn outcome<T>(result: &Result<T, Status>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(status) => code_label(status),
    }
}

/// Measures one RPC from construction until [`OperationTimer::finish`].
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    pub fn finish<T>(self, result: &Result<T, Status>) {
        let elapsed = self.start.elapsed().as_secs_f64();
        counter!(
            names::CSI_OPERATIONS_TOTAL,
            "operation" => self.operation,
            "status" => outcome(result)
        )
        .increment(1);
        histogram!(names::CSI_OPERATION_DURATION_SECONDS, "operation" => self.operation)
            .record(elapsed);
    }
}
