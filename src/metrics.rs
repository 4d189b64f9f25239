//! Prometheus metrics.
//!
//! Collectors are registered once at first use and served over a small HTTP
//! endpoint next to the gRPC server. `/health` is a plain liveness probe.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};

lazy_static! {
    /// Total VMs created since the agent started.
    pub static ref VMS_CREATED: Counter = register_counter!(
        "firecracker_vms_created_total",
        "Total number of VMs created"
    )
    .expect("metric can be registered");

    /// VMs currently running.
    pub static ref VMS_RUNNING: Gauge = register_gauge!(
        "firecracker_vms_running",
        "Number of VMs currently running"
    )
    .expect("metric can be registered");

    /// Duration of VM operations by method.
    pub static ref VM_OPERATION_DURATION: HistogramVec = register_histogram_vec!(
        "firecracker_vm_operation_duration_seconds",
        "Duration of VM operations",
        &["operation"]
    )
    .expect("metric can be registered");

    /// gRPC request count by method and outcome.
    pub static ref GRPC_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "firecracker_grpc_requests_total",
        "Total number of gRPC requests",
        &["method", "status"]
    )
    .expect("metric can be registered");
}

/// Router exposing `/metrics` and `/health`.
pub fn router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(|| async { "OK" }))
}

/// Serve the metrics endpoint until the process exits.
pub async fn serve(port: u16) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port = port, "metrics server listening");
    axum::serve(listener, router()).await
}

async fn metrics_handler() -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&prometheus::gather(), &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            String::from_utf8_lossy(&buffer).to_string(),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
