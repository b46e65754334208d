use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// GET /metrics: job and inference metrics in Prometheus text format.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for the metrics the engine records.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "caption_jobs_total",
        "Caption jobs created and finished, by status"
    );
    metrics::describe_counter!(
        "caption_files_total",
        "Files resolved by caption jobs, by outcome"
    );
    metrics::describe_histogram!(
        "caption_inference_seconds",
        metrics::Unit::Seconds,
        "Duration of a single vision backend call"
    );
}
