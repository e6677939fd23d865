use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::models::job::Stage;
use crate::services::queue::WorkQueue;

#[derive(Clone)]
pub struct MetricsState {
    pub handle: PrometheusHandle,
    pub queue: Arc<dyn WorkQueue>,
}

/// Prometheus scrape endpoint.
///
/// Queue depth gauges are refreshed from the queue on every scrape so they are
/// current even when no worker is running.
pub async fn prometheus_metrics(State(state): State<MetricsState>) -> impl IntoResponse {
    for stage in Stage::ALL {
        match state.queue.stats(&stage.queue_name()).await {
            Ok(stats) => {
                metrics::gauge!("pipeline_queue_depth", "stage" => stage.to_string())
                    .set(stats.visible as f64);
                metrics::gauge!("pipeline_queue_in_flight", "stage" => stage.to_string())
                    .set(stats.in_flight as f64);
            }
            Err(e) => tracing::debug!(stage = %stage, error = %e, "Queue stats unavailable"),
        }
    }
    state.handle.render()
}
