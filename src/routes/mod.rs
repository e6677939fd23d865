pub mod health;
pub mod metrics;
pub mod status;
pub mod submit;

use axum::extract::multipart::MultipartError;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use crate::services::producer::SubmitError;
use crate::services::status::StatusError;

/// Build the API router.
pub fn router(state: AppState, prometheus: PrometheusHandle, body_limit: usize) -> Router {
    let metrics_state = metrics::MetricsState {
        handle: prometheus,
        queue: state.queue.clone(),
    };

    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/separate", post(submit::submit_separation))
        .route("/api/v1/training", post(submit::submit_training))
        .route("/api/v1/inference", post(submit::submit_inference))
        .route("/api/v1/status/{user_id}/{artist}", get(status::get_status))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(metrics_state),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        // Uploads are audio files; the multipart extractor's 2 MB default is replaced.
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Error returned by handlers, rendered as `{"error": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::InvalidFilename(_) | SubmitError::EmptyDataset => {
                Self::bad_request(e.to_string())
            }
            e if e.is_transient() => {
                tracing::warn!(error = %e, "Submission failed");
                Self::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
            e => {
                tracing::error!(error = %e, "Submission failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }
}

impl From<StatusError> for ApiError {
    fn from(e: StatusError) -> Self {
        tracing::error!(error = %e, "Status lookup failed");
        Self::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    }
}

impl From<garde::Report> for ApiError {
    fn from(report: garde::Report) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, report.to_string())
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        Self::new(e.status(), e.body_text())
    }
}
