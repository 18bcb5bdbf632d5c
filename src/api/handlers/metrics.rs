use crate::api::metrics::HttpMetrics;
use axum::{
    extract::Extension,
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::error;

#[utoipa::path(
    get,
    path= "/metrics",
    responses (
        (status = 200, description = "Prometheus metrics", body = String, content_type = "text/plain"),
        (status = 500, description = "Metrics could not be encoded"),
    ),
    tag= "health"
)]
pub async fn metrics(Extension(metrics): Extension<Arc<HttpMetrics>>) -> Response {
    match metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(err) => {
            error!("Failed to encode metrics: {err:#}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
