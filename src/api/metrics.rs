//! Prometheus request metrics.
//!
//! Requests are labelled by their matched route, never the raw path, so the
//! label set stays bounded whatever clients send.

use axum::{
    body::Body,
    extract::{Extension, MatchedPath},
    http::Request,
    middleware::Next,
    response::Response,
};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::{sync::Arc, time::Instant};

/// Route label for requests that matched no route.
const UNMATCHED: &str = "unmatched";

#[derive(Clone, Debug)]
pub struct HttpMetrics {
    requests_total: IntCounterVec,
    request_duration: HistogramVec,
    registry: Registry,
}

impl HttpMetrics {
    /// Create the collectors in a registry of their own.
    ///
    /// # Errors
    /// Return error if a collector cannot be created or registered.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Total HTTP requests"),
            &["method", "path", "status"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new("http_request_duration_seconds", "Request latency"),
            &["method", "path"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            requests_total,
            request_duration,
            registry,
        })
    }

    pub fn record(&self, method: &str, path: &str, status: u16, seconds: f64) {
        self.requests_total
            .with_label_values(&[method, path, &status.to_string()])
            .inc();
        self.request_duration
            .with_label_values(&[method, path])
            .observe(seconds);
    }

    /// Render every collector in the text exposition format.
    ///
    /// # Errors
    /// Return error if encoding fails.
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Record method, matched route, status and latency of every request.
pub async fn track(
    Extension(metrics): Extension<Arc<HttpMetrics>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or(UNMATCHED, MatchedPath::as_str)
        .to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    metrics.record(
        &method,
        &path,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn render_exposes_both_collectors() {
        let metrics = HttpMetrics::new().unwrap();
        metrics.record("POST", "/signin", 200, 0.02);
        metrics.record("POST", "/signin", 429, 0.001);

        let rendered = metrics.render().unwrap();
        assert!(rendered
            .contains(r#"http_requests_total{method="POST",path="/signin",status="200"} 1"#));
        assert!(rendered
            .contains(r#"http_requests_total{method="POST",path="/signin",status="429"} 1"#));
        assert!(rendered
            .contains(r#"http_request_duration_seconds_count{method="POST",path="/signin"} 2"#));
    }

    #[test]
    fn registries_are_independent() {
        let first = HttpMetrics::new().unwrap();
        let second = HttpMetrics::new().unwrap();
        first.record("GET", "/ping", 200, 0.0);
        assert!(!second.render().unwrap().contains("/ping"));
    }
}
