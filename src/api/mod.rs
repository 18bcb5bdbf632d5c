//! HTTP binding of the session core.

use crate::api::handlers::root;
use crate::session::{AdmissionControl, BearerValidator, SessionLedger, TokenLifecycleManager};
use anyhow::Result;
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    routing::get,
    Extension, Router,
};
use std::{future::Future, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{info, info_span, Span};
use ulid::Ulid;
use utoipa_axum::router::OpenApiRouter;
use utoipa_swagger_ui::SwaggerUi;

pub mod admission;
mod error;
pub(crate) mod handlers;
pub mod metrics;
mod openapi;

pub use error::ErrorBody;
pub use metrics::HttpMetrics;
pub use openapi::openapi;

/// Everything the handlers need, injected as request extensions.
#[derive(Clone, Debug)]
pub struct Services {
    pub manager: Arc<TokenLifecycleManager>,
    pub bearer: Arc<dyn BearerValidator>,
    pub ledger: Arc<dyn SessionLedger>,
    pub admission: Arc<AdmissionControl>,
    pub metrics: Arc<HttpMetrics>,
}

/// Build the API router with all documented routes registered.
#[must_use]
pub fn router() -> OpenApiRouter {
    openapi::api_router()
}

/// The full application: documented routes, banner, Swagger UI and the
/// request id, tracing and metrics layers.
#[must_use]
pub fn app(services: &Services) -> Router {
    let (router, openapi) = router().split_for_parts();
    router
        .route("/", get(root::root))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(services.manager.clone()))
                .layer(Extension(services.bearer.clone()))
                .layer(Extension(services.ledger.clone()))
                .layer(Extension(services.admission.clone()))
                .layer(Extension(services.metrics.clone()))
                .layer(axum::middleware::from_fn(metrics::track)),
        )
}

/// Start the server and run until `shutdown` resolves.
///
/// # Errors
/// Return error if the listener cannot be bound or the server fails.
pub async fn serve<F>(port: u16, services: Services, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = app(&services);

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        info!("Gracefully shutdown");
    })
    .await?;

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
