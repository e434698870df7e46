use axum::{routing, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use refund_common::health::HealthRegistry;
use refund_common::metrics;
use tower_http::trace::TraceLayer;

pub const HEALTHCHECK_PATH: &str = "/refund-request-consumer/healthcheck";

pub fn app(liveness: HealthRegistry, metrics: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/", routing::get(index))
        .route(
            HEALTHCHECK_PATH,
            routing::get(move || std::future::ready(liveness.get_status())),
        )
        .layer(TraceLayer::new_for_http());

    match metrics {
        Some(recorder_handle) => metrics::add_metrics_route(router, recorder_handle),
        None => router.layer(axum::middleware::from_fn(metrics::track_metrics)),
    }
}

pub async fn index() -> &'static str {
    "refund request consumer"
}
