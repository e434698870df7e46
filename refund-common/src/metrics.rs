use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub const MESSAGES_RECEIVED: &str = "refund_messages_received_total";
pub const MESSAGES_SKIPPED: &str = "refund_messages_skipped_total";
pub const PAYMENTS_POSTED: &str = "refund_payments_posted_total";
pub const PAYMENTS_FAILED: &str = "refund_payments_failed_total";
pub const PAYMENT_REQUEST_DURATION: &str = "refund_payment_request_duration_seconds";
pub const MESSAGES_REPUBLISHED: &str = "refund_messages_republished_total";
pub const MESSAGES_SUPPRESSED: &str = "refund_messages_suppressed_total";
pub const HANDOFF_FAILURES: &str = "refund_handoff_failures_total";
pub const OFFSET_COMMIT_FAILURES: &str = "refund_offset_commit_failures_total";
pub const TRANSPORT_ERRORS: &str = "refund_transport_errors_total";

/// Bind a `TcpListener` on the provided bind address and serve `router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Add a `/metrics` route rendering everything recorded through `recorder_handle`.
pub fn add_metrics_route(router: Router, recorder_handle: PrometheusHandle) -> Router {
    router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

/// Install the global Prometheus recorder. Only one recorder can be installed per process.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
