use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Result;
use axum::http::StatusCode;
use metrics::{Label, counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

const HTTP_REQUESTS_TOTAL: &str = "syllabus_api_http_requests_total";
const HTTP_REQUEST_DURATION_SECONDS: &str = "syllabus_api_http_request_duration_seconds";
const HTTP_SERVER_ERRORS_TOTAL: &str = "syllabus_api_http_server_errors_total";
const CASCADES_STARTED_TOTAL: &str = "syllabus_api_cascades_started_total";

static PROMETHEUS: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_metrics() -> Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROMETHEUS.set(handle);
    Ok(())
}

/// `None` until `init_metrics` has run, which is the case in tests.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS.get().map(PrometheusHandle::render)
}

fn status_class(status: StatusCode) -> &'static str {
    match status.as_u16() {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

pub fn register_http_request(method: &str, route: &str, status: StatusCode, elapsed: Duration) {
    let labels = vec![
        Label::new("method", method.to_owned()),
        Label::new("route", route.to_owned()),
        Label::new("status", status_class(status)),
    ];
    counter!(HTTP_REQUESTS_TOTAL, labels.clone()).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, labels.clone()).record(elapsed.as_secs_f64());
    if status.is_server_error() {
        counter!(HTTP_SERVER_ERRORS_TOTAL, labels).increment(1);
    }
}

/// `approach` is `batch` or `level`.
pub fn register_cascade_started(approach: &'static str) {
    counter!(CASCADES_STARTED_TOTAL, "approach" => approach).increment(1);
}
