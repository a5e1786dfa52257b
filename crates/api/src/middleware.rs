use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use syllabus_domain::util::uuid_v7_without_dashes;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{Span, field};
use uuid::Uuid;

use crate::error::ApiError;
use crate::observability;

pub const CORRELATION_ID_HEADER: HeaderName = HeaderName::from_static("x-correlation-id");
const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");
const MAX_CORRELATION_ID_LEN: usize = 128;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Correlation id of the current request, available to handlers as an
/// extension.
#[derive(Clone, Debug)]
pub struct CorrelationId(pub String);

#[derive(Clone, Copy)]
pub struct NewRequestId;

impl MakeRequestId for NewRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::now_v7().to_string())
            .ok()
            .map(RequestId::new)
    }
}

fn header_str<'a, B>(req: &'a Request<B>, name: &HeaderName) -> &'a str {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-")
}

/// One span per request. `batch_id` starts empty and is filled in by the
/// cascade handlers once a batch is known.
#[derive(Clone, Copy, Default)]
pub struct ApiSpan;

impl<B> MakeSpan<B> for ApiSpan {
    fn make_span(&mut self, req: &Request<B>) -> Span {
        let route = req
            .extensions()
            .get::<MatchedPath>()
            .map(MatchedPath::as_str)
            .unwrap_or_else(|| req.uri().path());
        tracing::info_span!(
            "api_request",
            method = %req.method(),
            route = %route,
            request_id = %header_str(req, &REQUEST_ID_HEADER),
            correlation_id = %header_str(req, &CORRELATION_ID_HEADER),
            batch_id = field::Empty,
        )
    }
}

pub fn record_batch_id(batch_id: &str) {
    Span::current().record("batch_id", batch_id);
}

pub fn trace_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>, ApiSpan> {
    TraceLayer::new_for_http().make_span_with(ApiSpan)
}

pub fn set_request_id_layer() -> SetRequestIdLayer<NewRequestId> {
    SetRequestIdLayer::new(REQUEST_ID_HEADER, NewRequestId)
}

pub fn propagate_request_id_layer() -> PropagateRequestIdLayer {
    PropagateRequestIdLayer::new(REQUEST_ID_HEADER)
}

pub fn timeout_layer() -> TimeoutLayer {
    TimeoutLayer::new(REQUEST_TIMEOUT)
}

fn accepted_correlation_id(value: &HeaderValue) -> Option<String> {
    let value = value.to_str().ok()?.trim();
    let printable = value.chars().all(|c| c.is_ascii_graphic());
    (!value.is_empty() && value.len() <= MAX_CORRELATION_ID_LEN && printable)
        .then(|| value.to_string())
}

/// Accepts a caller supplied `x-correlation-id` or mints one, then echoes
/// it on the response.
pub async fn correlation_id_middleware(mut req: Request<Body>, next: Next) -> Response {
    let correlation_id = match req.headers().get(&CORRELATION_ID_HEADER) {
        Some(value) => match accepted_correlation_id(value) {
            Some(id) => id,
            None => {
                return ApiError::Validation("invalid correlation id".into()).into_response();
            }
        },
        None => uuid_v7_without_dashes(),
    };
    let Ok(header) = HeaderValue::from_str(&correlation_id) else {
        return ApiError::Validation("invalid correlation id".into()).into_response();
    };

    req.headers_mut()
        .insert(CORRELATION_ID_HEADER, header.clone());
    req.extensions_mut().insert(CorrelationId(correlation_id));

    let mut response = next.run(req).await;
    response.headers_mut().insert(CORRELATION_ID_HEADER, header);
    response
}

pub async fn track_http_metrics(req: Request<Body>, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let response = next.run(req).await;
    observability::register_http_request(
        method.as_str(),
        &route,
        response.status(),
        started.elapsed(),
    );
    response
}
