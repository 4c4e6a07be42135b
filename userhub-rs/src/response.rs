//! Renders the outcome of an operation as HTTP response.
//!
//! Every response body is a JSON envelope:
//! ```json
//! {
//!     "success": true,
//!     "data": { "id": 1, "name": "John Doe", "email": "john@example.com" },
//!     "timestamp_ms": 1709294400000,
//!     "response_time_ms": 0.42
//! }
//! ```
//! Failed requests carry an **error** message (and its **code**) instead of **data**. Requests
//! rejected by the rate limiter additionally report **tier** and **retry_after_s**.
//!
//! If a request was admitted by the rate limiter, the current limits are reported via
//! `X-RateLimit-*` headers. A rejection carries a `Retry-After` header instead.
use std::time::Instant;

use hyper::header::{HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use hyper::{Body, Response, StatusCode};
use serde_json::{json, Map, Value};

use crate::error::ServiceError;
use crate::limiter::RateLimitHeaders;
use crate::service::Guarded;

/// Determines the HTTP status to report for the given error.
pub fn status_of(error: &ServiceError) -> StatusCode {
    match error {
        ServiceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ServiceError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Renders a successful response.
pub fn success(status: StatusCode, data: Value, watch: Option<Instant>) -> Response<Body> {
    let mut envelope = envelope(true, watch);
    let _ = envelope.insert("data".to_owned(), data);

    build(status, Value::Object(envelope))
}

/// Renders an error response.
pub fn failure(error: &ServiceError, watch: Option<Instant>) -> Response<Body> {
    let mut envelope = envelope(false, watch);
    let _ = envelope.insert("error".to_owned(), Value::from(error.to_string()));
    let _ = envelope.insert("code".to_owned(), Value::from(error.kind()));

    if let ServiceError::RateLimited(rejection) = error {
        let _ = envelope.insert("tier".to_owned(), Value::from(rejection.tier.to_string()));
        let _ = envelope.insert(
            "retry_after_s".to_owned(),
            Value::from(rejection.retry_after_s),
        );
    }

    let mut response = build(status_of(error), Value::Object(envelope));
    if let ServiceError::RateLimited(rejection) = error {
        let _ = response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(rejection.retry_after_s));
    }

    response
}

/// Renders the outcome of a rate limited operation.
///
/// If the request was admitted, the limits are attached as headers.
pub fn guarded<T>(
    guarded: Guarded<T>,
    status: StatusCode,
    render: impl FnOnce(T) -> Value,
    watch: Instant,
) -> Response<Body> {
    let mut response = match guarded.result {
        Ok(value) => success(status, render(value), Some(watch)),
        Err(error) => failure(&error, Some(watch)),
    };

    if let Some(limits) = guarded.limits {
        apply_limits(&mut response, &limits);
    }

    response
}

/// Renders the response for an unknown route.
pub fn unknown_route(path: &str) -> Response<Body> {
    let mut envelope = envelope(false, None);
    let _ = envelope.insert(
        "error".to_owned(),
        Value::from(format!("Unknown route: {}", path)),
    );
    let _ = envelope.insert("code".to_owned(), Value::from("not_found"));

    build(StatusCode::NOT_FOUND, Value::Object(envelope))
}

fn envelope(success: bool, watch: Option<Instant>) -> Map<String, Value> {
    let mut envelope = Map::new();
    let _ = envelope.insert("success".to_owned(), Value::from(success));
    let _ = envelope.insert(
        "timestamp_ms".to_owned(),
        Value::from(chrono::Utc::now().timestamp_millis()),
    );
    if let Some(watch) = watch {
        let _ = envelope.insert(
            "response_time_ms".to_owned(),
            json!(watch.elapsed().as_micros() as f64 / 1000.),
        );
    }

    envelope
}

fn build(status: StatusCode, body: Value) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    let _ = response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    response
}

fn apply_limits(response: &mut Response<Body>, limits: &RateLimitHeaders) {
    let headers = response.headers_mut();
    let _ = headers.insert("x-ratelimit-limit", HeaderValue::from(limits.minute.limit));
    let _ = headers.insert(
        "x-ratelimit-remaining",
        HeaderValue::from(limits.minute.remaining),
    );
    let _ = headers.insert(
        "x-ratelimit-burst-limit",
        HeaderValue::from(limits.burst.limit),
    );
    let _ = headers.insert(
        "x-ratelimit-burst-remaining",
        HeaderValue::from(limits.burst.remaining),
    );

    if let Ok(reset) = HeaderValue::from_str(&limits.minute.reset) {
        let _ = headers.insert("x-ratelimit-reset", reset);
    }
    if let Ok(reset) = HeaderValue::from_str(&limits.burst.reset) {
        let _ = headers.insert("x-ratelimit-burst-reset", reset);
    }
}
