use std::time::Duration;

use axum::Json;
use axum::body::Body;
use axum::http::{HeaderValue, Response, StatusCode};
use axum::response::IntoResponse;
use tower_governor::{
    GovernorError, GovernorLayer, governor::GovernorConfigBuilder,
    key_extractor::SmartIpKeyExtractor,
};

pub type RateLimitLayer =
    GovernorLayer<SmartIpKeyExtractor, governor::middleware::NoOpMiddleware, Body>;

#[derive(Debug, thiserror::Error)]
#[error("invalid rate limit config for {0}")]
pub struct RateLimitConfigError(&'static str);

fn layer(
    name: &'static str,
    replenish_every: Duration,
    burst: u32,
) -> Result<RateLimitLayer, RateLimitConfigError> {
    let config = GovernorConfigBuilder::default()
        .period(replenish_every)
        .burst_size(burst)
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .ok_or(RateLimitConfigError(name))?;
    Ok(GovernorLayer::new(config).error_handler(json_error_handler))
}

/// Chat writes (create, turns, tool responses, integrity): 60 requests/minute per IP.
pub fn chat_write_layer() -> Result<RateLimitLayer, RateLimitConfigError> {
    layer("chat_write", Duration::from_secs(1), 20)
}

/// Moderation event ingestion: 120 requests/minute per IP.
pub fn moderation_layer() -> Result<RateLimitLayer, RateLimitConfigError> {
    layer("moderation", Duration::from_millis(500), 30)
}

/// Operator endpoints: 30 requests/minute per IP.
pub fn operator_layer() -> Result<RateLimitLayer, RateLimitConfigError> {
    layer("operator", Duration::from_secs(2), 10)
}

/// Returns JSON in ApiError format with a Retry-After header.
fn json_error_handler(err: GovernorError) -> Response<Body> {
    let (status, retry_after, message) = match err {
        GovernorError::TooManyRequests { wait_time, .. } => (
            StatusCode::TOO_MANY_REQUESTS,
            Some(wait_time),
            format!("Too many requests. Retry after {wait_time} seconds."),
        ),
        GovernorError::UnableToExtractKey => (
            StatusCode::INTERNAL_SERVER_ERROR,
            None,
            "Unable to determine client identity for rate limiting".to_string(),
        ),
        GovernorError::Other { code, msg, .. } => (code, None, msg.unwrap_or_default()),
    };

    let body = serde_json::json!({
        "error": chatguard_core::error::codes::RATE_LIMITED,
        "message": message,
        "request_id": uuid::Uuid::now_v7().to_string(),
    });

    let mut response = (status, Json(body)).into_response();
    if let Some(secs) = retry_after
        && let Ok(value) = HeaderValue::from_str(&secs.to_string())
    {
        response.headers_mut().insert("retry-after", value);
    }
    response
}
