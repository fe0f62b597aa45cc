use super::types::RateLimitResult;
use axum::{
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

pub const HEADER_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const HEADER_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const HEADER_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Standard rate limit headers for a result, allowed or rejected
pub fn rate_limit_headers(result: &RateLimitResult) -> HeaderMap {
    let mut headers = HeaderMap::new();

    headers.insert(HEADER_LIMIT, HeaderValue::from(result.limit));
    headers.insert(HEADER_REMAINING, HeaderValue::from(result.remaining));
    headers.insert(HEADER_RESET, HeaderValue::from(result.reset_at));

    if let Some(retry) = result.retry_after {
        headers.insert(http::header::RETRY_AFTER, HeaderValue::from(retry));
    }

    headers
}

/// Add rate limit headers to a response
pub fn add_rate_limit_headers(response: &mut Response, result: &RateLimitResult) {
    response.headers_mut().extend(rate_limit_headers(result));
}

/// Create a 429 Too Many Requests response with rate limit headers
pub fn rate_limit_response(result: &RateLimitResult) -> Response {
    let body = serde_json::json!({
        "error": "Rate limit exceeded",
        "reason": "rate_limited",
        "status": 429,
        "limit": result.limit,
        "remaining": result.remaining,
        "reset": result.reset_at,
        "retry_after": result.retry_after,
    });

    (StatusCode::TOO_MANY_REQUESTS, rate_limit_headers(result), Json(body)).into_response()
}
