//! HTTP route handlers.

pub mod admin;
pub mod agreements;
pub mod conversations;
pub mod health;
pub mod metrics;

use axum::http::HeaderMap;

use crate::error::ApiError;

pub const IDEMPOTENCY_KEY: &str = "idempotency-key";
pub const USER_ID: &str = "x-user-id";

/// Returns a header's value, ignoring empty and non-UTF-8 values.
pub(crate) fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Returns the acting user from `X-User-Id`.
pub(crate) fn actor(headers: &HeaderMap) -> Result<String, ApiError> {
    header(headers, USER_ID).ok_or_else(|| ApiError::BadRequest("Missing X-User-Id header".into()))
}

/// Parses a UUID-backed id from a path segment.
pub(crate) fn parse_id<T>(value: &str, parse: fn(&str) -> Option<T>, what: &str) -> Result<T, ApiError> {
    parse(value).ok_or_else(|| ApiError::BadRequest(format!("Invalid {what}: {value}")))
}
