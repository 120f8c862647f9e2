use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::{errors::ServiceError, services::idempotency};

/// Standard created response
pub fn created_response<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(data)).into_response()
}

/// Standard no content response
pub fn no_content_response() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

/// Raw header value as text; non-UTF-8 values are treated as absent.
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Normalized `X-Idempotency-Key`, `None` when missing or blank.
pub fn idempotency_key(headers: &HeaderMap) -> Result<Option<String>, ServiceError> {
    idempotency::normalize_key(header_str(headers, idempotency::IDEMPOTENCY_KEY_HEADER))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn idempotency_key_is_trimmed() {
        let mut headers = HeaderMap::new();
        assert_eq!(idempotency_key(&headers).unwrap(), None);

        headers.insert("X-Idempotency-Key", HeaderValue::from_static("  abc-1 "));
        assert_eq!(idempotency_key(&headers).unwrap().as_deref(), Some("abc-1"));
    }
}
