//! Correlation id propagation.
//!
//! Every request gets a correlation id, either the one the client sent in
//! `x-correlation-id` or a freshly generated one. It is stored in the request
//! extensions, made available to error rendering through a task-local, and
//! echoed back on the response.

use crate::tracing::{scope_correlation_id, CorrelationId, CORRELATION_ID_HEADER};
use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::{info_span, Instrument};

fn extract_correlation_id(request: &Request) -> CorrelationId {
    request
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(CorrelationId::from_header)
        .unwrap_or_default()
}

pub async fn correlation_id_middleware(mut request: Request, next: Next) -> Response {
    let correlation_id = extract_correlation_id(&request);
    request.extensions_mut().insert(correlation_id.clone());

    let span = info_span!(
        "request",
        correlation_id = %correlation_id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    let mut response = scope_correlation_id(
        correlation_id.clone(),
        async move { next.run(request).await }.instrument(span),
    )
    .await;

    if let Ok(value) = HeaderValue::from_str(correlation_id.as_str()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(CORRELATION_ID_HEADER), value);
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ErrorResponse, ServiceError};
    use axum::{
        body::{to_bytes, Body},
        extract::Extension,
        http::{Request as HttpRequest, StatusCode},
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    async fn echo(Extension(id): Extension<CorrelationId>) -> String {
        id.as_str().to_string()
    }

    async fn failing() -> Result<(), ServiceError> {
        Err(ServiceError::InternalError("boom".into()))
    }

    fn app() -> Router {
        Router::new()
            .route("/echo", get(echo))
            .route("/fail", get(failing))
            .layer(axum::middleware::from_fn(correlation_id_middleware))
    }

    #[tokio::test]
    async fn generates_id_when_absent() {
        let response = app()
            .oneshot(HttpRequest::get("/echo").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let header = response
            .headers()
            .get(CORRELATION_ID_HEADER)
            .cloned()
            .expect("header present");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(header.to_str().unwrap().as_bytes(), &body[..]);
    }

    #[tokio::test]
    async fn reuses_client_id_and_puts_it_in_error_bodies() {
        let response = app()
            .oneshot(
                HttpRequest::get("/fail")
                    .header(CORRELATION_ID_HEADER, "client-abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get(CORRELATION_ID_HEADER).unwrap(),
            "client-abc"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.correlation_id.as_deref(), Some("client-abc"));
        assert_eq!(payload.message, "Internal server error");
    }
}
