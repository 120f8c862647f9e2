use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

fn current_correlation_id() -> Option<String> {
    crate::tracing::current_correlation_id().map(|id| id.as_str().to_string())
}

/// Body returned for every non-2xx response produced by the service layer.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
#[schema(example = json!({
    "error": "Bad Request",
    "message": "Insufficient stock for product: Desk Lamp",
    "correlationId": "4f0c8a52-5f0e-4ac1-9b1c-0b2fe2a4d7a1",
    "timestamp": "2025-03-09T10:30:00.000Z"
}))]
pub struct ErrorResponse {
    /// HTTP status category (e.g. "Not Found", "Bad Request")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// Correlation id of the failed request, for support lookups
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// RFC 3339 timestamp of the failure
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sea_orm::error::DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Cart is empty")]
    EmptyCart,

    #[error("Insufficient stock for product: {0}")]
    InsufficientStock(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Order already paid")]
    AlreadyPaid,

    #[error("Invalid webhook signature")]
    InvalidWebhookSignature,

    #[error("Invalid webhook payload: {0}")]
    InvalidWebhookPayload(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Payment provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

impl ServiceError {
    /// Single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_)
            | Self::BadRequest(_)
            | Self::EmptyCart
            | Self::InsufficientStock(_)
            | Self::InvalidStatus(_)
            | Self::InvalidTransition { .. }
            | Self::AlreadyPaid
            | Self::InvalidWebhookSignature
            | Self::InvalidWebhookPayload(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ProviderUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::DatabaseError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message suitable for HTTP responses. Internal failures and provider
    /// errors return generic text so no implementation detail leaks.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => "Internal server error".to_string(),
            Self::ProviderUnavailable(_) => "Payment provider unavailable".to_string(),
            Self::NotFound(msg)
            | Self::ValidationError(msg)
            | Self::BadRequest(msg)
            | Self::InvalidStatus(msg)
            | Self::Unauthorized(msg)
            | Self::Forbidden(msg)
            | Self::Conflict(msg) => msg.clone(),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let correlation_id = current_correlation_id();

        if status.is_server_error() {
            tracing::error!(
                correlation_id = correlation_id.as_deref().unwrap_or("-"),
                error = %self,
                "request failed"
            );
        }

        let body = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            correlation_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use sea_orm::DbErr;

    async fn render(err: ServiceError) -> (StatusCode, ErrorResponse) {
        let response = crate::tracing::scope_correlation_id(
            crate::tracing::CorrelationId::new("corr-123"),
            async { err.into_response() },
        )
        .await;
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn business_errors_keep_their_message() {
        let (status, payload) =
            render(ServiceError::InsufficientStock("Desk Lamp".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(payload.message, "Insufficient stock for product: Desk Lamp");
        assert_eq!(payload.correlation_id.as_deref(), Some("corr-123"));

        let (status, payload) = render(ServiceError::EmptyCart).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(payload.message, "Cart is empty");
    }

    #[tokio::test]
    async fn internal_errors_are_generic() {
        let (status, payload) = render(ServiceError::DatabaseError(DbErr::Custom(
            "relation \"orders\" does not exist".into(),
        )))
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(payload.message, "Internal server error");
        assert_eq!(payload.error, "Internal Server Error");

        let (status, payload) =
            render(ServiceError::ProviderUnavailable("connect timeout to 10.0.0.4".into())).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(payload.message, "Payment provider unavailable");
    }

    #[test]
    fn status_code_mapping() {
        assert_eq!(ServiceError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ServiceError::AlreadyPaid.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ServiceError::InvalidWebhookSignature.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::Unauthorized("x".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ServiceError::Forbidden("x".into()).status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ServiceError::Conflict("x".into()).status_code(), StatusCode::CONFLICT);
        assert_eq!(
            ServiceError::InvalidTransition {
                from: "Delivered".into(),
                to: "Pending".into()
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
    }
}
