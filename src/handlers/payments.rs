use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::common::{header_str, idempotency_key};
use crate::{
    auth::{AuthRouterExt, AuthUser},
    errors::ServiceError,
    services::payments::{
        checkout::CreateCheckoutSessionRequest, webhooks::WebhookOutcome, CheckoutSession,
    },
    AppState,
};

/// Provider signature headers, in lookup order.
const SIGNATURE_HEADERS: [&str; 2] = ["x-signature", "stripe-signature"];

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
    /// True when the event had already been processed
    pub duplicate: bool,
}

/// Open a provider checkout session for an order
#[utoipa::path(
    post,
    path = "/api/payment/create-checkout-session",
    request_body = CreateCheckoutSessionRequest,
    params(
        ("X-Idempotency-Key" = Option<String>, Header, description = "Retries with the same key replay the first response")
    ),
    responses(
        (status = 200, description = "Checkout session", body = CheckoutSession,
            headers(("Idempotent-Replayed" = String, description = "Present on replayed responses"))
        ),
        (status = 400, description = "Order already paid or not payable", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Idempotency key in use", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment provider unavailable", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn create_checkout_session(
    State(state): State<AppState>,
    user: AuthUser,
    headers: HeaderMap,
    Json(request): Json<CreateCheckoutSessionRequest>,
) -> Result<Response, ServiceError> {
    let key = idempotency_key(&headers)?;
    let response = state
        .services
        .checkout
        .create_checkout_session(user.user_id, request.order_id, key)
        .await?;
    Ok(response.into_response())
}

/// Payment provider callback
#[utoipa::path(
    post,
    path = "/api/payment/webhook/{provider}",
    params(
        ("provider" = String, Path, description = "card_a or card_b"),
        ("X-Signature" = String, Header, description = "Provider signature of the raw body")
    ),
    request_body(content = String, description = "Raw provider payload", content_type = "application/json"),
    responses(
        (status = 200, description = "Event accepted", body = WebhookAck),
        (status = 400, description = "Invalid signature or payload", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ServiceError> {
    let signature = SIGNATURE_HEADERS
        .iter()
        .find_map(|name| header_str(&headers, name));

    let outcome = state
        .services
        .webhooks
        .handle(&provider, &body, signature)
        .await?;

    Ok(Json(WebhookAck {
        received: true,
        duplicate: outcome == WebhookOutcome::Duplicate,
    }))
}

pub fn payment_routes() -> Router<AppState> {
    let checkout = Router::new()
        .route("/create-checkout-session", post(create_checkout_session))
        .with_auth();

    // Signature-verified, no bearer token
    let webhooks = Router::new().route("/webhook/:provider", post(payment_webhook));

    checkout.merge(webhooks)
}
