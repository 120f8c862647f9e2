use chrono::Utc;
use hmac::{Hmac, Mac};
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::{info, instrument, warn};

use super::{CanonicalEvent, CheckoutSession, EventKind};
use crate::{entities::order::Model as OrderModel, errors::ServiceError};

type HmacSha256 = Hmac<Sha256>;

/// Hosted-checkout card processor. Sessions are created with a
/// form-encoded POST; webhooks are signed `t=<unix>,v1=<hex>` over
/// `"{t}.{payload}"`.
#[derive(Clone)]
pub struct CardProviderA {
    client: reqwest::Client,
    api_base: String,
    secret_key: String,
    webhook_secret: Option<String>,
    tolerance_secs: u64,
    currency: String,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    id: String,
    url: Option<String>,
}

impl CardProviderA {
    pub fn new(
        client: reqwest::Client,
        api_base: impl Into<String>,
        secret_key: impl Into<String>,
        webhook_secret: Option<String>,
        tolerance_secs: u64,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
            webhook_secret,
            tolerance_secs,
            currency: currency.into().to_lowercase(),
        }
    }

    #[instrument(skip(self, order), fields(order_id = %order.id))]
    pub async fn create_checkout_session(
        &self,
        order: &OrderModel,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<CheckoutSession, ServiceError> {
        let amount = (order.total_amount * rust_decimal::Decimal::from(100))
            .round()
            .to_i64()
            .ok_or_else(|| ServiceError::InternalError("order total out of range".to_string()))?;
        let order_id = order.id.to_string();

        let params = [
            ("mode", "payment".to_string()),
            ("success_url", format!("{}?orderId={}", success_url, order_id)),
            ("cancel_url", format!("{}?orderId={}", cancel_url, order_id)),
            ("client_reference_id", order_id.clone()),
            ("metadata[order_id]", order_id.clone()),
            ("payment_intent_data[metadata][order_id]", order_id.clone()),
            ("line_items[0][quantity]", "1".to_string()),
            ("line_items[0][price_data][currency]", self.currency.clone()),
            ("line_items[0][price_data][unit_amount]", amount.to_string()),
            (
                "line_items[0][price_data][product_data][name]",
                format!("Order {}", order_id),
            ),
        ];

        let response = self
            .client
            .post(format!("{}/v1/checkout/sessions", self.api_base))
            .bearer_auth(&self.secret_key)
            .header("Idempotency-Key", order_id.as_str())
            .form(&params)
            .send()
            .await
            .map_err(|e| ServiceError::ProviderUnavailable(format!("card_a request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            warn!(%status, "card_a rejected checkout session");
            return Err(ServiceError::ProviderUnavailable(format!(
                "card_a answered {}",
                status
            )));
        }

        let session: SessionResponse = response.json().await.map_err(|e| {
            ServiceError::ProviderUnavailable(format!("card_a response unreadable: {}", e))
        })?;
        let url = session.url.ok_or_else(|| {
            ServiceError::ProviderUnavailable("card_a session has no url".to_string())
        })?;

        info!(session_id = %session.id, "card_a checkout session created");
        Ok(CheckoutSession {
            session_id: session.id,
            url,
        })
    }

    pub fn verify_webhook_signature(&self, payload: &[u8], header: &str) -> bool {
        let Some(secret) = self.webhook_secret.as_deref() else {
            warn!("card_a webhook secret not configured");
            return false;
        };

        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }
        let Some(timestamp) = timestamp else {
            return false;
        };

        if Utc::now().timestamp().abs_diff(timestamp) > self.tolerance_secs {
            warn!(timestamp, "card_a webhook timestamp outside tolerance");
            return false;
        }

        signatures.into_iter().any(|candidate| {
            let Ok(expected) = hex::decode(candidate) else {
                return false;
            };
            let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
                return false;
            };
            mac.update(timestamp.to_string().as_bytes());
            mac.update(b".");
            mac.update(payload);
            mac.verify_slice(&expected).is_ok()
        })
    }

    pub fn parse_webhook(&self, payload: &[u8]) -> Result<CanonicalEvent, ServiceError> {
        let raw: Value = serde_json::from_slice(payload)
            .map_err(|e| ServiceError::InvalidWebhookPayload(e.to_string()))?;

        let event_id = raw
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ServiceError::InvalidWebhookPayload("missing event id".to_string()))?
            .to_string();
        let event_type = raw
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::InvalidWebhookPayload("missing event type".to_string()))?
            .to_string();

        let kind = match event_type.as_str() {
            "checkout.session.completed" | "payment_intent.succeeded" => EventKind::Succeeded,
            "payment_intent.payment_failed" | "checkout.session.expired" => EventKind::Failed,
            _ => EventKind::Ignored,
        };

        let order_id = raw
            .pointer("/data/object/metadata/order_id")
            .or_else(|| raw.pointer("/data/object/client_reference_id"))
            .and_then(Value::as_str)
            .and_then(|id| id.parse().ok());

        Ok(CanonicalEvent {
            event_id,
            event_type,
            kind,
            order_id,
            raw,
        })
    }
}
