use hmac::{Hmac, Mac};
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha512;
use tracing::{info, instrument, warn};

use super::{CanonicalEvent, CheckoutSession, EventKind};
use crate::{entities::order::Model as OrderModel, errors::ServiceError};

type HmacSha512 = Hmac<Sha512>;

/// Payment-link card processor for the alternate region. Links are created
/// with a JSON POST; webhooks carry a hex HMAC-SHA512 of the raw body.
#[derive(Clone)]
pub struct CardProviderB {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    hmac_secret: Option<String>,
    currency: String,
}

#[derive(Debug, Serialize)]
struct PaymentLinkRequest<'a> {
    amount_cents: i64,
    currency: &'a str,
    reference: String,
    redirection_url: String,
    cancel_url: String,
    metadata: LinkMetadata,
}

#[derive(Debug, Serialize)]
struct LinkMetadata {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct PaymentLinkResponse {
    id: Value,
    url: String,
}

impl CardProviderB {
    pub fn new(
        client: reqwest::Client,
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        hmac_secret: Option<String>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            hmac_secret,
            currency: currency.into().to_uppercase(),
        }
    }

    #[instrument(skip(self, order), fields(order_id = %order.id))]
    pub async fn create_checkout_session(
        &self,
        order: &OrderModel,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<CheckoutSession, ServiceError> {
        let amount_cents = (order.total_amount * rust_decimal::Decimal::from(100))
            .round()
            .to_i64()
            .ok_or_else(|| ServiceError::InternalError("order total out of range".to_string()))?;
        let order_id = order.id.to_string();

        let body = PaymentLinkRequest {
            amount_cents,
            currency: &self.currency,
            reference: order_id.clone(),
            redirection_url: format!("{}?orderId={}", success_url, order_id),
            cancel_url: format!("{}?orderId={}", cancel_url, order_id),
            metadata: LinkMetadata {
                order_id: order_id.clone(),
            },
        };

        let response = self
            .client
            .post(format!("{}/v1/payment-links", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::ProviderUnavailable(format!("card_b request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            warn!(%status, "card_b rejected payment link");
            return Err(ServiceError::ProviderUnavailable(format!(
                "card_b answered {}",
                status
            )));
        }

        let link: PaymentLinkResponse = response.json().await.map_err(|e| {
            ServiceError::ProviderUnavailable(format!("card_b response unreadable: {}", e))
        })?;
        let session_id = match link.id {
            Value::String(id) => id,
            other => other.to_string(),
        };

        info!(%session_id, "card_b payment link created");
        Ok(CheckoutSession {
            session_id,
            url: link.url,
        })
    }

    pub fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> bool {
        let Some(secret) = self.hmac_secret.as_deref() else {
            warn!("card_b hmac secret not configured");
            return false;
        };
        let Ok(expected) = hex::decode(signature.trim()) else {
            return false;
        };
        let Ok(mut mac) = HmacSha512::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(payload);
        mac.verify_slice(&expected).is_ok()
    }

    pub fn parse_webhook(&self, payload: &[u8]) -> Result<CanonicalEvent, ServiceError> {
        let raw: Value = serde_json::from_slice(payload)
            .map_err(|e| ServiceError::InvalidWebhookPayload(e.to_string()))?;

        let event_id = match raw.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => {
                return Err(ServiceError::InvalidWebhookPayload(
                    "missing event id".to_string(),
                ))
            }
        };
        let event_type = raw
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::InvalidWebhookPayload("missing event type".to_string()))?
            .to_string();

        let kind = match event_type.as_str() {
            "TRANSACTION_SUCCESS" => EventKind::Succeeded,
            "TRANSACTION_FAILED" => EventKind::Failed,
            _ => EventKind::Ignored,
        };

        let order_id = raw
            .pointer("/obj/order_id")
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
