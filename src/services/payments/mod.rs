//! Payment Provider Gateway
//!
//! The provider set is closed: [`PaymentGateway`] is a tagged variant and
//! every capability dispatches by `match`, so adding a provider is a
//! compile-time exhaustive change rather than a new string key.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    entities::order::{Model as OrderModel, PaymentMethod},
    errors::ServiceError,
};

pub mod checkout;
pub mod provider_a;
pub mod provider_b;
pub mod webhooks;

pub use provider_a::CardProviderA;
pub use provider_b::CardProviderB;

/// Reference returned by a provider for an order's payment page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSession {
    pub session_id: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Succeeded,
    Failed,
    /// Valid event with no bearing on payment state.
    Ignored,
}

/// Provider webhook normalized to what reconciliation needs.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalEvent {
    pub event_id: String,
    pub event_type: String,
    pub kind: EventKind,
    pub order_id: Option<Uuid>,
    pub raw: Value,
}

#[derive(Clone)]
pub enum PaymentGateway {
    CardProviderA(CardProviderA),
    CardProviderB(CardProviderB),
    /// No external call: the order is settled on delivery.
    CashOnDelivery,
}

// Variant name only: the providers hold API keys and webhook secrets.
impl std::fmt::Debug for PaymentGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CardProviderA(_) => f.write_str("CardProviderA(..)"),
            Self::CardProviderB(_) => f.write_str("CardProviderB(..)"),
            Self::CashOnDelivery => f.write_str("CashOnDelivery"),
        }
    }
}

impl PaymentGateway {
    pub fn method(&self) -> PaymentMethod {
        match self {
            Self::CardProviderA(_) => PaymentMethod::CardA,
            Self::CardProviderB(_) => PaymentMethod::CardB,
            Self::CashOnDelivery => PaymentMethod::Cod,
        }
    }

    pub async fn create_checkout_session(
        &self,
        order: &OrderModel,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<CheckoutSession, ServiceError> {
        match self {
            Self::CardProviderA(provider) => {
                provider
                    .create_checkout_session(order, success_url, cancel_url)
                    .await
            }
            Self::CardProviderB(provider) => {
                provider
                    .create_checkout_session(order, success_url, cancel_url)
                    .await
            }
            Self::CashOnDelivery => Ok(CheckoutSession {
                session_id: format!("cod_{}", order.id.simple()),
                url: format!("{}?orderId={}", success_url, order.id),
            }),
        }
    }

    pub fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> bool {
        match self {
            Self::CardProviderA(provider) => provider.verify_webhook_signature(payload, signature),
            Self::CardProviderB(provider) => provider.verify_webhook_signature(payload, signature),
            Self::CashOnDelivery => false,
        }
    }

    pub fn parse_webhook(&self, payload: &[u8]) -> Result<CanonicalEvent, ServiceError> {
        match self {
            Self::CardProviderA(provider) => provider.parse_webhook(payload),
            Self::CardProviderB(provider) => provider.parse_webhook(payload),
            Self::CashOnDelivery => Err(ServiceError::InvalidWebhookPayload(
                "cash on delivery does not send webhooks".to_string(),
            )),
        }
    }
}

/// The configured providers. A card provider without credentials is absent
/// and selecting it fails with `ProviderUnavailable`.
#[derive(Clone, Default)]
pub struct PaymentGateways {
    card_a: Option<CardProviderA>,
    card_b: Option<CardProviderB>,
}

impl PaymentGateways {
    pub fn new(card_a: Option<CardProviderA>, card_b: Option<CardProviderB>) -> Self {
        Self { card_a, card_b }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.payment_http_timeout_secs))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client: {}", e)))?;

        let card_a = config
            .card_a_secret_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .map(|key| {
                CardProviderA::new(
                    client.clone(),
                    config.card_a_api_base.as_str(),
                    key,
                    config.card_a_webhook_secret.clone(),
                    config.card_a_webhook_tolerance_secs,
                    config.payment_currency.as_str(),
                )
            });
        let card_b = config
            .card_b_api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .map(|key| {
                CardProviderB::new(
                    client.clone(),
                    config.card_b_api_base.as_str(),
                    key,
                    config.card_b_hmac_secret.clone(),
                    config.payment_currency.as_str(),
                )
            });

        Ok(Self { card_a, card_b })
    }

    pub fn gateway(&self, method: PaymentMethod) -> Result<PaymentGateway, ServiceError> {
        match method {
            PaymentMethod::CardA => self
                .card_a
                .clone()
                .map(PaymentGateway::CardProviderA)
                .ok_or_else(|| ServiceError::ProviderUnavailable("card_a not configured".into())),
            PaymentMethod::CardB => self
                .card_b
                .clone()
                .map(PaymentGateway::CardProviderB)
                .ok_or_else(|| ServiceError::ProviderUnavailable("card_b not configured".into())),
            PaymentMethod::Cod => Ok(PaymentGateway::CashOnDelivery),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::str::FromStr;

    #[test]
    fn provider_names_resolve_to_methods() {
        assert_eq!(PaymentMethod::from_str("card_a").unwrap(), PaymentMethod::CardA);
        assert_eq!(PaymentMethod::from_str("stripe").unwrap(), PaymentMethod::CardA);
        assert_eq!(PaymentMethod::from_str("paymob").unwrap(), PaymentMethod::CardB);
        assert_eq!(PaymentMethod::from_str("cod").unwrap(), PaymentMethod::Cod);
        assert!(PaymentMethod::from_str("paypal").is_err());
        assert_eq!(PaymentMethod::CardA.to_string(), "card_a");
    }

    #[test]
    fn unconfigured_card_providers_are_unavailable() {
        let gateways = PaymentGateways::default();
        assert_matches!(
            gateways.gateway(PaymentMethod::CardA),
            Err(ServiceError::ProviderUnavailable(_))
        );
        assert_matches!(
            gateways.gateway(PaymentMethod::Cod),
            Ok(PaymentGateway::CashOnDelivery)
        );
    }

    #[test]
    fn cash_on_delivery_never_accepts_webhooks() {
        let cod = PaymentGateway::CashOnDelivery;
        assert!(!cod.verify_webhook_signature(b"{}", "anything"));
        assert_matches!(cod.parse_webhook(b"{}"), Err(ServiceError::InvalidWebhookPayload(_)));
    }
}
