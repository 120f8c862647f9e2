use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "ShopWave API",
        version = "1.0.0",
        description = r#"
# ShopWave Storefront API

Order placement and payment reconciliation for the ShopWave storefront.

## Features

- **Orders**: place orders from the cart with optional coupons, track status history
- **Payments**: hosted checkout with two card providers or cash on delivery
- **Webhooks**: signature-verified, deduplicated provider callbacks
- **Idempotency**: send `X-Idempotency-Key` to make retries safe

## Authentication

Endpoints marked with a lock require a bearer access token from `/api/auth/login`:

```
Authorization: Bearer <access-token>
```

## Error Handling

```json
{
  "error": "Bad Request",
  "message": "Insufficient stock for product: Desk Lamp",
  "correlationId": "4f0c8a52-5f0e-4ac1-9b1c-0b2fe2a4d7a1",
  "timestamp": "2025-03-09T10:30:00Z"
}
```
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Auth", description = "Registration, login and token rotation"),
        (name = "Products", description = "Catalog endpoints"),
        (name = "Cart", description = "Server-side cart"),
        (name = "Coupons", description = "Coupon preview and administration"),
        (name = "Orders", description = "Order placement and lifecycle"),
        (name = "Payments", description = "Checkout sessions and provider webhooks")
    ),
    paths(
        crate::handlers::auth::register,
        crate::handlers::auth::login,
        crate::handlers::auth::refresh,
        crate::handlers::auth::logout,

        crate::handlers::products::get_product,
        crate::handlers::products::create_product,
        crate::handlers::products::restock_product,

        crate::handlers::cart::get_cart,
        crate::handlers::cart::set_item,
        crate::handlers::cart::remove_item,
        crate::handlers::cart::merge_cart,

        crate::handlers::coupons::validate_coupon,
        crate::handlers::coupons::list_coupons,
        crate::handlers::coupons::create_coupon,
        crate::handlers::coupons::delete_coupon,

        crate::handlers::orders::place_order,
        crate::handlers::orders::list_orders,
        crate::handlers::orders::get_order,
        crate::handlers::orders::order_history,
        crate::handlers::orders::cancel_order,
        crate::handlers::orders::update_order_status,

        crate::handlers::payments::create_checkout_session,
        crate::handlers::payments::payment_webhook,
    ),
    components(
        schemas(
            crate::auth::TokenPair,
            crate::auth::RegisterRequest,
            crate::auth::LoginRequest,
            crate::auth::RefreshTokenRequest,

            crate::services::products::ProductResponse,
            crate::services::products::CreateProductRequest,
            crate::services::products::RestockRequest,

            crate::services::cart::CartResponse,
            crate::services::cart::CartLine,
            crate::services::cart::CartItemRequest,
            crate::services::cart::MergeCartRequest,

            crate::services::coupons::ValidateCouponRequest,
            crate::services::coupons::CouponValidationResponse,
            crate::services::coupons::CreateCouponRequest,
            crate::services::coupons::CouponResponse,

            crate::services::orders::PlaceOrderRequest,
            crate::services::orders::PlaceOrderResponse,
            crate::services::orders::OrderResponse,
            crate::services::orders::OrderItemResponse,
            crate::services::orders::OrderListResponse,
            crate::services::order_status::StatusHistoryEntry,
            crate::handlers::orders::UpdateOrderStatusRequest,
            crate::entities::order::OrderStatus,
            crate::entities::order::PaymentStatus,
            crate::entities::order::PaymentMethod,

            crate::services::payments::CheckoutSession,
            crate::services::payments::checkout::CreateCheckoutSessionRequest,
            crate::handlers::payments::WebhookAck,

            crate::errors::ErrorResponse
        )
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDocV1;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_lists_workflow_endpoints() {
        let openapi = ApiDocV1::openapi();
        let json = serde_json::to_string_pretty(&openapi).unwrap();
        assert!(json.contains("ShopWave API"));
        assert!(json.contains("/api/orders"));
        assert!(json.contains("/api/payment/webhook/{provider}"));
        assert!(json.contains("bearer_auth"));
    }
}
