pub mod auth;
pub mod cart;
pub mod common;
pub mod coupons;
pub mod orders;
pub mod payments;
pub mod products;

use std::sync::Arc;

use crate::{
    auth::{AuthConfig, AuthService},
    config::AppConfig,
    db::DbPool,
    errors::ServiceError,
    events::EventSender,
    services::{
        cart::CartService,
        coupons::CouponService,
        idempotency::IdempotencyGuard,
        maintenance::MaintenanceService,
        order_status::OrderStatusService,
        orders::OrderService,
        payments::{checkout::CheckoutService, webhooks::WebhookService, PaymentGateways},
        products::ProductService,
    },
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub auth: Arc<AuthService>,
    pub products: Arc<ProductService>,
    pub cart: Arc<CartService>,
    pub coupons: Arc<CouponService>,
    pub orders: Arc<OrderService>,
    pub order_status: Arc<OrderStatusService>,
    pub checkout: Arc<CheckoutService>,
    pub webhooks: Arc<WebhookService>,
    pub maintenance: Arc<MaintenanceService>,
}

impl AppServices {
    /// Wires every service from configuration. Payment providers without
    /// credentials stay disabled.
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: EventSender,
        config: &AppConfig,
    ) -> Result<Self, ServiceError> {
        let gateways = PaymentGateways::from_config(config)?;
        Ok(Self::with_gateways(db_pool, event_sender, config, gateways))
    }

    pub fn with_gateways(
        db_pool: Arc<DbPool>,
        event_sender: EventSender,
        config: &AppConfig,
        gateways: PaymentGateways,
    ) -> Self {
        let guard = IdempotencyGuard::new(
            db_pool.clone(),
            config.idempotency_ttl(),
            std::time::Duration::from_millis(config.idempotency_wait_ms),
        );

        let auth = Arc::new(AuthService::new(
            AuthConfig::from_app_config(config),
            db_pool.clone(),
            event_sender.clone(),
        ));
        let checkout = Arc::new(CheckoutService::new(
            db_pool.clone(),
            gateways.clone(),
            guard.clone(),
            event_sender.clone(),
            config.checkout_success_url.clone(),
            config.checkout_cancel_url.clone(),
        ));
        let webhooks = Arc::new(WebhookService::new(
            db_pool.clone(),
            gateways,
            event_sender.clone(),
        ));

        Self {
            auth,
            products: Arc::new(ProductService::new(db_pool.clone())),
            cart: Arc::new(CartService::new(db_pool.clone())),
            coupons: Arc::new(CouponService::new(db_pool.clone())),
            orders: Arc::new(OrderService::new(
                db_pool.clone(),
                event_sender.clone(),
                config.reservation_ttl(),
            )),
            order_status: Arc::new(OrderStatusService::new(
                db_pool.clone(),
                event_sender.clone(),
            )),
            checkout,
            webhooks,
            maintenance: Arc::new(MaintenanceService::new(db_pool, guard, event_sender)),
        }
    }
}
