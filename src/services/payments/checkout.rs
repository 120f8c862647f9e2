use std::sync::Arc;

use axum::http::StatusCode;
use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, TransactionTrait,
};
use serde::Deserialize;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use super::PaymentGateways;
use crate::{
    entities::order::{self, Entity as OrderEntity, OrderStatus, PaymentMethod, PaymentStatus},
    errors::ServiceError,
    events::EventSender,
    services::{
        idempotency::{IdempotencyGuard, IdempotentResponse},
        order_status::{apply_payment_transition, publish_all},
    },
};

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateCheckoutSessionRequest {
    pub order_id: Uuid,
}

#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    gateways: PaymentGateways,
    guard: IdempotencyGuard,
    events: EventSender,
    success_url: String,
    cancel_url: String,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateways: PaymentGateways,
        guard: IdempotencyGuard,
        events: EventSender,
        success_url: impl Into<String>,
        cancel_url: impl Into<String>,
    ) -> Self {
        Self {
            db,
            gateways,
            guard,
            events,
            success_url: success_url.into(),
            cancel_url: cancel_url.into(),
        }
    }

    /// Opens a provider checkout for one of the caller's orders. With an
    /// idempotency key, retries replay the first successful answer and the
    /// provider is called once.
    #[instrument(skip(self, idempotency_key), fields(order_id = %order_id, user_id = %user_id))]
    pub async fn create_checkout_session(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        idempotency_key: Option<String>,
    ) -> Result<IdempotentResponse, ServiceError> {
        let scope = format!("checkout:{}", order_id);
        self.guard
            .run(idempotency_key, &scope, || self.open_session(user_id, order_id))
            .await
    }

    async fn open_session(
        &self,
        user_id: Uuid,
        order_id: Uuid,
    ) -> Result<IdempotentResponse, ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .filter(order::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if matches!(
            order.payment_status,
            PaymentStatus::Paid | PaymentStatus::CodDelivered
        ) {
            return Err(ServiceError::AlreadyPaid);
        }
        if order.status != OrderStatus::Pending {
            return Err(ServiceError::BadRequest(format!(
                "Order is {} and cannot be paid",
                order.status
            )));
        }

        let gateway = self.gateways.gateway(order.payment_method)?;
        let session = gateway
            .create_checkout_session(&order, &self.success_url, &self.cancel_url)
            .await?;

        if order.payment_method != PaymentMethod::Cod {
            let txn = self.db.begin().await?;
            OrderEntity::update_many()
                .col_expr(
                    order::Column::PaymentIntentId,
                    Expr::value(Some(session.session_id.clone())),
                )
                .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(order::Column::Id.eq(order.id))
                .exec(&txn)
                .await?;

            let mut events = Vec::new();
            let current = OrderEntity::find_by_id(order.id)
                .one(&txn)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
            if current.payment_status == PaymentStatus::Unpaid {
                apply_payment_transition(
                    &txn,
                    &current,
                    PaymentStatus::Pending,
                    &user_id.to_string(),
                    Some(format!("checkout session {}", session.session_id)),
                    &mut events,
                )
                .await?;
            }
            txn.commit().await?;
            publish_all(&self.events, events);
        }

        info!(provider = %gateway.method(), session_id = %session.session_id, "checkout session opened");
        IdempotentResponse::json(StatusCode::OK, &session)
    }
}
