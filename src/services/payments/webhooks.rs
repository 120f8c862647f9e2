use std::{str::FromStr, sync::Arc};

use chrono::Utc;
use metrics::counter;
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ActiveValue::Set,
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, TransactionTrait,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{CanonicalEvent, EventKind, PaymentGateways};
use crate::{
    entities::{
        order::{Entity as OrderEntity, Model as OrderModel, OrderStatus, PaymentMethod, PaymentStatus},
        webhook_event::{self, Entity as WebhookEventEntity},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        order_status::{
            apply_order_transition, apply_payment_transition, payment_transition_allowed,
            publish_all, push_release_event,
        },
        stock::StockLedger,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    /// `(provider, event_id)` was seen before; nothing was changed.
    Duplicate,
}

#[derive(Clone)]
pub struct WebhookService {
    db: Arc<DatabaseConnection>,
    gateways: PaymentGateways,
    events: EventSender,
}

impl WebhookService {
    pub fn new(db: Arc<DatabaseConnection>, gateways: PaymentGateways, events: EventSender) -> Self {
        Self {
            db,
            gateways,
            events,
        }
    }

    /// Verifies, deduplicates and applies one provider callback.
    ///
    /// The event row and every order mutation commit together, so a
    /// delivery either changes nothing or is recorded exactly once.
    #[instrument(skip(self, payload, signature), fields(provider = %provider))]
    pub async fn handle(
        &self,
        provider: &str,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookOutcome, ServiceError> {
        let method = PaymentMethod::from_str(&provider.to_ascii_lowercase()).map_err(|_| {
            ServiceError::BadRequest(format!("Unsupported payment provider: {}", provider))
        })?;
        if method == PaymentMethod::Cod {
            return Err(ServiceError::BadRequest(
                "Cash on delivery does not accept webhooks".to_string(),
            ));
        }

        let gateway = self
            .gateways
            .gateway(method)
            .map_err(|_| ServiceError::InvalidWebhookSignature)?;
        let signature = signature.unwrap_or_default();
        if !gateway.verify_webhook_signature(payload, signature) {
            counter!("shopwave_webhook_rejected_total", 1);
            warn!("webhook signature rejected");
            return Err(ServiceError::InvalidWebhookSignature);
        }

        let event = gateway.parse_webhook(payload)?;
        let provider_name = method.to_string();

        let txn = self.db.begin().await?;
        let record_id = Uuid::new_v4();
        let record = webhook_event::ActiveModel {
            id: Set(record_id),
            provider: Set(provider_name.clone()),
            event_id: Set(event.event_id.clone()),
            event_type: Set(event.event_type.clone()),
            order_id: Set(event.order_id),
            payload: Set(String::from_utf8_lossy(payload).into_owned()),
            processed_at: Set(None),
            created_at: Set(Utc::now()),
        };
        let inserted = WebhookEventEntity::insert(record)
            .on_conflict(
                OnConflict::columns([
                    webhook_event::Column::Provider,
                    webhook_event::Column::EventId,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(&txn)
            .await?;

        if inserted == 0 {
            counter!("shopwave_webhook_duplicates_total", 1);
            info!(event_id = %event.event_id, "duplicate webhook acknowledged");
            return Ok(WebhookOutcome::Duplicate);
        }

        let actor = format!("webhook:{}", provider_name);
        let mut events = Vec::new();
        self.apply(&txn, &event, &actor, &mut events).await?;

        WebhookEventEntity::update_many()
            .col_expr(webhook_event::Column::ProcessedAt, Expr::value(Some(Utc::now())))
            .filter(webhook_event::Column::Id.eq(record_id))
            .exec(&txn)
            .await?;
        txn.commit().await?;

        info!(event_id = %event.event_id, event_type = %event.event_type, "webhook processed");
        publish_all(&self.events, events);
        Ok(WebhookOutcome::Processed)
    }

    async fn apply<C: ConnectionTrait>(
        &self,
        conn: &C,
        event: &CanonicalEvent,
        actor: &str,
        events: &mut Vec<Event>,
    ) -> Result<(), ServiceError> {
        if event.kind == EventKind::Ignored {
            return Ok(());
        }
        let Some(order_id) = event.order_id else {
            warn!(event_id = %event.event_id, "webhook carries no order reference");
            return Ok(());
        };
        let Some(order) = OrderEntity::find_by_id(order_id).one(conn).await? else {
            warn!(%order_id, "webhook references unknown order");
            return Ok(());
        };

        let note = Some(format!("{} {}", event.event_type, event.event_id));
        match event.kind {
            EventKind::Succeeded => payment_succeeded(conn, &order, actor, note, events).await,
            EventKind::Failed => payment_failed(conn, &order, actor, note, events).await,
            EventKind::Ignored => Ok(()),
        }
    }
}

async fn payment_succeeded<C: ConnectionTrait>(
    conn: &C,
    order: &OrderModel,
    actor: &str,
    note: Option<String>,
    events: &mut Vec<Event>,
) -> Result<(), ServiceError> {
    if order.payment_status == PaymentStatus::Paid {
        return Ok(());
    }
    if !payment_transition_allowed(order.payment_status, PaymentStatus::Paid) {
        warn!(order_id = %order.id, payment_status = %order.payment_status, "payment success ignored");
        return Ok(());
    }
    if order.status == OrderStatus::Cancelled {
        warn!(order_id = %order.id, "payment received for a cancelled order");
    }

    apply_payment_transition(conn, order, PaymentStatus::Paid, actor, note, events).await?;
    StockLedger::consume_for_order(conn, order.id).await?;
    Ok(())
}

async fn payment_failed<C: ConnectionTrait>(
    conn: &C,
    order: &OrderModel,
    actor: &str,
    note: Option<String>,
    events: &mut Vec<Event>,
) -> Result<(), ServiceError> {
    if !payment_transition_allowed(order.payment_status, PaymentStatus::Failed) {
        warn!(order_id = %order.id, payment_status = %order.payment_status, "payment failure ignored");
        return Ok(());
    }

    let order =
        apply_payment_transition(conn, order, PaymentStatus::Failed, actor, note.clone(), events)
            .await?;
    if order.status == OrderStatus::Pending {
        apply_order_transition(conn, &order, OrderStatus::PaymentFailed, actor, note, events)
            .await?;
    }
    let released = StockLedger::release_for_order(conn, order.id, false).await?;
    push_release_event(events, order.id, &released, "payment failed");
    Ok(())
}
