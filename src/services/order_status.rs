use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{
    sea_query::Expr, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, Iterable, QueryFilter, QueryOrder, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    entities::{
        order::{self, Entity as OrderEntity, Model as OrderModel, OrderStatus, PaymentStatus},
        order_status_history::{self, Entity as HistoryEntity, StatusAxis},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::stock::{ReleasedStock, StockLedger},
};

/// Actor recorded for transitions made by background jobs.
pub const SYSTEM_ACTOR: &str = "system";

/// Directed graph of the fulfilment axis. `Delivered`, `Cancelled` and
/// `Refunded` are terminal.
pub fn order_transition_allowed(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;
    matches!(
        (from, to),
        (Pending, Processing | Cancelled | Refunded | PaymentFailed)
            | (Processing, Shipped | Cancelled | Refunded)
            | (Shipped, Delivered | Cancelled | Refunded)
            | (PaymentFailed, Cancelled | Refunded)
    )
}

/// Directed graph of the payment axis.
pub fn payment_transition_allowed(from: PaymentStatus, to: PaymentStatus) -> bool {
    use PaymentStatus::*;
    matches!(
        (from, to),
        (Unpaid, Pending | Paid | Failed | CodPending)
            | (Pending, Paid | Failed)
            | (CodPending, CodDelivered)
            | (Paid | CodDelivered, Refunded)
    )
}

/// Parses a client-supplied status name. Case and underscores are ignored,
/// so `payment_failed` and `PaymentFailed` are the same status.
pub fn parse_order_status(raw: &str) -> Result<OrderStatus, ServiceError> {
    let wanted: String = raw.trim().chars().filter(|c| *c != '_').collect();
    OrderStatus::iter()
        .find(|status| status.to_string().eq_ignore_ascii_case(&wanted))
        .ok_or_else(|| ServiceError::InvalidStatus(format!("Unknown order status: {}", raw.trim())))
}

async fn record_history<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    axis: StatusAxis,
    from: String,
    to: String,
    actor: &str,
    note: Option<String>,
) -> Result<(), ServiceError> {
    let entry = order_status_history::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        axis: Set(axis),
        from_status: Set(from),
        to_status: Set(to),
        actor: Set(actor.to_string()),
        note: Set(note),
        created_at: Set(Utc::now()),
    };
    HistoryEntity::insert(entry).exec_without_returning(conn).await?;
    Ok(())
}

/// Moves the order's fulfilment status, appending history.
///
/// The write is conditional on the status the caller observed; losing that
/// race is a `Conflict`. Asking for the current status is a no-op.
pub async fn apply_order_transition<C: ConnectionTrait>(
    conn: &C,
    order: &OrderModel,
    to: OrderStatus,
    actor: &str,
    note: Option<String>,
    events: &mut Vec<Event>,
) -> Result<OrderModel, ServiceError> {
    if order.status == to {
        return Ok(order.clone());
    }
    if !order_transition_allowed(order.status, to) {
        return Err(ServiceError::InvalidTransition {
            from: order.status.to_string(),
            to: to.to_string(),
        });
    }

    let now = Utc::now();
    let result = OrderEntity::update_many()
        .col_expr(order::Column::Status, Expr::value(to))
        .col_expr(order::Column::UpdatedAt, Expr::value(now))
        .filter(order::Column::Id.eq(order.id))
        .filter(order::Column::Status.eq(order.status))
        .exec(conn)
        .await?;
    if result.rows_affected == 0 {
        return Err(ServiceError::Conflict(
            "Order status changed concurrently".to_string(),
        ));
    }

    // Fulfilment takes the units for good; the expiry sweep must not return them.
    if order.status == OrderStatus::Pending && to == OrderStatus::Processing {
        StockLedger::consume_for_order(conn, order.id).await?;
    }

    record_history(
        conn,
        order.id,
        StatusAxis::Order,
        order.status.to_string(),
        to.to_string(),
        actor,
        note,
    )
    .await?;

    events.push(Event::OrderStatusChanged {
        order_id: order.id,
        old_status: order.status,
        new_status: to,
        actor: actor.to_string(),
    });

    let mut updated = order.clone();
    updated.status = to;
    updated.updated_at = now;
    Ok(updated)
}

/// Payment-axis counterpart of [`apply_order_transition`].
pub async fn apply_payment_transition<C: ConnectionTrait>(
    conn: &C,
    order: &OrderModel,
    to: PaymentStatus,
    actor: &str,
    note: Option<String>,
    events: &mut Vec<Event>,
) -> Result<OrderModel, ServiceError> {
    if order.payment_status == to {
        return Ok(order.clone());
    }
    if !payment_transition_allowed(order.payment_status, to) {
        return Err(ServiceError::InvalidTransition {
            from: order.payment_status.to_string(),
            to: to.to_string(),
        });
    }

    let now = Utc::now();
    let result = OrderEntity::update_many()
        .col_expr(order::Column::PaymentStatus, Expr::value(to))
        .col_expr(order::Column::UpdatedAt, Expr::value(now))
        .filter(order::Column::Id.eq(order.id))
        .filter(order::Column::PaymentStatus.eq(order.payment_status))
        .exec(conn)
        .await?;
    if result.rows_affected == 0 {
        return Err(ServiceError::Conflict(
            "Payment status changed concurrently".to_string(),
        ));
    }

    record_history(
        conn,
        order.id,
        StatusAxis::Payment,
        order.payment_status.to_string(),
        to.to_string(),
        actor,
        note,
    )
    .await?;

    events.push(Event::PaymentStatusChanged {
        order_id: order.id,
        old_status: order.payment_status,
        new_status: to,
        actor: actor.to_string(),
    });

    let mut updated = order.clone();
    updated.payment_status = to;
    updated.updated_at = now;
    Ok(updated)
}

/// Cancels the order and hands its stock back.
///
/// `include_consumed` also returns units whose hold was already consumed,
/// which is what an explicit cancellation wants; the expiry sweep only
/// ever releases active holds.
pub async fn cancel_order<C: ConnectionTrait>(
    conn: &C,
    order: &OrderModel,
    actor: &str,
    note: Option<String>,
    include_consumed: bool,
    events: &mut Vec<Event>,
) -> Result<(OrderModel, Vec<ReleasedStock>), ServiceError> {
    let cancelled =
        apply_order_transition(conn, order, OrderStatus::Cancelled, actor, note, events).await?;
    let released = StockLedger::release_for_order(conn, order.id, include_consumed).await?;
    push_release_event(events, order.id, &released, "cancelled");
    Ok((cancelled, released))
}

pub(crate) fn push_release_event(
    events: &mut Vec<Event>,
    order_id: Uuid,
    released: &[ReleasedStock],
    reason: &str,
) {
    let units: i32 = released.iter().map(|r| r.quantity).sum();
    if units > 0 {
        events.push(Event::ReservationsReleased {
            order_id,
            units,
            reason: reason.to_string(),
        });
    }
}

pub(crate) fn publish_all(sender: &EventSender, events: Vec<Event>) {
    for event in events {
        sender.publish(event);
    }
}

/// One entry of an order's status history.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusHistoryEntry {
    pub axis: StatusAxis,
    pub from_status: String,
    pub to_status: String,
    pub actor: String,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<order_status_history::Model> for StatusHistoryEntry {
    fn from(model: order_status_history::Model) -> Self {
        Self {
            axis: model.axis,
            from_status: model.from_status,
            to_status: model.to_status,
            actor: model.actor,
            note: model.note,
            created_at: model.created_at,
        }
    }
}

#[derive(Clone)]
pub struct OrderStatusService {
    db: Arc<DatabaseConnection>,
    events: EventSender,
}

impl OrderStatusService {
    pub fn new(db: Arc<DatabaseConnection>, events: EventSender) -> Self {
        Self { db, events }
    }

    /// Admin status change, with the payment-axis side effects each target
    /// status implies.
    #[instrument(skip(self, note), fields(order_id = %order_id, new_status = %raw_status))]
    pub async fn update_status(
        &self,
        order_id: Uuid,
        raw_status: &str,
        actor: &str,
        note: Option<String>,
    ) -> Result<OrderModel, ServiceError> {
        let target = parse_order_status(raw_status)?;

        let txn = self.db.begin().await?;
        let order = OrderEntity::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if order.status == target {
            return Ok(order);
        }

        let mut events = Vec::new();
        let mut updated = match target {
            OrderStatus::Cancelled => {
                cancel_order(&txn, &order, actor, note.clone(), true, &mut events)
                    .await?
                    .0
            }
            _ => apply_order_transition(&txn, &order, target, actor, note.clone(), &mut events).await?,
        };

        match (target, updated.payment_status) {
            (OrderStatus::Delivered, PaymentStatus::CodPending) => {
                updated = apply_payment_transition(
                    &txn,
                    &updated,
                    PaymentStatus::CodDelivered,
                    actor,
                    note,
                    &mut events,
                )
                .await?;
            }
            (OrderStatus::Refunded, PaymentStatus::Paid | PaymentStatus::CodDelivered) => {
                updated = apply_payment_transition(
                    &txn,
                    &updated,
                    PaymentStatus::Refunded,
                    actor,
                    note,
                    &mut events,
                )
                .await?;
            }
            (
                OrderStatus::Refunded,
                PaymentStatus::Unpaid | PaymentStatus::Pending | PaymentStatus::CodPending,
            ) => {
                let released = StockLedger::release_for_order(&txn, order_id, true).await?;
                push_release_event(&mut events, order_id, &released, "refunded");
            }
            _ => {}
        }

        txn.commit().await?;
        info!(
            from = %order.status,
            to = %updated.status,
            payment_status = %updated.payment_status,
            "order status updated"
        );
        publish_all(&self.events, events);
        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn history(&self, order_id: Uuid) -> Result<Vec<StatusHistoryEntry>, ServiceError> {
        let entries = HistoryEntity::find()
            .filter(order_status_history::Column::OrderId.eq(order_id))
            .order_by_asc(order_status_history::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        if entries.is_empty() && OrderEntity::find_by_id(order_id).one(&*self.db).await?.is_none() {
            warn!("history requested for unknown order");
            return Err(ServiceError::NotFound(format!("Order {} not found", order_id)));
        }
        Ok(entries.into_iter().map(StatusHistoryEntry::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;
    use OrderStatus::*;

    #[rstest]
    #[case(Pending, Processing, true)]
    #[case(Processing, Shipped, true)]
    #[case(Shipped, Delivered, true)]
    #[case(Pending, Cancelled, true)]
    #[case(Shipped, Refunded, true)]
    #[case(Pending, PaymentFailed, true)]
    #[case(PaymentFailed, Cancelled, true)]
    #[case(Processing, PaymentFailed, false)]
    #[case(Pending, Shipped, false)]
    #[case(Delivered, Pending, false)]
    #[case(Delivered, Refunded, false)]
    #[case(Cancelled, Processing, false)]
    #[case(Refunded, Cancelled, false)]
    fn order_graph(#[case] from: OrderStatus, #[case] to: OrderStatus, #[case] allowed: bool) {
        assert_eq!(order_transition_allowed(from, to), allowed);
    }

    #[rstest]
    #[case(PaymentStatus::Unpaid, PaymentStatus::Paid, true)]
    #[case(PaymentStatus::Pending, PaymentStatus::Failed, true)]
    #[case(PaymentStatus::CodPending, PaymentStatus::CodDelivered, true)]
    #[case(PaymentStatus::CodDelivered, PaymentStatus::Refunded, true)]
    #[case(PaymentStatus::Paid, PaymentStatus::Pending, false)]
    #[case(PaymentStatus::Failed, PaymentStatus::Paid, false)]
    #[case(PaymentStatus::CodPending, PaymentStatus::Paid, false)]
    fn payment_graph(
        #[case] from: PaymentStatus,
        #[case] to: PaymentStatus,
        #[case] allowed: bool,
    ) {
        assert_eq!(payment_transition_allowed(from, to), allowed);
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for terminal in [Delivered, Cancelled, Refunded] {
            for to in OrderStatus::iter() {
                assert!(!order_transition_allowed(terminal, to), "{terminal} -> {to}");
            }
        }
    }

    #[rstest]
    #[case("Processing", Processing)]
    #[case("shipped", Shipped)]
    #[case(" payment_failed ", PaymentFailed)]
    fn parses_status_names(#[case] raw: &str, #[case] expected: OrderStatus) {
        assert_eq!(parse_order_status(raw).unwrap(), expected);
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert_matches!(parse_order_status("teleported"), Err(ServiceError::InvalidStatus(_)));
    }
}
