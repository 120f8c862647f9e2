//! Periodic housekeeping: expired stock holds and idempotency records.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use sea_orm::{DatabaseConnection, EntityTrait, TransactionTrait};
use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::{
    entities::order::{Entity as OrderEntity, OrderStatus, PaymentStatus},
    errors::ServiceError,
    events::EventSender,
    services::{
        idempotency::IdempotencyGuard,
        order_status::{apply_order_transition, publish_all, push_release_event, SYSTEM_ACTOR},
        stock::{ReleasedStock, StockLedger},
    },
};

const SWEEP_BATCH: u64 = 200;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub reservations_released: u64,
    pub orders_cancelled: u64,
    pub idempotency_records_purged: u64,
}

#[derive(Clone)]
pub struct MaintenanceService {
    db: Arc<DatabaseConnection>,
    guard: IdempotencyGuard,
    events: EventSender,
}

impl MaintenanceService {
    pub fn new(db: Arc<DatabaseConnection>, guard: IdempotencyGuard, events: EventSender) -> Self {
        Self { db, guard, events }
    }

    /// Releases expired active holds, cancelling orders that are still
    /// waiting for payment.
    #[instrument(skip(self))]
    pub async fn release_expired_reservations(&self) -> Result<(u64, u64), ServiceError> {
        let expired = StockLedger::expired_active(&*self.db, Utc::now(), SWEEP_BATCH).await?;
        let mut released = 0u64;
        let mut cancelled = 0u64;

        for hold in expired {
            let txn = self.db.begin().await?;
            if !StockLedger::release_expired(&txn, &hold).await? {
                continue;
            }
            released += 1;

            let mut events = Vec::new();
            push_release_event(
                &mut events,
                hold.order_id,
                &[ReleasedStock {
                    product_id: hold.product_id,
                    quantity: hold.quantity,
                }],
                "expired",
            );

            if let Some(order) = OrderEntity::find_by_id(hold.order_id).one(&txn).await? {
                let awaiting_payment = order.status == OrderStatus::Pending
                    && matches!(
                        order.payment_status,
                        PaymentStatus::Unpaid | PaymentStatus::Pending
                    );
                if awaiting_payment {
                    apply_order_transition(
                        &txn,
                        &order,
                        OrderStatus::Cancelled,
                        SYSTEM_ACTOR,
                        Some("stock reservation expired".to_string()),
                        &mut events,
                    )
                    .await?;
                    cancelled += 1;
                }
            }

            txn.commit().await?;
            publish_all(&self.events, events);
        }

        if released > 0 {
            info!(released, cancelled, "expired reservations swept");
        }
        Ok((released, cancelled))
    }

    pub async fn run_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.release_expired_reservations().await {
            Ok((released, cancelled)) => {
                report.reservations_released = released;
                report.orders_cancelled = cancelled;
            }
            Err(e) => error!(error = %e, "reservation sweep failed"),
        }

        match self.guard.purge_expired().await {
            Ok(purged) => report.idempotency_records_purged = purged,
            Err(e) => error!(error = %e, "idempotency purge failed"),
        }

        report
    }

    /// Ticks every `interval` until `shutdown` flips to `true`.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "maintenance sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("maintenance sweeper stopped");
    }
}
