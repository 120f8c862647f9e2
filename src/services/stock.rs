//! Stock Ledger
//!
//! Every write to `products.stock` goes through here. Decrements are single
//! conditional statements, so two transactions racing for the last unit
//! cannot both succeed, and reservation state flips are conditional on the
//! current status so a hold is released or consumed at most once.

use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ActiveValue::Set, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect,
};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        product::{self, Entity as ProductEntity},
        stock_reservation::{
            self, Entity as ReservationEntity, Model as ReservationModel, ReservationStatus,
        },
    },
    errors::ServiceError,
};

/// One requested line: `quantity` units of `product_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockLine {
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
}

/// Units handed back to the shelf for one product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReleasedStock {
    pub product_id: Uuid,
    pub quantity: i32,
}

pub struct StockLedger;

impl StockLedger {
    /// Decrements stock for every line or for none of them.
    ///
    /// Must run inside the caller's transaction: the first shortfall returns
    /// `InsufficientStock` and the caller drops the transaction, undoing the
    /// lines already taken. Lines are applied in product-id order so
    /// concurrent checkouts lock rows in the same order.
    #[instrument(skip(conn, lines), fields(lines = lines.len()))]
    pub async fn check_and_reserve<C: ConnectionTrait>(
        conn: &C,
        lines: &[StockLine],
    ) -> Result<(), ServiceError> {
        let mut ordered: Vec<&StockLine> = lines.iter().collect();
        ordered.sort_by_key(|line| line.product_id);

        for line in ordered {
            if line.quantity <= 0 {
                return Err(ServiceError::ValidationError(format!(
                    "Quantity for {} must be positive",
                    line.product_name
                )));
            }

            let result = ProductEntity::update_many()
                .col_expr(
                    product::Column::Stock,
                    Expr::col(product::Column::Stock).sub(line.quantity),
                )
                .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(product::Column::Id.eq(line.product_id))
                .filter(product::Column::Stock.gte(line.quantity))
                .exec(conn)
                .await?;

            if result.rows_affected == 0 {
                counter!("shopwave_stock_shortfall_total", 1);
                warn!(product_id = %line.product_id, requested = line.quantity, "insufficient stock");
                return Err(ServiceError::InsufficientStock(line.product_name.clone()));
            }
        }

        Ok(())
    }

    /// Returns `quantity` units of a product to available stock.
    pub async fn restock<C: ConnectionTrait>(
        conn: &C,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(
                "Restock quantity must be positive".to_string(),
            ));
        }

        let result = ProductEntity::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).add(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product::Column::Id.eq(product_id))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!("Product {} not found", product_id)));
        }
        Ok(())
    }

    /// Records one hold per line for `order_id`.
    pub async fn record_reservations<C: ConnectionTrait>(
        conn: &C,
        order_id: Uuid,
        lines: &[StockLine],
        status: ReservationStatus,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        if lines.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let models = lines.iter().map(|line| stock_reservation::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            product_id: Set(line.product_id),
            quantity: Set(line.quantity),
            status: Set(status),
            expires_at: Set(expires_at),
            created_at: Set(now),
            updated_at: Set(now),
        });

        ReservationEntity::insert_many(models)
            .exec_without_returning(conn)
            .await?;
        debug!(%order_id, lines = lines.len(), ?status, "reservations recorded");
        Ok(())
    }

    /// Flips one hold from `from` to `Released` and puts its units back.
    /// Returns `false` when another actor changed the hold first.
    async fn release_one<C: ConnectionTrait>(
        conn: &C,
        reservation: &ReservationModel,
        from: ReservationStatus,
    ) -> Result<bool, ServiceError> {
        let result = ReservationEntity::update_many()
            .col_expr(
                stock_reservation::Column::Status,
                Expr::value(ReservationStatus::Released),
            )
            .col_expr(stock_reservation::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(stock_reservation::Column::Id.eq(reservation.id))
            .filter(stock_reservation::Column::Status.eq(from))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Ok(false);
        }

        Self::restock(conn, reservation.product_id, reservation.quantity).await?;
        Ok(true)
    }

    /// Releases the order's holds and restores their stock.
    ///
    /// With `include_consumed`, units already consumed (paid or
    /// cash-on-delivery orders) go back too; used by cancellation.
    #[instrument(skip(conn))]
    pub async fn release_for_order<C: ConnectionTrait>(
        conn: &C,
        order_id: Uuid,
        include_consumed: bool,
    ) -> Result<Vec<ReleasedStock>, ServiceError> {
        let mut statuses = vec![ReservationStatus::Active];
        if include_consumed {
            statuses.push(ReservationStatus::Consumed);
        }

        let holds = ReservationEntity::find()
            .filter(stock_reservation::Column::OrderId.eq(order_id))
            .filter(stock_reservation::Column::Status.is_in(statuses))
            .order_by_asc(stock_reservation::Column::ProductId)
            .all(conn)
            .await?;

        let mut released = Vec::with_capacity(holds.len());
        for hold in holds {
            if Self::release_one(conn, &hold, hold.status).await? {
                released.push(ReleasedStock {
                    product_id: hold.product_id,
                    quantity: hold.quantity,
                });
            }
        }

        if !released.is_empty() {
            info!(%order_id, count = released.len(), "reservations released");
        }
        Ok(released)
    }

    /// Marks the order's active holds as consumed; the units stay sold.
    pub async fn consume_for_order<C: ConnectionTrait>(
        conn: &C,
        order_id: Uuid,
    ) -> Result<u64, ServiceError> {
        let result = ReservationEntity::update_many()
            .col_expr(
                stock_reservation::Column::Status,
                Expr::value(ReservationStatus::Consumed),
            )
            .col_expr(stock_reservation::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(stock_reservation::Column::OrderId.eq(order_id))
            .filter(stock_reservation::Column::Status.eq(ReservationStatus::Active))
            .exec(conn)
            .await?;
        Ok(result.rows_affected)
    }

    /// Active holds whose lifetime ended before `now`, oldest first.
    pub async fn expired_active<C: ConnectionTrait>(
        conn: &C,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<ReservationModel>, ServiceError> {
        Ok(ReservationEntity::find()
            .filter(stock_reservation::Column::Status.eq(ReservationStatus::Active))
            .filter(stock_reservation::Column::ExpiresAt.lt(now))
            .order_by_asc(stock_reservation::Column::ExpiresAt)
            .limit(limit)
            .all(conn)
            .await?)
    }

    /// Releases a single expired hold. `false` if it was already handled.
    pub async fn release_expired<C: ConnectionTrait>(
        conn: &C,
        reservation: &ReservationModel,
    ) -> Result<bool, ServiceError> {
        Self::release_one(conn, reservation, ReservationStatus::Active).await
    }
}
