use std::{collections::BTreeMap, sync::Arc};

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ActiveValue::Set,
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::{
        cart_item::{self, Entity as CartItemEntity},
        product::Entity as ProductEntity,
    },
    errors::ServiceError,
    money::round_money,
};

const MAX_LINE_QUANTITY: i32 = 1_000;

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CartItemRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1, max = 1000))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MergeCartRequest {
    #[validate]
    pub items: Vec<CartItemRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    /// Current catalog price; the order captures its own copy at placement.
    #[schema(value_type = String)]
    pub unit_price: Decimal,
    #[schema(value_type = String)]
    pub line_total: Decimal,
    pub in_stock: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CartResponse {
    pub items: Vec<CartLine>,
    #[schema(value_type = String)]
    pub subtotal: Decimal,
}

/// Server-side cart: one row per `(user, product)`.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn get_cart(&self, user_id: Uuid) -> Result<CartResponse, ServiceError> {
        let rows = CartItemEntity::find()
            .filter(cart_item::Column::UserId.eq(user_id))
            .find_also_related(ProductEntity)
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        let items: Vec<CartLine> = rows
            .into_iter()
            .filter_map(|(item, product)| {
                let product = product?;
                let unit_price = round_money(product.price);
                Some(CartLine {
                    product_id: product.id,
                    product_name: product.name,
                    quantity: item.quantity,
                    unit_price,
                    line_total: round_money(unit_price * Decimal::from(item.quantity)),
                    in_stock: product.stock >= item.quantity,
                })
            })
            .collect();
        let subtotal = round_money(items.iter().map(|line| line.line_total).sum());

        Ok(CartResponse { items, subtotal })
    }

    async fn upsert_line<C: ConnectionTrait>(
        conn: &C,
        user_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if ProductEntity::find_by_id(product_id).one(conn).await?.is_none() {
            return Err(ServiceError::NotFound(format!("Product {} not found", product_id)));
        }

        let line = cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            product_id: Set(product_id),
            quantity: Set(quantity),
            created_at: Set(Utc::now()),
        };
        CartItemEntity::insert(line)
            .on_conflict(
                OnConflict::columns([cart_item::Column::UserId, cart_item::Column::ProductId])
                    .update_column(cart_item::Column::Quantity)
                    .to_owned(),
            )
            .exec_without_returning(conn)
            .await?;
        Ok(())
    }

    /// Sets the quantity of a product in the cart.
    #[instrument(skip(self, request), fields(user_id = %user_id, product_id = %request.product_id))]
    pub async fn set_item(
        &self,
        user_id: Uuid,
        request: CartItemRequest,
    ) -> Result<CartResponse, ServiceError> {
        request.validate()?;
        Self::upsert_line(&*self.db, user_id, request.product_id, request.quantity).await?;
        self.get_cart(user_id).await
    }

    pub async fn remove_item(&self, user_id: Uuid, product_id: Uuid) -> Result<CartResponse, ServiceError> {
        CartItemEntity::delete_many()
            .filter(cart_item::Column::UserId.eq(user_id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .exec(&*self.db)
            .await?;
        self.get_cart(user_id).await
    }

    /// Folds a guest cart into the user's cart: union by product, with
    /// quantities summed. Unknown products are skipped.
    #[instrument(skip(self, request), fields(user_id = %user_id, lines = request.items.len()))]
    pub async fn merge(
        &self,
        user_id: Uuid,
        request: MergeCartRequest,
    ) -> Result<CartResponse, ServiceError> {
        request.validate()?;

        let mut incoming: BTreeMap<Uuid, i32> = BTreeMap::new();
        for item in &request.items {
            let entry = incoming.entry(item.product_id).or_insert(0);
            *entry = entry.saturating_add(item.quantity);
        }

        let txn = self.db.begin().await?;
        for (product_id, quantity) in incoming {
            if ProductEntity::find_by_id(product_id).one(&txn).await?.is_none() {
                debug!(%product_id, "guest cart line for unknown product skipped");
                continue;
            }

            let updated = CartItemEntity::update_many()
                .col_expr(
                    cart_item::Column::Quantity,
                    Expr::col(cart_item::Column::Quantity).add(quantity),
                )
                .filter(cart_item::Column::UserId.eq(user_id))
                .filter(cart_item::Column::ProductId.eq(product_id))
                .exec(&txn)
                .await?;
            if updated.rows_affected == 0 {
                Self::upsert_line(&txn, user_id, product_id, quantity.min(MAX_LINE_QUANTITY)).await?;
            }
        }

        CartItemEntity::update_many()
            .col_expr(cart_item::Column::Quantity, Expr::value(MAX_LINE_QUANTITY))
            .filter(cart_item::Column::UserId.eq(user_id))
            .filter(cart_item::Column::Quantity.gt(MAX_LINE_QUANTITY))
            .exec(&txn)
            .await?;
        txn.commit().await?;

        self.get_cart(user_id).await
    }
}
