//! Order Assembler
//!
//! Turns a user's cart into an order in one transaction: stock is taken
//! through the stock ledger, the coupon is redeemed by compare-and-swap,
//! the order and its lines are written and the cart is cleared. Any
//! failure drops the transaction and leaves nothing behind.

use std::{collections::HashMap, str::FromStr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::OnConflict, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::AuthUser,
    entities::{
        cart_item::{self, Entity as CartItemEntity},
        order::{self, Entity as OrderEntity, Model as OrderModel, OrderStatus, PaymentMethod, PaymentStatus},
        order_item::{self, Entity as OrderItemEntity, Model as OrderItemModel},
        order_status_history::{self, Entity as HistoryEntity},
        product::Entity as ProductEntity,
        stock_reservation::ReservationStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    money::round_money,
    services::{
        coupons::CouponService,
        idempotency::normalize_key,
        order_status::{cancel_order, publish_all, StatusHistoryEntry},
        stock::{StockLedger, StockLine},
    },
};

const DEFAULT_PAGE_SIZE: u64 = 20;
const MAX_PAGE_SIZE: u64 = 100;

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderRequest {
    #[validate(length(min = 1, max = 500, message = "Shipping address is required"))]
    pub shipping_address: String,
    #[validate(length(min = 1, max = 100, message = "Shipping city is required"))]
    pub shipping_city: String,
    #[validate(length(min = 1, max = 32, message = "Phone is required"))]
    pub phone: String,
    pub coupon_code: Option<String>,
    #[schema(example = "card_a")]
    pub payment_method: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderResponse {
    pub order_id: Uuid,
    #[schema(value_type = String, example = "17.00")]
    pub total: Decimal,
    #[schema(value_type = String)]
    pub subtotal: Decimal,
    #[schema(value_type = String)]
    pub discount_amount: Decimal,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
}

impl From<&OrderModel> for PlaceOrderResponse {
    fn from(order: &OrderModel) -> Self {
        Self {
            order_id: order.id,
            total: round_money(order.total_amount),
            subtotal: round_money(order.subtotal),
            discount_amount: round_money(order.discount_amount),
            status: order.status,
            payment_status: order.payment_status,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemResponse {
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    #[schema(value_type = String)]
    pub unit_price: Decimal,
    #[schema(value_type = String)]
    pub line_total: Decimal,
}

impl From<OrderItemModel> for OrderItemResponse {
    fn from(item: OrderItemModel) -> Self {
        Self {
            line_total: round_money(item.line_total()),
            product_id: item.product_id,
            product_name: item.product_name,
            quantity: item.quantity,
            unit_price: round_money(item.unit_price),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub payment_method: PaymentMethod,
    /// Gateway that settles the order.
    pub payment_provider: String,
    pub payment_intent_id: Option<String>,
    pub coupon_code: Option<String>,
    #[schema(value_type = String)]
    pub subtotal: Decimal,
    #[schema(value_type = String)]
    pub discount_amount: Decimal,
    #[schema(value_type = String)]
    pub total_amount: Decimal,
    pub shipping_address: String,
    pub shipping_city: String,
    pub phone: String,
    pub items: Vec<OrderItemResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderResponse {
    pub fn new(order: OrderModel, items: Vec<OrderItemModel>) -> Self {
        Self {
            id: order.id,
            user_id: order.user_id,
            status: order.status,
            payment_status: order.payment_status,
            payment_method: order.payment_method,
            payment_provider: provider_name(order.payment_method).to_string(),
            payment_intent_id: order.payment_intent_id,
            coupon_code: order.coupon_code,
            subtotal: round_money(order.subtotal),
            discount_amount: round_money(order.discount_amount),
            total_amount: round_money(order.total_amount),
            shipping_address: order.shipping_address,
            shipping_city: order.shipping_city,
            phone: order.phone,
            items: items.into_iter().map(OrderItemResponse::from).collect(),
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

fn provider_name(method: PaymentMethod) -> &'static str {
    match method {
        PaymentMethod::CardA => "card_a",
        PaymentMethod::CardB => "card_b",
        PaymentMethod::Cod => "cash_on_delivery",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderListResponse {
    pub items: Vec<OrderResponse>,
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
    pub total_pages: u64,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct ListOrdersQuery {
    pub page: Option<u64>,
    pub page_size: Option<u64>,
}

impl ListOrdersQuery {
    /// 1-based page and a page size clamped to `1..=100`.
    pub fn normalized(&self) -> (u64, u64) {
        let page = self.page.unwrap_or(1).max(1);
        let page_size = self
            .page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        (page, page_size)
    }
}

pub fn parse_payment_method(raw: &str) -> Result<PaymentMethod, ServiceError> {
    PaymentMethod::from_str(&raw.trim().to_ascii_lowercase()).map_err(|_| {
        ServiceError::ValidationError(format!(
            "Unsupported payment method: {}. Expected card_a, card_b or cod",
            raw.trim()
        ))
    })
}

#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    events: EventSender,
    reservation_ttl: Duration,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>, events: EventSender, reservation_ttl: Duration) -> Self {
        Self {
            db,
            events,
            reservation_ttl,
        }
    }

    async fn find_by_key(
        &self,
        user_id: Uuid,
        key: &str,
    ) -> Result<Option<OrderModel>, ServiceError> {
        Ok(OrderEntity::find()
            .filter(order::Column::UserId.eq(user_id))
            .filter(order::Column::IdempotencyKey.eq(key))
            .one(&*self.db)
            .await?)
    }

    /// Places an order from the user's cart.
    ///
    /// With an idempotency key, a retried placement returns the order the
    /// first attempt created instead of placing another one.
    #[instrument(skip(self, request, idempotency_key), fields(user_id = %user_id))]
    pub async fn place_order(
        &self,
        user_id: Uuid,
        request: PlaceOrderRequest,
        idempotency_key: Option<&str>,
    ) -> Result<PlaceOrderResponse, ServiceError> {
        request.validate()?;
        if request.shipping_address.trim().is_empty()
            || request.shipping_city.trim().is_empty()
            || request.phone.trim().is_empty()
        {
            return Err(ServiceError::ValidationError(
                "Shipping address, city and phone are required".to_string(),
            ));
        }
        let method = parse_payment_method(&request.payment_method)?;
        let key = normalize_key(idempotency_key)?;

        if let Some(key) = key.as_deref() {
            if let Some(existing) = self.find_by_key(user_id, key).await? {
                info!(order_id = %existing.id, "order placement replayed");
                return Ok(PlaceOrderResponse::from(&existing));
            }
        }

        let txn = self.db.begin().await?;

        let cart = CartItemEntity::find()
            .filter(cart_item::Column::UserId.eq(user_id))
            .find_also_related(ProductEntity)
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(&txn)
            .await?;
        if cart.is_empty() {
            return Err(ServiceError::EmptyCart);
        }

        let mut lines = Vec::with_capacity(cart.len());
        let mut priced = Vec::with_capacity(cart.len());
        for (item, product) in cart {
            let product = product.ok_or_else(|| {
                ServiceError::BadRequest(format!("Product {} is no longer available", item.product_id))
            })?;
            lines.push(StockLine {
                product_id: product.id,
                product_name: product.name.clone(),
                quantity: item.quantity,
            });
            priced.push((product, item.quantity));
        }

        StockLedger::check_and_reserve(&txn, &lines).await?;

        let subtotal = round_money(
            priced
                .iter()
                .map(|(product, quantity)| product.price * Decimal::from(*quantity))
                .sum(),
        );

        let applied = match request
            .coupon_code
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty())
        {
            Some(code) => CouponService::redeem(&txn, code, subtotal).await?,
            None => None,
        };
        let discount = applied
            .as_ref()
            .map(|coupon| coupon.discount_amount)
            .unwrap_or(Decimal::ZERO);
        let total = round_money((subtotal - discount).max(Decimal::ZERO));

        let payment_status = match method {
            PaymentMethod::Cod => PaymentStatus::CodPending,
            PaymentMethod::CardA | PaymentMethod::CardB => PaymentStatus::Unpaid,
        };

        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let model = order::ActiveModel {
            id: Set(order_id),
            user_id: Set(user_id),
            subtotal: Set(subtotal),
            discount_amount: Set(round_money(discount)),
            total_amount: Set(total),
            status: Set(OrderStatus::Pending),
            payment_status: Set(payment_status),
            payment_method: Set(method),
            payment_intent_id: Set(None),
            coupon_code: Set(applied.as_ref().map(|coupon| coupon.code.clone())),
            shipping_address: Set(request.shipping_address.trim().to_string()),
            shipping_city: Set(request.shipping_city.trim().to_string()),
            phone: Set(request.phone.trim().to_string()),
            idempotency_key: Set(key.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let inserted = OrderEntity::insert(model)
            .on_conflict(
                OnConflict::columns([order::Column::UserId, order::Column::IdempotencyKey])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&txn)
            .await?;

        if inserted == 0 {
            drop(txn);
            let key = key.unwrap_or_default();
            let existing = self.find_by_key(user_id, &key).await?.ok_or_else(|| {
                ServiceError::Conflict("Order placement with this key is in progress".to_string())
            })?;
            info!(order_id = %existing.id, "concurrent order placement replayed");
            return Ok(PlaceOrderResponse::from(&existing));
        }

        let items = priced.iter().map(|(product, quantity)| order_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            product_id: Set(product.id),
            product_name: Set(product.name.clone()),
            quantity: Set(*quantity),
            unit_price: Set(round_money(product.price)),
        });
        OrderItemEntity::insert_many(items)
            .exec_without_returning(&txn)
            .await?;

        let (reservation_status, expires_at) = match method {
            PaymentMethod::Cod => (ReservationStatus::Consumed, now),
            PaymentMethod::CardA | PaymentMethod::CardB => (
                ReservationStatus::Active,
                now + chrono::Duration::from_std(self.reservation_ttl).map_err(|e| {
                    ServiceError::InternalError(format!("invalid reservation ttl: {}", e))
                })?,
            ),
        };
        StockLedger::record_reservations(&txn, order_id, &lines, reservation_status, expires_at)
            .await?;

        CartItemEntity::delete_many()
            .filter(cart_item::Column::UserId.eq(user_id))
            .exec(&txn)
            .await?;

        txn.commit().await?;

        counter!("shopwave_orders_placed_total", 1);
        info!(%order_id, %subtotal, %discount, %total, payment_method = %method, "order placed");
        self.events.publish(Event::OrderPlaced {
            order_id,
            user_id,
            total,
            payment_method: method,
        });

        Ok(PlaceOrderResponse {
            order_id,
            total,
            subtotal,
            discount_amount: round_money(discount),
            status: OrderStatus::Pending,
            payment_status,
        })
    }

    async fn load_visible(&self, user: &AuthUser, order_id: Uuid) -> Result<OrderModel, ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        if order.user_id != user.user_id && !user.is_admin() {
            return Err(ServiceError::Forbidden(
                "You do not have access to this order".to_string(),
            ));
        }
        Ok(order)
    }

    #[instrument(skip(self, user), fields(order_id = %order_id))]
    pub async fn get_order(&self, user: &AuthUser, order_id: Uuid) -> Result<OrderResponse, ServiceError> {
        let order = self.load_visible(user, order_id).await?;
        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .all(&*self.db)
            .await?;
        Ok(OrderResponse::new(order, items))
    }

    /// Newest first. Admins see every order, customers their own.
    #[instrument(skip(self, user, query))]
    pub async fn list_orders(
        &self,
        user: &AuthUser,
        query: &ListOrdersQuery,
    ) -> Result<OrderListResponse, ServiceError> {
        let (page, page_size) = query.normalized();

        let mut select = OrderEntity::find();
        if !user.is_admin() {
            select = select.filter(order::Column::UserId.eq(user.user_id));
        }
        let paginator = select
            .order_by_desc(order::Column::CreatedAt)
            .order_by_desc(order::Column::Id)
            .paginate(&*self.db, page_size);

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page - 1).await?;

        let ids: Vec<Uuid> = orders.iter().map(|o| o.id).collect();
        let mut items_by_order: HashMap<Uuid, Vec<OrderItemModel>> = HashMap::new();
        if !ids.is_empty() {
            for item in OrderItemEntity::find()
                .filter(order_item::Column::OrderId.is_in(ids))
                .all(&*self.db)
                .await?
            {
                items_by_order.entry(item.order_id).or_default().push(item);
            }
        }

        let items = orders
            .into_iter()
            .map(|order| {
                let lines = items_by_order.remove(&order.id).unwrap_or_default();
                OrderResponse::new(order, lines)
            })
            .collect();

        Ok(OrderListResponse {
            items,
            total,
            page,
            page_size,
            total_pages: total.div_ceil(page_size),
        })
    }

    pub async fn history(
        &self,
        user: &AuthUser,
        order_id: Uuid,
    ) -> Result<Vec<StatusHistoryEntry>, ServiceError> {
        self.load_visible(user, order_id).await?;
        let entries = HistoryEntity::find()
            .filter(order_status_history::Column::OrderId.eq(order_id))
            .order_by_asc(order_status_history::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        Ok(entries.into_iter().map(StatusHistoryEntry::from).collect())
    }

    /// Owner cancellation of an order that has not been paid. Reserved and
    /// consumed units go back to stock.
    #[instrument(skip(self, user), fields(order_id = %order_id, user_id = %user.user_id))]
    pub async fn cancel_own_order(
        &self,
        user: &AuthUser,
        order_id: Uuid,
    ) -> Result<OrderResponse, ServiceError> {
        let txn = self.db.begin().await?;
        let order = OrderEntity::find_by_id(order_id)
            .one(&txn)
            .await?
            .filter(|order| order.user_id == user.user_id || user.is_admin())
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let unpaid = matches!(
            order.payment_status,
            PaymentStatus::Unpaid | PaymentStatus::Pending | PaymentStatus::CodPending | PaymentStatus::Failed
        );
        if !unpaid || !matches!(order.status, OrderStatus::Pending | OrderStatus::PaymentFailed) {
            return Err(ServiceError::BadRequest(
                "Only unpaid pending orders can be cancelled".to_string(),
            ));
        }

        let mut events = Vec::new();
        let (cancelled, _) = cancel_order(
            &txn,
            &order,
            &user.user_id.to_string(),
            Some("cancelled by customer".to_string()),
            true,
            &mut events,
        )
        .await?;

        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&txn)
            .await?;
        txn.commit().await?;
        publish_all(&self.events, events);

        Ok(OrderResponse::new(cancelled, items))
    }
}
