use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ActiveValue::Set,
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::coupon::{self, Entity as CouponEntity, Model as CouponModel},
    errors::ServiceError,
    money::{percent_of, round_money},
};

/// Outcome of evaluating a coupon against an order subtotal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CouponEvaluation {
    pub applicable: bool,
    pub reason: String,
    pub discount_percent: i32,
    pub discount_amount: Decimal,
}

impl CouponEvaluation {
    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            applicable: false,
            reason: reason.into(),
            discount_percent: 0,
            discount_amount: round_money(Decimal::ZERO),
        }
    }
}

/// Decides whether `coupon` applies to an order of `subtotal` at `now`.
///
/// The discount is `subtotal * percent / 100`, capped by `max_discount` and
/// never larger than the subtotal itself. Pure: nothing is written.
pub fn evaluate(
    coupon: Option<&CouponModel>,
    subtotal: Decimal,
    now: DateTime<Utc>,
) -> CouponEvaluation {
    let Some(coupon) = coupon else {
        return CouponEvaluation::rejected("Invalid coupon code");
    };
    if !coupon.is_active {
        return CouponEvaluation::rejected("Coupon is inactive");
    }
    if coupon.expires_at.is_some_and(|expires_at| expires_at <= now) {
        return CouponEvaluation::rejected("Coupon has expired");
    }
    if coupon.times_used >= coupon.usage_limit {
        return CouponEvaluation::rejected("Coupon usage limit reached");
    }
    if let Some(min) = coupon.min_order_amount {
        if subtotal < min {
            return CouponEvaluation::rejected(format!(
                "Minimum order amount is ${}",
                round_money(min)
            ));
        }
    }

    let subtotal = subtotal.max(Decimal::ZERO);
    let mut discount = percent_of(subtotal, coupon.discount_percent);
    if let Some(cap) = coupon.max_discount {
        discount = discount.min(round_money(cap));
    }
    discount = round_money(discount.min(subtotal).max(Decimal::ZERO));

    CouponEvaluation {
        applicable: true,
        reason: format!("{}% discount applied!", coupon.discount_percent),
        discount_percent: coupon.discount_percent,
        discount_amount: discount,
    }
}

/// Codes are case-insensitive and stored upper-cased.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// A coupon that was redeemed as part of an order.
#[derive(Debug, Clone)]
pub struct AppliedCoupon {
    pub code: String,
    pub discount_amount: Decimal,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValidateCouponRequest {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    #[schema(value_type = String, example = "20.00")]
    pub order_total: Decimal,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CouponValidationResponse {
    pub is_valid: bool,
    pub message: String,
    pub discount_percent: i32,
    #[schema(value_type = String, example = "3.00")]
    pub discount_amount: Decimal,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateCouponRequest {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    #[validate(range(min = 1, max = 100))]
    pub discount_percent: i32,
    #[schema(value_type = Option<String>)]
    pub max_discount: Option<Decimal>,
    #[schema(value_type = Option<String>)]
    pub min_order_amount: Option<Decimal>,
    #[validate(range(min = 1))]
    pub usage_limit: i32,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CouponResponse {
    pub id: Uuid,
    pub code: String,
    pub discount_percent: i32,
    #[schema(value_type = Option<String>)]
    pub max_discount: Option<Decimal>,
    #[schema(value_type = Option<String>)]
    pub min_order_amount: Option<Decimal>,
    pub is_active: bool,
    pub usage_limit: i32,
    pub times_used: i32,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<CouponModel> for CouponResponse {
    fn from(model: CouponModel) -> Self {
        Self {
            id: model.id,
            code: model.code,
            discount_percent: model.discount_percent,
            max_discount: model.max_discount.map(round_money),
            min_order_amount: model.min_order_amount.map(round_money),
            is_active: model.is_active,
            usage_limit: model.usage_limit,
            times_used: model.times_used,
            expires_at: model.expires_at,
            created_at: model.created_at,
        }
    }
}

#[derive(Clone)]
pub struct CouponService {
    db: Arc<DatabaseConnection>,
}

impl CouponService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    async fn find_by_code<C: ConnectionTrait>(
        conn: &C,
        code: &str,
    ) -> Result<Option<CouponModel>, ServiceError> {
        Ok(CouponEntity::find()
            .filter(coupon::Column::Code.eq(normalize_code(code)))
            .one(conn)
            .await?)
    }

    /// Read-only preview used by the checkout page.
    #[instrument(skip(self, request), fields(code = %request.code))]
    pub async fn validate(
        &self,
        request: &ValidateCouponRequest,
    ) -> Result<CouponValidationResponse, ServiceError> {
        let coupon = Self::find_by_code(&*self.db, &request.code).await?;
        let evaluation = evaluate(coupon.as_ref(), request.order_total, Utc::now());
        Ok(CouponValidationResponse {
            is_valid: evaluation.applicable,
            message: evaluation.reason,
            discount_percent: evaluation.discount_percent,
            discount_amount: evaluation.discount_amount,
        })
    }

    /// Evaluates and consumes one use of the coupon on `conn`, normally the
    /// order transaction. The usage counter moves by a compare-and-swap, so
    /// concurrent redemptions of the last slot cannot both succeed. Returns
    /// `None` when the coupon does not apply or the slot was lost.
    pub async fn redeem<C: ConnectionTrait>(
        conn: &C,
        code: &str,
        subtotal: Decimal,
    ) -> Result<Option<AppliedCoupon>, ServiceError> {
        let coupon = Self::find_by_code(conn, code).await?;
        let evaluation = evaluate(coupon.as_ref(), subtotal, Utc::now());
        let Some(coupon) = coupon.filter(|_| evaluation.applicable) else {
            info!(code = %normalize_code(code), reason = %evaluation.reason, "coupon ignored at checkout");
            return Ok(None);
        };

        let result = CouponEntity::update_many()
            .col_expr(
                coupon::Column::TimesUsed,
                Expr::col(coupon::Column::TimesUsed).add(1),
            )
            .filter(coupon::Column::Id.eq(coupon.id))
            .filter(coupon::Column::IsActive.eq(true))
            .filter(Expr::col(coupon::Column::TimesUsed).lt(Expr::col(coupon::Column::UsageLimit)))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            counter!("shopwave_coupon_redemption_lost_total", 1);
            info!(code = %coupon.code, "coupon usage limit reached concurrently");
            return Ok(None);
        }

        Ok(Some(AppliedCoupon {
            code: coupon.code,
            discount_amount: evaluation.discount_amount,
        }))
    }

    pub async fn list(&self) -> Result<Vec<CouponResponse>, ServiceError> {
        let coupons = CouponEntity::find()
            .order_by_desc(coupon::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        Ok(coupons.into_iter().map(CouponResponse::from).collect())
    }

    #[instrument(skip(self, request), fields(code = %request.code))]
    pub async fn create(&self, request: CreateCouponRequest) -> Result<CouponResponse, ServiceError> {
        request.validate()?;
        if request.max_discount.is_some_and(|cap| cap <= Decimal::ZERO) {
            return Err(ServiceError::ValidationError(
                "maxDiscount must be positive".to_string(),
            ));
        }
        if request.min_order_amount.is_some_and(|min| min < Decimal::ZERO) {
            return Err(ServiceError::ValidationError(
                "minOrderAmount cannot be negative".to_string(),
            ));
        }

        let code = normalize_code(&request.code);
        let model = coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.clone()),
            discount_percent: Set(request.discount_percent),
            max_discount: Set(request.max_discount.map(round_money)),
            min_order_amount: Set(request.min_order_amount.map(round_money)),
            is_active: Set(request.is_active),
            usage_limit: Set(request.usage_limit),
            times_used: Set(0),
            expires_at: Set(request.expires_at),
            created_at: Set(Utc::now()),
        };

        let inserted = CouponEntity::insert(model)
            .on_conflict(
                OnConflict::column(coupon::Column::Code)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;
        if inserted == 0 {
            return Err(ServiceError::Conflict("Coupon code already exists".to_string()));
        }

        let created = Self::find_by_code(&*self.db, &code)
            .await?
            .ok_or_else(|| ServiceError::InternalError("coupon vanished after insert".to_string()))?;
        info!(coupon_id = %created.id, "coupon created");
        Ok(created.into())
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), ServiceError> {
        let result = CouponEntity::delete_by_id(id).exec(&*self.db).await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!("Coupon {} not found", id)));
        }
        Ok(())
    }
}
