use axum::{
    extract::{Path, State},
    response::Response,
    routing::{delete, get, post},
    Json, Router,
};
use uuid::Uuid;

use super::common::{created_response, no_content_response};
use crate::{
    auth::{user::Role, AuthRouterExt},
    errors::ServiceError,
    services::coupons::{
        CouponResponse, CouponValidationResponse, CreateCouponRequest, ValidateCouponRequest,
    },
    AppState,
};

/// Preview a coupon against an order total
///
/// Always answers 200; whether the coupon applies is in the body.
#[utoipa::path(
    post,
    path = "/api/coupons/validate",
    request_body = ValidateCouponRequest,
    responses(
        (status = 200, description = "Evaluation result", body = CouponValidationResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Coupons"
)]
pub async fn validate_coupon(
    State(state): State<AppState>,
    Json(request): Json<ValidateCouponRequest>,
) -> Result<Json<CouponValidationResponse>, ServiceError> {
    Ok(Json(state.services.coupons.validate(&request).await?))
}

#[utoipa::path(
    get,
    path = "/api/coupons",
    responses((status = 200, description = "All coupons", body = [CouponResponse])),
    security(("bearer_auth" = [])),
    tag = "Coupons"
)]
pub async fn list_coupons(
    State(state): State<AppState>,
) -> Result<Json<Vec<CouponResponse>>, ServiceError> {
    Ok(Json(state.services.coupons.list().await?))
}

#[utoipa::path(
    post,
    path = "/api/coupons",
    request_body = CreateCouponRequest,
    responses(
        (status = 201, description = "Coupon created", body = CouponResponse),
        (status = 400, description = "Invalid input", body = crate::errors::ErrorResponse),
        (status = 409, description = "Code already exists", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Coupons"
)]
pub async fn create_coupon(
    State(state): State<AppState>,
    Json(request): Json<CreateCouponRequest>,
) -> Result<Response, ServiceError> {
    let coupon = state.services.coupons.create(request).await?;
    Ok(created_response(coupon))
}

#[utoipa::path(
    delete,
    path = "/api/coupons/{id}",
    params(("id" = Uuid, Path, description = "Coupon ID")),
    responses(
        (status = 204, description = "Coupon deleted"),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Coupons"
)]
pub async fn delete_coupon(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    state.services.coupons.delete(id).await?;
    Ok(no_content_response())
}

pub fn coupon_routes() -> Router<AppState> {
    let customer = Router::new()
        .route("/validate", post(validate_coupon))
        .with_auth();

    let admin = Router::new()
        .route("/", get(list_coupons).post(create_coupon))
        .route("/:id", delete(delete_coupon))
        .with_role(Role::Admin);

    customer.merge(admin)
}
