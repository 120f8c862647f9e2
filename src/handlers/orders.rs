use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Response,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use super::common::{created_response, idempotency_key};
use crate::{
    auth::{user::Role, AuthRouterExt, AuthUser},
    errors::ServiceError,
    services::{
        order_status::StatusHistoryEntry,
        orders::{ListOrdersQuery, OrderListResponse, OrderResponse, PlaceOrderRequest, PlaceOrderResponse},
    },
    AppState,
};

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
#[schema(example = json!({"status": "Shipped", "note": "handed to courier"}))]
pub struct UpdateOrderStatusRequest {
    #[validate(length(min = 1, max = 32))]
    pub status: String,
    #[validate(length(max = 500))]
    pub note: Option<String>,
}

/// Place an order from the caller's cart
#[utoipa::path(
    post,
    path = "/api/orders",
    request_body = PlaceOrderRequest,
    params(
        ("X-Idempotency-Key" = Option<String>, Header, description = "Retries with the same key return the original order")
    ),
    responses(
        (status = 201, description = "Order placed", body = PlaceOrderResponse),
        (status = 400, description = "Empty cart, insufficient stock or invalid input", body = crate::errors::ErrorResponse),
        (status = 401, description = "Not authenticated")
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn place_order(
    State(state): State<AppState>,
    user: AuthUser,
    headers: HeaderMap,
    Json(request): Json<PlaceOrderRequest>,
) -> Result<Response, ServiceError> {
    let key = idempotency_key(&headers)?;
    let placed = state
        .services
        .orders
        .place_order(user.user_id, request, key.as_deref())
        .await?;
    Ok(created_response(placed))
}

/// List orders, newest first
#[utoipa::path(
    get,
    path = "/api/orders",
    params(ListOrdersQuery),
    responses(
        (status = 200, description = "Page of orders with their items", body = OrderListResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ListOrdersQuery>,
) -> Result<Json<OrderListResponse>, ServiceError> {
    Ok(Json(state.services.orders.list_orders(&user, &query).await?))
}

/// Get one order
#[utoipa::path(
    get,
    path = "/api/orders/{id}",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order details", body = OrderResponse),
        (status = 403, description = "Order belongs to another user", body = crate::errors::ErrorResponse),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<OrderResponse>, ServiceError> {
    Ok(Json(state.services.orders.get_order(&user, id).await?))
}

/// Status history of an order, oldest first
#[utoipa::path(
    get,
    path = "/api/orders/{id}/history",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "History entries", body = [StatusHistoryEntry]),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn order_history(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<StatusHistoryEntry>>, ServiceError> {
    Ok(Json(state.services.orders.history(&user, id).await?))
}

/// Cancel an unpaid order
#[utoipa::path(
    post,
    path = "/api/orders/{id}/cancel",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order cancelled", body = OrderResponse),
        (status = 400, description = "Order can no longer be cancelled", body = crate::errors::ErrorResponse),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn cancel_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<OrderResponse>, ServiceError> {
    Ok(Json(state.services.orders.cancel_own_order(&user, id).await?))
}

/// Move an order to a new status (admin)
#[utoipa::path(
    put,
    path = "/api/orders/{id}/status",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = UpdateOrderStatusRequest,
    responses(
        (status = 200, description = "Order updated", body = OrderResponse),
        (status = 400, description = "Unknown status or transition not allowed", body = crate::errors::ErrorResponse),
        (status = 403, description = "Admin role required"),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateOrderStatusRequest>,
) -> Result<Json<OrderResponse>, ServiceError> {
    request.validate()?;
    state
        .services
        .order_status
        .update_status(id, &request.status, &user.user_id.to_string(), request.note)
        .await?;
    Ok(Json(state.services.orders.get_order(&user, id).await?))
}

pub fn order_routes() -> Router<AppState> {
    let customer = Router::new()
        .route("/", post(place_order).get(list_orders))
        .route("/:id", get(get_order))
        .route("/:id/history", get(order_history))
        .route("/:id/cancel", post(cancel_order))
        .with_auth();

    let admin = Router::new()
        .route("/:id/status", put(update_order_status))
        .with_role(Role::Admin);

    customer.merge(admin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_request_requires_a_value() {
        let request = UpdateOrderStatusRequest {
            status: String::new(),
            note: None,
        };
        assert!(request.validate().is_err());

        let request: UpdateOrderStatusRequest =
            serde_json::from_str(r#"{"status":"Shipped"}"#).unwrap();
        assert!(request.validate().is_ok());
        assert!(request.note.is_none());
    }
}
