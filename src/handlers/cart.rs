use axum::{
    extract::{Path, State},
    routing::{delete, get, post},
    Json, Router,
};
use uuid::Uuid;

use crate::{
    auth::{AuthRouterExt, AuthUser},
    errors::ServiceError,
    services::cart::{CartItemRequest, CartResponse, MergeCartRequest},
    AppState,
};

#[utoipa::path(
    get,
    path = "/api/cart",
    responses((status = 200, description = "Current cart", body = CartResponse)),
    security(("bearer_auth" = [])),
    tag = "Cart"
)]
pub async fn get_cart(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<CartResponse>, ServiceError> {
    Ok(Json(state.services.cart.get_cart(user.user_id).await?))
}

/// Set the quantity of a product in the cart
#[utoipa::path(
    post,
    path = "/api/cart/items",
    request_body = CartItemRequest,
    responses(
        (status = 200, description = "Updated cart", body = CartResponse),
        (status = 400, description = "Invalid quantity", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown product", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Cart"
)]
pub async fn set_item(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CartItemRequest>,
) -> Result<Json<CartResponse>, ServiceError> {
    Ok(Json(state.services.cart.set_item(user.user_id, request).await?))
}

#[utoipa::path(
    delete,
    path = "/api/cart/items/{product_id}",
    params(("product_id" = Uuid, Path, description = "Product ID")),
    responses((status = 200, description = "Updated cart", body = CartResponse)),
    security(("bearer_auth" = [])),
    tag = "Cart"
)]
pub async fn remove_item(
    State(state): State<AppState>,
    user: AuthUser,
    Path(product_id): Path<Uuid>,
) -> Result<Json<CartResponse>, ServiceError> {
    Ok(Json(
        state.services.cart.remove_item(user.user_id, product_id).await?,
    ))
}

/// Merge a guest cart into the caller's cart
#[utoipa::path(
    post,
    path = "/api/cart/merge",
    request_body = MergeCartRequest,
    responses((status = 200, description = "Merged cart", body = CartResponse)),
    security(("bearer_auth" = [])),
    tag = "Cart"
)]
pub async fn merge_cart(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<MergeCartRequest>,
) -> Result<Json<CartResponse>, ServiceError> {
    Ok(Json(state.services.cart.merge(user.user_id, request).await?))
}

pub fn cart_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(get_cart))
        .route("/items", post(set_item))
        .route("/items/:product_id", delete(remove_item))
        .route("/merge", post(merge_cart))
        .with_auth()
}
