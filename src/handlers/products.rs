use axum::{
    extract::{Path, State},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;
use validator::Validate;

use super::common::created_response;
use crate::{
    auth::{user::Role, AuthRouterExt},
    errors::ServiceError,
    services::products::{CreateProductRequest, ProductResponse, RestockRequest},
    AppState,
};

#[utoipa::path(
    get,
    path = "/api/products/{id}",
    params(("id" = Uuid, Path, description = "Product ID")),
    responses(
        (status = 200, description = "Product", body = ProductResponse),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Products"
)]
pub async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ProductResponse>, ServiceError> {
    Ok(Json(state.services.products.get(id).await?))
}

#[utoipa::path(
    post,
    path = "/api/products",
    request_body = CreateProductRequest,
    responses(
        (status = 201, description = "Product created", body = ProductResponse),
        (status = 400, description = "Invalid input", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Products"
)]
pub async fn create_product(
    State(state): State<AppState>,
    Json(request): Json<CreateProductRequest>,
) -> Result<Response, ServiceError> {
    let product = state.services.products.create(request).await?;
    Ok(created_response(product))
}

/// Add units to a product's stock
#[utoipa::path(
    post,
    path = "/api/products/{id}/restock",
    params(("id" = Uuid, Path, description = "Product ID")),
    request_body = RestockRequest,
    responses(
        (status = 200, description = "Updated product", body = ProductResponse),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Products"
)]
pub async fn restock_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<RestockRequest>,
) -> Result<Json<ProductResponse>, ServiceError> {
    request.validate()?;
    Ok(Json(
        state.services.products.restock(id, request.quantity).await?,
    ))
}

pub fn product_routes() -> Router<AppState> {
    let public = Router::new().route("/:id", get(get_product));

    let admin = Router::new()
        .route("/", post(create_product))
        .route("/:id/restock", post(restock_product))
        .with_role(Role::Admin);

    public.merge(admin)
}
