mod common;

use axum::http::{Method, StatusCode};
use common::{body_json, TestApp, TestUser};
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

async fn cod_order(app: &TestApp, user: &TestUser) -> (Uuid, Uuid) {
    let product = app.seed_product("Bookshelf", dec!(120.00), 4).await;
    app.add_to_cart(user.id, product, 2).await;
    let placed = body_json(app.place_order(user, "cod", None).await).await;
    (placed["orderId"].as_str().unwrap().parse().unwrap(), product)
}

async fn set_status(app: &TestApp, token: &str, order_id: Uuid, status: &str) -> axum::response::Response {
    app.request(
        Method::PUT,
        &format!("/api/orders/{}/status", order_id),
        Some(json!({"status": status, "note": "warehouse update"})),
        Some(token),
    )
    .await
}

#[tokio::test]
async fn admin_walks_cod_order_to_delivery() {
    let app = TestApp::new().await;
    let admin = app.admin().await;
    let user = app.register("cod-walk@example.com").await;
    let (order_id, _) = cod_order(&app, &user).await;

    for status in ["Processing", "shipped", "DELIVERED"] {
        let response = set_status(&app, &admin.token, order_id, status).await;
        assert_eq!(response.status(), StatusCode::OK, "moving to {}", status);
    }

    let order = body_json(
        app.request(Method::GET, &format!("/api/orders/{}", order_id), None, Some(&user.token))
            .await,
    )
    .await;
    assert_eq!(order["status"], "Delivered");
    assert_eq!(order["paymentStatus"], "COD_Delivered");

    let history = body_json(
        app.request(
            Method::GET,
            &format!("/api/orders/{}/history", order_id),
            None,
            Some(&user.token),
        )
        .await,
    )
    .await;
    let transitions: Vec<(String, String)> = history
        .as_array()
        .unwrap()
        .iter()
        .filter(|entry| entry["axis"] == "order")
        .map(|entry| {
            (
                entry["fromStatus"].as_str().unwrap().to_string(),
                entry["toStatus"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            ("Pending".to_string(), "Processing".to_string()),
            ("Processing".to_string(), "Shipped".to_string()),
            ("Shipped".to_string(), "Delivered".to_string()),
        ]
    );
}

#[tokio::test]
async fn terminal_states_reject_further_moves() {
    let app = TestApp::new().await;
    let admin = app.admin().await;
    let user = app.register("terminal@example.com").await;
    let (order_id, product) = cod_order(&app, &user).await;
    assert_eq!(app.product_stock(product).await, 2);

    let cancelled = set_status(&app, &admin.token, order_id, "Cancelled").await;
    assert_eq!(cancelled.status(), StatusCode::OK);
    assert_eq!(app.product_stock(product).await, 4);

    let reopened = set_status(&app, &admin.token, order_id, "Processing").await;
    assert_eq!(reopened.status(), StatusCode::BAD_REQUEST);

    // Same-state update is a no-op, not an error.
    let again = set_status(&app, &admin.token, order_id, "Cancelled").await;
    assert_eq!(again.status(), StatusCode::OK);
    assert_eq!(app.product_stock(product).await, 4);
}

#[tokio::test]
async fn status_changes_are_admin_only_and_validated() {
    let app = TestApp::new().await;
    let admin = app.admin().await;
    let user = app.register("not-admin@example.com").await;
    let (order_id, _) = cod_order(&app, &user).await;

    let forbidden = set_status(&app, &user.token, order_id, "Processing").await;
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

    let unknown = set_status(&app, &admin.token, order_id, "Teleported").await;
    assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);

    let skipped = set_status(&app, &admin.token, order_id, "Delivered").await;
    assert_eq!(skipped.status(), StatusCode::BAD_REQUEST);

    let missing = set_status(&app, &admin.token, Uuid::new_v4(), "Processing").await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn customer_can_cancel_only_before_fulfilment() {
    let app = TestApp::new().await;
    let admin = app.admin().await;
    let user = app.register("cancel@example.com").await;

    let (first, product) = cod_order(&app, &user).await;
    let response = app
        .request(
            Method::POST,
            &format!("/api/orders/{}/cancel", first),
            None,
            Some(&user.token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "Cancelled");
    assert_eq!(app.product_stock(product).await, 4);

    let (second, _) = cod_order(&app, &user).await;
    set_status(&app, &admin.token, second, "Processing").await;
    let late = app
        .request(
            Method::POST,
            &format!("/api/orders/{}/cancel", second),
            None,
            Some(&user.token),
        )
        .await;
    assert_eq!(late.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admin_sees_every_order() {
    let app = TestApp::new().await;
    let admin = app.admin().await;
    let alice = app.register("alice@example.com").await;
    let bob = app.register("bob@example.com").await;
    cod_order(&app, &alice).await;
    cod_order(&app, &bob).await;

    let own = body_json(
        app.request(Method::GET, "/api/orders", None, Some(&alice.token))
            .await,
    )
    .await;
    assert_eq!(own["total"], 1);

    let all = body_json(
        app.request(Method::GET, "/api/orders?page=1&pageSize=10", None, Some(&admin.token))
            .await,
    )
    .await;
    assert_eq!(all["total"], 2);
    assert_eq!(all["items"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn processing_order_keeps_its_units_after_hold_expiry() {
    let app = TestApp::with_config(|cfg| cfg.reservation_ttl_secs = 0).await;
    let admin = app.admin().await;
    let user = app.register("fulfil-unpaid@example.com").await;
    let product = app.seed_product("Only One", dec!(40.00), 1).await;
    app.add_to_cart(user.id, product, 1).await;
    let placed = body_json(app.place_order(&user, "card_a", None).await).await;
    let order_id: Uuid = placed["orderId"].as_str().unwrap().parse().unwrap();
    assert_eq!(app.product_stock(product).await, 0);

    let response = set_status(&app, &admin.token, order_id, "Processing").await;
    assert_eq!(response.status(), StatusCode::OK);

    let report = app.state.services.maintenance.run_once().await;
    assert_eq!(report.reservations_released, 0);
    assert_eq!(report.orders_cancelled, 0);
    assert_eq!(app.product_stock(product).await, 0);

    let order = body_json(
        app.request(Method::GET, &format!("/api/orders/{}", order_id), None, Some(&user.token))
            .await,
    )
    .await;
    assert_eq!(order["status"], "Processing");
}

#[tokio::test]
async fn refunding_undelivered_cod_order_restocks() {
    let app = TestApp::new().await;
    let admin = app.admin().await;
    let user = app.register("cod-refund@example.com").await;
    let (order_id, product) = cod_order(&app, &user).await;
    assert_eq!(app.product_stock(product).await, 2);

    let response = set_status(&app, &admin.token, order_id, "Refunded").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "Refunded");
    assert_eq!(app.product_stock(product).await, 4);
}
