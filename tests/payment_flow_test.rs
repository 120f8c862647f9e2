mod common;

use std::time::Duration;

use axum::http::{Method, StatusCode};
use chrono::Utc;
use common::{body_bytes, body_json, sign_card_a, sign_card_b, TestApp, TestUser};
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

async fn card_app(server: &MockServer) -> TestApp {
    let base = server.uri();
    TestApp::with_config(move |cfg| {
        cfg.card_a_api_base = base.clone();
        cfg.card_a_secret_key = Some("sk_test_card_a".to_string());
        cfg.card_b_api_base = base;
        cfg.card_b_api_key = Some("card_b_key".to_string());
    })
    .await
}

async fn order_with_card(app: &TestApp, user: &TestUser, method: &str, stock: i32) -> (Uuid, Uuid) {
    let product = app.seed_product("Headphones", dec!(79.99), stock).await;
    app.add_to_cart(user.id, product, 1).await;
    let response = app.place_order(user, method, None).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["paymentStatus"], "Unpaid");
    let order_id = body["orderId"].as_str().unwrap().parse().unwrap();
    (order_id, product)
}

fn card_a_event(event_id: &str, event_type: &str, order_id: Uuid) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": event_id,
        "type": event_type,
        "data": {"object": {"metadata": {"order_id": order_id.to_string()}}}
    }))
    .unwrap()
}

async fn order_json(app: &TestApp, user: &TestUser, order_id: Uuid) -> serde_json::Value {
    let response = app
        .request(Method::GET, &format!("/api/orders/{}", order_id), None, Some(&user.token))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

#[tokio::test]
async fn checkout_retry_replays_the_first_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/checkout/sessions"))
        .and(header("authorization", "Bearer sk_test_card_a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cs_test_123",
            "url": "https://pay.example.test/cs_test_123"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = card_app(&server).await;
    let user = app.register("checkout@example.com").await;
    let (order_id, _) = order_with_card(&app, &user, "card_a", 2).await;

    let request = json!({"orderId": order_id});
    let headers = [("x-idempotency-key", "checkout-attempt-7")];

    let first = app
        .request_with_headers(
            Method::POST,
            "/api/payment/create-checkout-session",
            Some(request.clone()),
            Some(&user.token),
            &headers,
        )
        .await;
    assert_eq!(first.status(), StatusCode::OK);
    assert!(first.headers().get("idempotent-replayed").is_none());
    let first_body = body_bytes(first).await;

    let second = app
        .request_with_headers(
            Method::POST,
            "/api/payment/create-checkout-session",
            Some(request),
            Some(&user.token),
            &headers,
        )
        .await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers()["idempotent-replayed"], "true");
    let second_body = body_bytes(second).await;

    assert_eq!(first_body, second_body);
    let session: serde_json::Value = serde_json::from_slice(&first_body).unwrap();
    assert_eq!(session["sessionId"], "cs_test_123");

    let order = order_json(&app, &user, order_id).await;
    assert_eq!(order["paymentStatus"], "Pending");
    assert_eq!(order["paymentIntentId"], "cs_test_123");
}

#[tokio::test]
async fn concurrent_checkout_with_one_key_calls_the_provider_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/checkout/sessions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "id": "cs_concurrent",
                    "url": "https://pay.example.test/cs_concurrent"
                }))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let app = card_app(&server).await;
    let user = app.register("double-click@example.com").await;
    let (order_id, _) = order_with_card(&app, &user, "card_a", 1).await;
    let headers = [("x-idempotency-key", "double-click")];

    let (first, second) = tokio::join!(
        app.request_with_headers(
            Method::POST,
            "/api/payment/create-checkout-session",
            Some(json!({"orderId": order_id})),
            Some(&user.token),
            &headers,
        ),
        app.request_with_headers(
            Method::POST,
            "/api/payment/create-checkout-session",
            Some(json!({"orderId": order_id})),
            Some(&user.token),
            &headers,
        )
    );
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::OK);

    let replayed = [&first, &second]
        .iter()
        .filter(|response| response.headers().get("idempotent-replayed").is_some())
        .count();
    assert_eq!(replayed, 1);

    let first_body = body_bytes(first).await;
    let second_body = body_bytes(second).await;
    assert_eq!(first_body, second_body);
}

#[tokio::test]
async fn late_failure_webhook_does_not_restock_an_order_in_fulfilment() {
    let server = MockServer::start().await;
    let app = card_app(&server).await;
    let admin = app.admin().await;
    let user = app.register("late-failure@example.com").await;
    let (order_id, product) = order_with_card(&app, &user, "card_a", 1).await;
    assert_eq!(app.product_stock(product).await, 0);

    let moved = app
        .request(
            Method::PUT,
            &format!("/api/orders/{}/status", order_id),
            Some(json!({"status": "Processing"})),
            Some(&admin.token),
        )
        .await;
    assert_eq!(moved.status(), StatusCode::OK);

    let payload = card_a_event("evt_late_fail", "payment_intent.payment_failed", order_id);
    let response = app
        .webhook("card_a", &payload, &sign_card_a(&payload, Utc::now().timestamp()))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let order = order_json(&app, &user, order_id).await;
    assert_eq!(order["status"], "Processing");
    assert_eq!(order["paymentStatus"], "Failed");
    assert_eq!(app.product_stock(product).await, 0);
}

#[tokio::test]
async fn provider_outage_is_a_bad_gateway_and_can_be_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/checkout/sessions"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/checkout/sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cs_after_retry",
            "url": "https://pay.example.test/cs_after_retry"
        })))
        .mount(&server)
        .await;

    let app = card_app(&server).await;
    let user = app.register("outage@example.com").await;
    let (order_id, _) = order_with_card(&app, &user, "card_a", 1).await;
    let headers = [("x-idempotency-key", "retry-after-outage")];

    let failed = app
        .request_with_headers(
            Method::POST,
            "/api/payment/create-checkout-session",
            Some(json!({"orderId": order_id})),
            Some(&user.token),
            &headers,
        )
        .await;
    assert_eq!(failed.status(), StatusCode::BAD_GATEWAY);

    let retried = app
        .request_with_headers(
            Method::POST,
            "/api/payment/create-checkout-session",
            Some(json!({"orderId": order_id})),
            Some(&user.token),
            &headers,
        )
        .await;
    assert_eq!(retried.status(), StatusCode::OK);
    assert!(retried.headers().get("idempotent-replayed").is_none());
    assert_eq!(body_json(retried).await["sessionId"], "cs_after_retry");
}

#[tokio::test]
async fn card_b_checkout_returns_a_payment_link() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/payment-links"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 48213,
            "url": "https://pay.example.test/link/48213"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = card_app(&server).await;
    let user = app.register("link@example.com").await;
    let (order_id, _) = order_with_card(&app, &user, "card_b", 1).await;

    let response = app
        .request(
            Method::POST,
            "/api/payment/create-checkout-session",
            Some(json!({"orderId": order_id})),
            Some(&user.token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let session = body_json(response).await;
    assert_eq!(session["sessionId"], "48213");
    assert_eq!(session["url"], "https://pay.example.test/link/48213");
}

#[tokio::test]
async fn repeated_success_webhook_is_applied_once() {
    let server = MockServer::start().await;
    let app = card_app(&server).await;
    let user = app.register("paid@example.com").await;
    let (order_id, product) = order_with_card(&app, &user, "card_a", 3).await;

    let payload = card_a_event("evt_paid_1", "checkout.session.completed", order_id);
    let signature = sign_card_a(&payload, Utc::now().timestamp());

    let mut duplicates = 0;
    for _ in 0..4 {
        let response = app.webhook("card_a", &payload, &signature).await;
        assert_eq!(response.status(), StatusCode::OK);
        if body_json(response).await["duplicate"] == true {
            duplicates += 1;
        }
    }
    assert_eq!(duplicates, 3);

    let order = order_json(&app, &user, order_id).await;
    assert_eq!(order["paymentStatus"], "Paid");
    assert_eq!(order["status"], "Pending");
    assert_eq!(app.product_stock(product).await, 2);

    let history = app
        .request(
            Method::GET,
            &format!("/api/orders/{}/history", order_id),
            None,
            Some(&user.token),
        )
        .await;
    let history = body_json(history).await;
    let paid_entries = history
        .as_array()
        .unwrap()
        .iter()
        .filter(|entry| entry["toStatus"] == "Paid")
        .count();
    assert_eq!(paid_entries, 1);
}

#[tokio::test]
async fn failed_payment_releases_the_hold() {
    let server = MockServer::start().await;
    let app = card_app(&server).await;
    let user = app.register("declined@example.com").await;
    let (order_id, product) = order_with_card(&app, &user, "card_b", 1).await;
    assert_eq!(app.product_stock(product).await, 0);

    let payload = serde_json::to_vec(&json!({
        "id": 99120,
        "type": "TRANSACTION_FAILED",
        "obj": {"order_id": order_id.to_string()}
    }))
    .unwrap();
    let response = app
        .webhook("card_b", &payload, &sign_card_b(&payload))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let order = order_json(&app, &user, order_id).await;
    assert_eq!(order["paymentStatus"], "Failed");
    assert_eq!(order["status"], "PaymentFailed");
    assert_eq!(app.product_stock(product).await, 1);
}

#[tokio::test]
async fn forged_or_stale_signatures_are_rejected() {
    let server = MockServer::start().await;
    let app = card_app(&server).await;
    let user = app.register("forged@example.com").await;
    let (order_id, _) = order_with_card(&app, &user, "card_a", 1).await;
    let payload = card_a_event("evt_forged", "checkout.session.completed", order_id);

    let forged = app.webhook("card_a", &payload, "t=1,v1=deadbeef").await;
    assert_eq!(forged.status(), StatusCode::BAD_REQUEST);

    let stale = sign_card_a(&payload, Utc::now().timestamp() - 3600);
    let stale = app.webhook("card_a", &payload, &stale).await;
    assert_eq!(stale.status(), StatusCode::BAD_REQUEST);

    let unknown = app.webhook("paypal", &payload, "sig").await;
    assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);

    let order = order_json(&app, &user, order_id).await;
    assert_eq!(order["paymentStatus"], "Unpaid");
}

#[tokio::test]
async fn provider_alias_routes_to_card_a() {
    let server = MockServer::start().await;
    let app = card_app(&server).await;
    let user = app.register("alias@example.com").await;
    let (order_id, _) = order_with_card(&app, &user, "stripe", 1).await;

    let payload = card_a_event("evt_alias", "payment_intent.succeeded", order_id);
    let response = app
        .webhook("stripe", &payload, &sign_card_a(&payload, Utc::now().timestamp()))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["duplicate"], false);

    let order = order_json(&app, &user, order_id).await;
    assert_eq!(order["paymentMethod"], "card_a");
    assert_eq!(order["paymentStatus"], "Paid");
}

#[tokio::test]
async fn expired_hold_cancels_the_unpaid_order() {
    let app = TestApp::with_config(|cfg| cfg.reservation_ttl_secs = 0).await;
    let user = app.register("slow@example.com").await;
    let (order_id, product) = order_with_card(&app, &user, "card_a", 2).await;
    assert_eq!(app.product_stock(product).await, 1);

    let report = app.state.services.maintenance.run_once().await;
    assert_eq!(report.reservations_released, 1);
    assert_eq!(report.orders_cancelled, 1);

    let order = order_json(&app, &user, order_id).await;
    assert_eq!(order["status"], "Cancelled");
    assert_eq!(app.product_stock(product).await, 2);

    let again = app.state.services.maintenance.run_once().await;
    assert_eq!(again.reservations_released, 0);
    assert_eq!(app.product_stock(product).await, 2);
}

#[tokio::test]
async fn cash_on_delivery_has_no_checkout_call() {
    let app = TestApp::new().await;
    let user = app.register("cod@example.com").await;
    let product = app.seed_product("Kettle", dec!(25.00), 2).await;
    app.add_to_cart(user.id, product, 1).await;
    let placed = body_json(app.place_order(&user, "cod", None).await).await;
    let order_id = placed["orderId"].as_str().unwrap();

    // COD holds are consumed at placement; the sweeper never returns them.
    let report = app.state.services.maintenance.run_once().await;
    assert_eq!(report.reservations_released, 0);
    assert_eq!(app.product_stock(product).await, 1);

    let response = app
        .request(
            Method::POST,
            "/api/payment/create-checkout-session",
            Some(json!({"orderId": order_id})),
            Some(&user.token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let session = body_json(response).await;
    assert!(session["url"].as_str().unwrap().contains(order_id));
}
