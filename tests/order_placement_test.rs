mod common;

use axum::http::{Method, StatusCode};
use common::{body_json, decimal, TestApp};
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn coupon_discount_is_capped_and_total_is_consistent() {
    let app = TestApp::new().await;
    let user = app.register("buyer@example.com").await;
    let lamp = app.seed_product("Desk Lamp", dec!(10.00), 5).await;
    app.add_to_cart(user.id, lamp, 2).await;
    app.seed_coupon("SAVE20", 20, Some(dec!(3.00)), 10).await;

    let response = app.place_order(&user, "cod", Some("save20")).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;

    assert_eq!(decimal(&body["subtotal"]), dec!(20.00));
    assert_eq!(decimal(&body["discountAmount"]), dec!(3.00));
    assert_eq!(decimal(&body["total"]), dec!(17.00));
    assert_eq!(body["paymentStatus"], "COD_Pending");
    assert_eq!(app.product_stock(lamp).await, 3);

    // Cart is emptied once the order exists.
    let cart = app
        .request(Method::GET, "/api/cart", None, Some(&user.token))
        .await;
    assert_eq!(cart.status(), StatusCode::OK);
    assert!(body_json(cart).await["items"].as_array().unwrap().is_empty());

    let order_id = body["orderId"].as_str().unwrap();
    let order = app
        .request(Method::GET, &format!("/api/orders/{}", order_id), None, Some(&user.token))
        .await;
    assert_eq!(order.status(), StatusCode::OK);
    let order = body_json(order).await;
    let line_sum: rust_decimal::Decimal = order["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| decimal(&item["lineTotal"]))
        .sum();
    assert_eq!(line_sum, decimal(&order["subtotal"]));
    assert_eq!(
        decimal(&order["totalAmount"]),
        decimal(&order["subtotal"]) - decimal(&order["discountAmount"])
    );
    assert_eq!(order["couponCode"], "SAVE20");
}

#[tokio::test]
async fn empty_cart_is_rejected() {
    let app = TestApp::new().await;
    let user = app.register("empty@example.com").await;

    let response = app.place_order(&user, "cod", None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["message"], "Cart is empty");
}

#[tokio::test]
async fn shortfall_leaves_every_product_untouched() {
    let app = TestApp::new().await;
    let user = app.register("short@example.com").await;
    let plenty = app.seed_product("Notebook", dec!(4.50), 10).await;
    let scarce = app.seed_product("Fountain Pen", dec!(30.00), 1).await;
    app.add_to_cart(user.id, plenty, 3).await;
    app.add_to_cart(user.id, scarce, 2).await;

    let response = app.place_order(&user, "card_a", None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("Fountain Pen"));

    assert_eq!(app.product_stock(plenty).await, 10);
    assert_eq!(app.product_stock(scarce).await, 1);

    let cart = app
        .request(Method::GET, "/api/cart", None, Some(&user.token))
        .await;
    assert_eq!(body_json(cart).await["items"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn last_unit_goes_to_exactly_one_buyer() {
    let app = TestApp::new().await;
    let first = app.register("first@example.com").await;
    let second = app.register("second@example.com").await;
    let last = app.seed_product("Limited Print", dec!(50.00), 1).await;
    app.add_to_cart(first.id, last, 1).await;
    app.add_to_cart(second.id, last, 1).await;

    let (a, b) = tokio::join!(
        app.place_order(&first, "card_a", None),
        app.place_order(&second, "card_b", None)
    );

    let mut statuses = vec![a.status().as_u16(), b.status().as_u16()];
    statuses.sort();
    assert_eq!(statuses, vec![201, 400]);
    assert_eq!(app.product_stock(last).await, 0);
}

#[tokio::test]
async fn coupon_with_one_use_left_discounts_only_one_order() {
    let app = TestApp::new().await;
    let first = app.register("c1@example.com").await;
    let second = app.register("c2@example.com").await;
    let mug = app.seed_product("Mug", dec!(12.00), 10).await;
    app.add_to_cart(first.id, mug, 1).await;
    app.add_to_cart(second.id, mug, 1).await;
    app.seed_coupon("ONCE", 50, None, 1).await;

    let (a, b) = tokio::join!(
        app.place_order(&first, "cod", Some("ONCE")),
        app.place_order(&second, "cod", Some("ONCE"))
    );
    assert_eq!(a.status(), StatusCode::CREATED);
    assert_eq!(b.status(), StatusCode::CREATED);

    let mut discounts = vec![
        decimal(&body_json(a).await["discountAmount"]),
        decimal(&body_json(b).await["discountAmount"]),
    ];
    discounts.sort();
    assert_eq!(discounts, vec![dec!(0.00), dec!(6.00)]);
}

#[tokio::test]
async fn placement_key_replays_the_first_order() {
    let app = TestApp::new().await;
    let user = app.register("retry@example.com").await;
    let book = app.seed_product("Field Guide", dec!(18.25), 4).await;
    app.add_to_cart(user.id, book, 2).await;

    let body = json!({
        "shippingAddress": "12 Harbour Road",
        "shippingCity": "Alexandria",
        "phone": "+201000000000",
        "paymentMethod": "card_a",
    });
    let headers = [("x-idempotency-key", "place-once-1")];

    let first = app
        .request_with_headers(Method::POST, "/api/orders", Some(body.clone()), Some(&user.token), &headers)
        .await;
    assert_eq!(first.status(), StatusCode::CREATED);
    let first = body_json(first).await;

    let second = app
        .request_with_headers(Method::POST, "/api/orders", Some(body), Some(&user.token), &headers)
        .await;
    assert_eq!(second.status(), StatusCode::CREATED);
    let second = body_json(second).await;

    assert_eq!(first["orderId"], second["orderId"]);
    assert_eq!(app.product_stock(book).await, 2);

    let list = app
        .request(Method::GET, "/api/orders", None, Some(&user.token))
        .await;
    assert_eq!(body_json(list).await["total"], 1);
}

#[tokio::test]
async fn unknown_payment_method_is_rejected() {
    let app = TestApp::new().await;
    let user = app.register("paypal@example.com").await;
    let item = app.seed_product("Sticker", dec!(1.00), 100).await;
    app.add_to_cart(user.id, item, 1).await;

    let response = app.place_order(&user, "paypal", None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(app.product_stock(item).await, 100);
}

#[tokio::test]
async fn orders_are_private_to_their_owner() {
    let app = TestApp::new().await;
    let owner = app.register("owner@example.com").await;
    let stranger = app.register("stranger@example.com").await;
    let item = app.seed_product("Candle", dec!(8.00), 3).await;
    app.add_to_cart(owner.id, item, 1).await;

    let placed = body_json(app.place_order(&owner, "cod", None).await).await;
    let uri = format!("/api/orders/{}", placed["orderId"].as_str().unwrap());

    let response = app.request(Method::GET, &uri, None, Some(&stranger.token)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let missing = app
        .request(
            Method::GET,
            &format!("/api/orders/{}", Uuid::new_v4()),
            None,
            Some(&owner.token),
        )
        .await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

async fn preview(app: &TestApp, token: &str, code: &str, total: &str) -> axum::response::Response {
    app.request(
        Method::POST,
        "/api/coupons/validate",
        Some(json!({"code": code, "orderTotal": total})),
        Some(token),
    )
    .await
}

#[tokio::test]
async fn coupon_preview_reports_bounds() {
    let app = TestApp::new().await;
    let user = app.register("preview@example.com").await;
    app.seed_coupon("HALF", 50, Some(dec!(10.00)), 5).await;

    let capped = body_json(preview(&app, &user.token, "half", "100.00").await).await;
    assert_eq!(capped["isValid"], true);
    assert_eq!(decimal(&capped["discountAmount"]), dec!(10.00));

    let small = body_json(preview(&app, &user.token, "HALF", "4.00").await).await;
    assert_eq!(decimal(&small["discountAmount"]), dec!(2.00));

    let unknown = preview(&app, &user.token, "NOPE", "40.00").await;
    assert_eq!(unknown.status(), StatusCode::OK);
    let unknown = body_json(unknown).await;
    assert_eq!(unknown["isValid"], false);
    assert_eq!(decimal(&unknown["discountAmount"]), dec!(0));
}

#[tokio::test]
async fn guest_cart_merges_by_summing_quantities() {
    let app = TestApp::new().await;
    let user = app.register("merge@example.com").await;
    let tea = app.seed_product("Green Tea", dec!(6.00), 50).await;
    let cup = app.seed_product("Cup", dec!(3.00), 50).await;
    app.add_to_cart(user.id, tea, 1).await;

    let response = app
        .request(
            Method::POST,
            "/api/cart/merge",
            Some(json!({"items": [
                {"productId": tea, "quantity": 2},
                {"productId": cup, "quantity": 1},
                {"productId": Uuid::new_v4(), "quantity": 1}
            ]})),
            Some(&user.token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let cart = body_json(response).await;

    let items = cart["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    let tea_line = items
        .iter()
        .find(|line| line["productId"] == tea.to_string())
        .unwrap();
    assert_eq!(tea_line["quantity"], 3);
    assert_eq!(decimal(&cart["subtotal"]), dec!(21.00));
}
