#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    response::Response,
    Router,
};
use http_body_util::BodyExt;
use rust_decimal::Decimal;
use sea_orm::{ActiveValue::Set, EntityTrait};
use serde_json::Value;
use shopwave_api::{
    auth::user::Role,
    config::AppConfig,
    db,
    entities::{cart_item, coupon, product},
    events::{self, EventSender},
    handlers::AppServices,
    AppState,
};
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str = "k9V2mQ7xR4tW1zL8pN3sB6yH0cF5jD2gA7uE4iO1rT9wX3vZ6nM8qK5bJ2hG7fY0";
pub const CARD_A_WEBHOOK_SECRET: &str = "whsec_test_card_a";
pub const CARD_B_HMAC_SECRET: &str = "card_b_test_hmac";

/// Helper harness for spinning up the full router over a temp-file SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    _db_dir: TempDir,
    _event_task: tokio::task::JoinHandle<()>,
}

/// A registered account and its access token.
pub struct TestUser {
    pub id: Uuid,
    pub token: String,
    pub refresh_token: String,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Construct a test application, letting the caller adjust configuration first.
    pub async fn with_config(customize: impl FnOnce(&mut AppConfig)) -> Self {
        let db_dir = tempfile::tempdir().expect("create temp dir");
        let db_path = db_dir.path().join("shopwave_test.db");

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            JWT_SECRET.to_string(),
            "test".to_string(),
        );
        cfg.auto_migrate = true;
        cfg.cors_allow_any_origin = true;
        // A single connection serializes SQLite writers the way row locks do in Postgres.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.card_a_webhook_secret = Some(CARD_A_WEBHOOK_SECRET.to_string());
        cfg.card_b_hmac_secret = Some(CARD_B_HMAC_SECRET.to_string());
        customize(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let (event_sender, event_rx) = EventSender::channel(256);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let services = AppServices::new(db_arc.clone(), event_sender.clone(), &cfg)
            .expect("build services");
        let state = AppState::new(db_arc, cfg, event_sender, services);
        let router = shopwave_api::build_app(state.clone());

        Self {
            router,
            state,
            _db_dir: db_dir,
            _event_task: event_task,
        }
    }

    pub async fn register(&self, email: &str) -> TestUser {
        let response = self
            .request(
                Method::POST,
                "/api/auth/register",
                Some(serde_json::json!({
                    "username": "shopper",
                    "email": email,
                    "password": "correct horse battery"
                })),
                None,
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        let token = body["accessToken"].as_str().expect("access token").to_string();
        let claims = self
            .state
            .services
            .auth
            .validate_token(&token)
            .expect("valid access token");

        TestUser {
            id: claims.sub,
            token,
            refresh_token: body["refreshToken"]
                .as_str()
                .expect("refresh token")
                .to_string(),
        }
    }

    pub async fn admin(&self) -> TestUser {
        let email = format!("admin-{}@example.com", Uuid::new_v4());
        self.state
            .services
            .auth
            .create_user("admin", &email, "admin password 123", Role::Admin)
            .await
            .expect("create admin");
        let response = self
            .request(
                Method::POST,
                "/api/auth/login",
                Some(serde_json::json!({"email": email, "password": "admin password 123"})),
                None,
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let token = body["accessToken"].as_str().expect("access token").to_string();
        let claims = self.state.services.auth.validate_token(&token).expect("claims");
        TestUser {
            id: claims.sub,
            token,
            refresh_token: body["refreshToken"].as_str().unwrap_or_default().to_string(),
        }
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        self.request_with_headers(method, uri, body, token, &[]).await
    }

    pub async fn request_with_headers(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("serialize json request body"))
        } else {
            Body::empty()
        };

        self.router
            .clone()
            .oneshot(builder.body(body).expect("build request"))
            .await
            .expect("router error during test request")
    }

    /// Posts a raw webhook body with a signature header.
    pub async fn webhook(&self, provider: &str, payload: &[u8], signature: &str) -> Response {
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("/api/payment/webhook/{}", provider))
            .header("content-type", "application/json")
            .header("x-signature", signature)
            .body(Body::from(payload.to_vec()))
            .expect("build webhook request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during webhook")
    }

    pub async fn seed_product(&self, name: &str, price: Decimal, stock: i32) -> Uuid {
        let id = Uuid::new_v4();
        let now = chrono::Utc::now();
        product::Entity::insert(product::ActiveModel {
            id: Set(id),
            name: Set(name.to_string()),
            price: Set(price),
            stock: Set(stock),
            created_at: Set(now),
            updated_at: Set(now),
        })
        .exec_without_returning(&*self.state.db)
        .await
        .expect("seed product");
        id
    }

    pub async fn add_to_cart(&self, user_id: Uuid, product_id: Uuid, quantity: i32) {
        cart_item::Entity::insert(cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            product_id: Set(product_id),
            quantity: Set(quantity),
            created_at: Set(chrono::Utc::now()),
        })
        .exec_without_returning(&*self.state.db)
        .await
        .expect("seed cart item");
    }

    pub async fn seed_coupon(
        &self,
        code: &str,
        discount_percent: i32,
        max_discount: Option<Decimal>,
        usage_limit: i32,
    ) -> Uuid {
        let id = Uuid::new_v4();
        coupon::Entity::insert(coupon::ActiveModel {
            id: Set(id),
            code: Set(code.to_string()),
            discount_percent: Set(discount_percent),
            max_discount: Set(max_discount),
            min_order_amount: Set(None),
            is_active: Set(true),
            usage_limit: Set(usage_limit),
            times_used: Set(0),
            expires_at: Set(None),
            created_at: Set(chrono::Utc::now()),
        })
        .exec_without_returning(&*self.state.db)
        .await
        .expect("seed coupon");
        id
    }

    pub async fn product_stock(&self, product_id: Uuid) -> i32 {
        product::Entity::find_by_id(product_id)
            .one(&*self.state.db)
            .await
            .expect("load product")
            .expect("product exists")
            .stock
    }

    /// Places an order through the API and returns the response body.
    pub async fn place_order(&self, user: &TestUser, payment_method: &str, coupon: Option<&str>) -> Response {
        let mut body = serde_json::json!({
            "shippingAddress": "12 Harbour Road",
            "shippingCity": "Alexandria",
            "phone": "+201000000000",
            "paymentMethod": payment_method,
        });
        if let Some(code) = coupon {
            body["couponCode"] = Value::String(code.to_string());
        }
        self.request(Method::POST, "/api/orders", Some(body), Some(&user.token))
            .await
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("read response body")
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response) -> Value {
    let bytes = body_bytes(response).await;
    serde_json::from_slice(&bytes).expect("response body is json")
}

/// `t=<unix>,v1=<hex>` header for card provider A.
pub fn sign_card_a(payload: &[u8], timestamp: i64) -> String {
    use hmac::{Hmac, Mac};
    let mut mac = Hmac::<sha2::Sha256>::new_from_slice(CARD_A_WEBHOOK_SECRET.as_bytes())
        .expect("hmac key");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

/// Hex HMAC-SHA512 of the raw body for card provider B.
pub fn sign_card_b(payload: &[u8]) -> String {
    use hmac::{Hmac, Mac};
    let mut mac = Hmac::<sha2::Sha512>::new_from_slice(CARD_B_HMAC_SECRET.as_bytes())
        .expect("hmac key");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Reads a money field that serializes as a decimal string.
pub fn decimal(value: &Value) -> Decimal {
    match value {
        Value::String(s) => s.parse().expect("decimal string"),
        Value::Number(n) => n.to_string().parse().expect("decimal number"),
        other => panic!("not a decimal: {}", other),
    }
}
