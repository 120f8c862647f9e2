/*!
 * # Authentication and Authorization Module
 *
 * Bearer-token identity for the storefront API:
 *
 * - Argon2id password hashing for registration and login
 * - HS256 JWT access tokens carrying the user's role
 * - Opaque refresh tokens, stored as SHA-256 digests and rotated on every
 *   use. Presenting a token that was already revoked is treated as theft:
 *   every token of that user is revoked and the caller must log in again.
 *
 * Route protection is applied with [`AuthRouterExt`].
 */

pub mod refresh_token;
pub mod user;

use std::sync::Arc;

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use metrics::counter;
use rand::RngCore;
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ActiveValue::Set,
    ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    config::AppConfig,
    events::{Event, EventSender},
};
use refresh_token::Entity as RefreshTokenEntity;
use user::{Entity as UserEntity, Model as UserModel, Role};

const REFRESH_TOKEN_BYTES: usize = 64;

/// JWT claims carried by access tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id)
    pub sub: Uuid,
    pub role: Role,
    pub iss: String,
    pub aud: String,
    /// Expiry, seconds since epoch
    pub exp: i64,
    pub iat: i64,
    /// Token id
    pub jti: String,
}

/// Authenticated caller, inserted into request extensions by [`auth_middleware`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub role: Role,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or(AuthError::MissingAuth)
    }
}

/// Authentication configuration
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub access_token_ttl: ChronoDuration,
    pub refresh_token_ttl: ChronoDuration,
    pub issuer: String,
    pub audience: String,
}

impl AuthConfig {
    pub fn new(
        jwt_secret: String,
        access_token_ttl: ChronoDuration,
        refresh_token_ttl: ChronoDuration,
        issuer: String,
        audience: String,
    ) -> Self {
        Self {
            jwt_secret,
            access_token_ttl,
            refresh_token_ttl,
            issuer,
            audience,
        }
    }

    pub fn from_app_config(config: &AppConfig) -> Self {
        Self::new(
            config.jwt_secret.clone(),
            ChronoDuration::seconds(config.jwt_expiration as i64),
            ChronoDuration::seconds(config.refresh_token_expiration as i64),
            config.auth_issuer.clone(),
            config.auth_audience.clone(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: i64,
    pub refresh_expires_in: i64,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct RegisterRequest {
    #[validate(length(min = 1, max = 100))]
    pub username: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 8, max = 128))]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct LoginRequest {
    #[validate(length(min = 1))]
    pub email: String,
    #[validate(length(min = 1))]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenRequest {
    pub refresh_token: String,
}

/// Issues and validates tokens and owns the refresh-token rotation protocol.
#[derive(Clone)]
pub struct AuthService {
    config: AuthConfig,
    db: Arc<DatabaseConnection>,
    events: EventSender,
}

impl AuthService {
    pub fn new(config: AuthConfig, db: Arc<DatabaseConnection>, events: EventSender) -> Self {
        Self { config, db, events }
    }

    /// Creates a customer account and logs it in.
    #[instrument(skip(self, request), fields(email = %request.email))]
    pub async fn register(&self, request: RegisterRequest) -> Result<TokenPair, AuthError> {
        request
            .validate()
            .map_err(|e| AuthError::Validation(e.to_string()))?;
        let user = self
            .create_user(&request.username, &request.email, &request.password, Role::Customer)
            .await?;
        self.issue_tokens(&*self.db, &user, None).await
    }

    /// Inserts a user row. A taken email is reported as [`AuthError::EmailTaken`].
    pub async fn create_user(
        &self,
        username: &str,
        email: &str,
        password: &str,
        role: Role,
    ) -> Result<UserModel, AuthError> {
        let password_hash = hash_password(password.to_string()).await?;
        let model = user::Model {
            id: Uuid::new_v4(),
            username: username.trim().to_string(),
            email: normalize_email(email),
            password_hash,
            role,
            created_at: Utc::now(),
        };

        let active: user::ActiveModel = model.clone().into();
        let inserted = UserEntity::insert(active)
            .on_conflict(
                OnConflict::column(user::Column::Email)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;
        if inserted == 0 {
            return Err(AuthError::EmailTaken);
        }

        info!(user_id = %model.id, role = %model.role, "user registered");
        Ok(model)
    }

    /// Creates the configured admin account unless the email already exists.
    pub async fn ensure_admin(&self, email: &str, password: &str) -> Result<(), AuthError> {
        match self.create_user("admin", email, password, Role::Admin).await {
            Ok(_) | Err(AuthError::EmailTaken) => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, request))]
    pub async fn login(&self, request: LoginRequest) -> Result<TokenPair, AuthError> {
        request
            .validate()
            .map_err(|e| AuthError::Validation(e.to_string()))?;

        let user = UserEntity::find()
            .filter(user::Column::Email.eq(normalize_email(&request.email)))
            .one(&*self.db)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        if !verify_password(request.password, user.password_hash.clone()).await? {
            warn!(user_id = %user.id, "failed login attempt");
            return Err(AuthError::InvalidCredentials);
        }

        self.issue_tokens(&*self.db, &user, None).await
    }

    /// Rotates a refresh token.
    ///
    /// A presented token that is already revoked means an older copy is in
    /// someone else's hands; the whole token family of that user is revoked.
    #[instrument(skip(self, raw_token))]
    pub async fn refresh(&self, raw_token: &str) -> Result<TokenPair, AuthError> {
        let token_hash = hash_token(raw_token);
        let txn = self.db.begin().await?;

        let stored = RefreshTokenEntity::find()
            .filter(refresh_token::Column::TokenHash.eq(token_hash))
            .one(&txn)
            .await?
            .ok_or(AuthError::InvalidToken)?;

        if stored.is_revoked() {
            let revoked = revoke_all_for_user(&txn, stored.user_id, "reuse_detected").await?;
            txn.commit().await?;
            self.report_reuse(stored.user_id, revoked);
            return Err(AuthError::TokenReuseDetected);
        }

        let now = Utc::now();
        if stored.is_expired(now) {
            return Err(AuthError::TokenExpired);
        }

        let user = UserEntity::find_by_id(stored.user_id)
            .one(&txn)
            .await?
            .ok_or(AuthError::InvalidToken)?;

        let (new_raw, new_hash) = generate_refresh_token();
        let rotated = RefreshTokenEntity::update_many()
            .col_expr(refresh_token::Column::RevokedAt, Expr::value(Some(now)))
            .col_expr(
                refresh_token::Column::ReplacedBy,
                Expr::value(Some(new_hash.clone())),
            )
            .col_expr(
                refresh_token::Column::RevokeReason,
                Expr::value(Some("rotated".to_string())),
            )
            .filter(refresh_token::Column::Id.eq(stored.id))
            .filter(refresh_token::Column::RevokedAt.is_null())
            .exec(&txn)
            .await?;

        if rotated.rows_affected == 0 {
            // A concurrent request rotated the same token first.
            let revoked = revoke_all_for_user(&txn, stored.user_id, "reuse_detected").await?;
            txn.commit().await?;
            self.report_reuse(stored.user_id, revoked);
            return Err(AuthError::TokenReuseDetected);
        }

        let pair = self
            .issue_tokens(&txn, &user, Some((new_raw, new_hash)))
            .await?;
        txn.commit().await?;

        info!(user_id = %user.id, "refresh token rotated");
        Ok(pair)
    }

    /// Revokes the presented refresh token. Unknown or already revoked
    /// tokens are accepted silently.
    #[instrument(skip(self, raw_token))]
    pub async fn logout(&self, raw_token: &str) -> Result<(), AuthError> {
        RefreshTokenEntity::update_many()
            .col_expr(refresh_token::Column::RevokedAt, Expr::value(Some(Utc::now())))
            .col_expr(
                refresh_token::Column::RevokeReason,
                Expr::value(Some("logout".to_string())),
            )
            .filter(refresh_token::Column::TokenHash.eq(hash_token(raw_token)))
            .filter(refresh_token::Column::RevokedAt.is_null())
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    /// Validates an access token and returns its claims
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[self.config.audience.as_str()]);
        validation.set_issuer(&[self.config.issuer.as_str()]);

        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.config.jwt_secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            _ => AuthError::InvalidToken,
        })
    }

    fn generate_access_token(&self, user: &UserModel) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user.id,
            role: user.role,
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            exp: (now + self.config.access_token_ttl).timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.config.jwt_secret.as_bytes()),
        )
        .map_err(|e| AuthError::TokenCreation(e.to_string()))
    }

    async fn issue_tokens<C: ConnectionTrait>(
        &self,
        conn: &C,
        user: &UserModel,
        refresh: Option<(String, String)>,
    ) -> Result<TokenPair, AuthError> {
        let access_token = self.generate_access_token(user)?;
        let (raw, digest) = refresh.unwrap_or_else(generate_refresh_token);
        let now = Utc::now();

        RefreshTokenEntity::insert(refresh_token::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user.id),
            token_hash: Set(digest),
            expires_at: Set(now + self.config.refresh_token_ttl),
            created_at: Set(now),
            revoked_at: Set(None),
            replaced_by: Set(None),
            revoke_reason: Set(None),
        })
        .exec_without_returning(conn)
        .await?;

        Ok(TokenPair {
            access_token,
            refresh_token: raw,
            token_type: "Bearer".to_string(),
            expires_in: self.config.access_token_ttl.num_seconds(),
            refresh_expires_in: self.config.refresh_token_ttl.num_seconds(),
        })
    }

    fn report_reuse(&self, user_id: Uuid, revoked_tokens: u64) {
        counter!("shopwave_refresh_token_reuse_total", 1);
        warn!(%user_id, revoked_tokens, "revoked refresh token presented, all sessions revoked");
        self.events.publish(Event::RefreshTokenReuseDetected {
            user_id,
            revoked_tokens,
        });
    }
}

async fn revoke_all_for_user<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    reason: &str,
) -> Result<u64, DbErr> {
    let result = RefreshTokenEntity::update_many()
        .col_expr(refresh_token::Column::RevokedAt, Expr::value(Some(Utc::now())))
        .col_expr(
            refresh_token::Column::RevokeReason,
            Expr::value(Some(reason.to_string())),
        )
        .filter(refresh_token::Column::UserId.eq(user_id))
        .filter(refresh_token::Column::RevokedAt.is_null())
        .exec(conn)
        .await?;
    Ok(result.rows_affected)
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Returns `(raw token, sha256 hex digest)`.
fn generate_refresh_token() -> (String, String) {
    let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let raw = URL_SAFE_NO_PAD.encode(bytes);
    let digest = hash_token(&raw);
    (raw, digest)
}

fn hash_token(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

async fn hash_password(password: String) -> Result<String, AuthError> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut rand::rngs::OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AuthError::InternalError(e.to_string()))
    })
    .await
    .map_err(|e| AuthError::InternalError(e.to_string()))?
}

async fn verify_password(password: String, stored_hash: String) -> Result<bool, AuthError> {
    tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&stored_hash)
            .map_err(|e| AuthError::InternalError(e.to_string()))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    })
    .await
    .map_err(|e| AuthError::InternalError(e.to_string()))?
}

/// Authentication error types
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Refresh token reuse detected")]
    TokenReuseDetected,

    #[error("Email already registered")]
    EmailTaken,

    #[error("Insufficient permissions")]
    InsufficientPermissions,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Token creation failed: {0}")]
    TokenCreation(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<DbErr> for AuthError {
    fn from(err: DbErr) -> Self {
        AuthError::DatabaseError(err.to_string())
    }
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingAuth => "AUTH_MISSING",
            Self::InvalidCredentials => "AUTH_INVALID_CREDENTIALS",
            Self::InvalidToken => "AUTH_INVALID_TOKEN",
            Self::TokenExpired => "AUTH_TOKEN_EXPIRED",
            Self::TokenReuseDetected => "AUTH_TOKEN_REUSE_DETECTED",
            Self::EmailTaken => "AUTH_EMAIL_TAKEN",
            Self::InsufficientPermissions => "AUTH_INSUFFICIENT_PERMISSIONS",
            Self::Validation(_) => "AUTH_VALIDATION_FAILED",
            Self::TokenCreation(_) => "AUTH_TOKEN_CREATION_FAILED",
            Self::DatabaseError(_) => "AUTH_DATABASE_ERROR",
            Self::InternalError(_) => "AUTH_INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingAuth
            | Self::InvalidCredentials
            | Self::InvalidToken
            | Self::TokenExpired
            | Self::TokenReuseDetected => StatusCode::UNAUTHORIZED,
            Self::InsufficientPermissions => StatusCode::FORBIDDEN,
            Self::EmailTaken => StatusCode::CONFLICT,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::TokenCreation(_) | Self::DatabaseError(_) | Self::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            Self::MissingAuth => "Authentication required".to_string(),
            Self::InvalidToken => "Invalid authentication token".to_string(),
            Self::TokenReuseDetected => {
                "Refresh token was already used; all sessions have been revoked".to_string()
            }
            Self::Validation(msg) => msg.clone(),
            Self::TokenCreation(_) | Self::DatabaseError(_) | Self::InternalError(_) => {
                error!(error = %self, "authentication failure");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(serde_json::json!({
            "error": {
                "code": self.code(),
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Role middleware to check if a user has the required role
pub async fn role_middleware(
    State(required_role): State<Role>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let user = request
        .extensions()
        .get::<AuthUser>()
        .ok_or(AuthError::MissingAuth)?;

    if user.role != required_role && !user.is_admin() {
        return Err(AuthError::InsufficientPermissions);
    }

    Ok(next.run(request).await)
}

/// Authentication middleware that validates the bearer token
pub async fn auth_middleware(mut request: Request, next: Next) -> Response {
    let auth_service = match request.extensions().get::<Arc<AuthService>>() {
        Some(service) => service.clone(),
        None => {
            error!("auth service missing from request extensions");
            return AuthError::InternalError("auth service unavailable".to_string())
                .into_response();
        }
    };

    match extract_auth_from_headers(request.headers(), &auth_service) {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}

fn extract_auth_from_headers(
    headers: &HeaderMap,
    auth_service: &AuthService,
) -> Result<AuthUser, AuthError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::MissingAuth)?;

    let claims = auth_service.validate_token(token)?;
    Ok(AuthUser {
        user_id: claims.sub,
        role: claims.role,
    })
}

/// Extension methods for Router to add auth middleware
pub trait AuthRouterExt {
    fn with_auth(self) -> Self;
    fn with_role(self, role: Role) -> Self;
}

impl<S> AuthRouterExt for axum::Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn with_auth(self) -> Self {
        self.route_layer(axum::middleware::from_fn(auth_middleware))
    }

    fn with_role(self, role: Role) -> Self {
        self.route_layer(axum::middleware::from_fn_with_state(role, role_middleware))
            .with_auth()
    }
}
