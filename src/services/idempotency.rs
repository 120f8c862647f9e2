//! Idempotency Guard
//!
//! A keyed request first claims its key by inserting a `pending` record
//! (unique on `key`). Only the claimant runs the computation; concurrent
//! duplicates poll until the record completes and then replay the stored
//! response. Failed computations release the claim so the client may retry.

use std::{future::Future, sync::Arc, time::Duration};

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use metrics::counter;
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ActiveValue::Set,
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::idempotency_record::{self, Entity as RecordEntity, RecordState},
    errors::ServiceError,
};

pub const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";
pub const IDEMPOTENT_REPLAYED_HEADER: &str = "idempotent-replayed";

const MAX_KEY_LEN: usize = 255;
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// A pending claim older than this is treated as abandoned by a crashed worker.
const PENDING_CLAIM_LEASE: chrono::Duration = chrono::Duration::seconds(60);

/// Trims a client key. Blank means "no key".
pub fn normalize_key(raw: Option<&str>) -> Result<Option<String>, ServiceError> {
    let Some(key) = raw.map(str::trim).filter(|k| !k.is_empty()) else {
        return Ok(None);
    };
    if key.len() > MAX_KEY_LEN {
        return Err(ServiceError::ValidationError(format!(
            "Idempotency key must be at most {} characters",
            MAX_KEY_LEN
        )));
    }
    Ok(Some(key.to_string()))
}

/// A response whose body is kept as the exact bytes sent, so a replay is
/// byte-identical to the first answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotentResponse {
    pub status: StatusCode,
    pub body: String,
    pub replayed: bool,
}

impl IdempotentResponse {
    pub fn json<T: Serialize>(status: StatusCode, value: &T) -> Result<Self, ServiceError> {
        Ok(Self {
            status,
            body: serde_json::to_string(value)?,
            replayed: false,
        })
    }
}

impl IntoResponse for IdempotentResponse {
    fn into_response(self) -> Response {
        let mut response = (
            self.status,
            [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
            self.body,
        )
            .into_response();
        if self.replayed {
            response
                .headers_mut()
                .insert(IDEMPOTENT_REPLAYED_HEADER, HeaderValue::from_static("true"));
        }
        response
    }
}

#[derive(Clone)]
pub struct IdempotencyGuard {
    db: Arc<DatabaseConnection>,
    ttl: Duration,
    wait: Duration,
}

impl IdempotencyGuard {
    pub fn new(db: Arc<DatabaseConnection>, ttl: Duration, wait: Duration) -> Self {
        Self { db, ttl, wait }
    }

    /// Runs `compute` at most once per `key` within the TTL.
    ///
    /// `scope` names the resource the key is bound to; presenting the same
    /// key for a different scope is a `Conflict`.
    #[instrument(skip(self, compute), fields(scope = %scope, keyed = key.is_some()))]
    pub async fn run<F, Fut>(
        &self,
        key: Option<String>,
        scope: &str,
        compute: F,
    ) -> Result<IdempotentResponse, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<IdempotentResponse, ServiceError>>,
    {
        let Some(key) = key else {
            return compute().await;
        };

        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| ServiceError::InternalError(format!("invalid idempotency ttl: {}", e)))?;
        let deadline = Instant::now() + self.wait;

        loop {
            let now = Utc::now();
            RecordEntity::delete_many()
                .filter(idempotency_record::Column::Key.eq(key.as_str()))
                .filter(idempotency_record::Column::ExpiresAt.lt(now))
                .exec(&*self.db)
                .await?;

            let claim_id = Uuid::new_v4();
            let claim = idempotency_record::ActiveModel {
                id: Set(claim_id),
                key: Set(key.clone()),
                scope: Set(scope.to_string()),
                state: Set(RecordState::Pending),
                status_code: Set(None),
                response_body: Set(None),
                expires_at: Set(now + ttl),
                created_at: Set(now),
            };
            let inserted = RecordEntity::insert(claim)
                .on_conflict(
                    OnConflict::column(idempotency_record::Column::Key)
                        .do_nothing()
                        .to_owned(),
                )
                .exec_without_returning(&*self.db)
                .await?;

            if inserted == 1 {
                debug!("idempotency key claimed");
                return self.compute_and_store(claim_id, compute).await;
            }

            let existing = RecordEntity::find()
                .filter(idempotency_record::Column::Key.eq(key.as_str()))
                .one(&*self.db)
                .await?;

            let Some(record) = existing else {
                continue;
            };

            if record.scope != scope {
                return Err(ServiceError::Conflict(
                    "Idempotency key was already used for a different request".to_string(),
                ));
            }

            if record.state == RecordState::Completed {
                return replay(record);
            }

            if now - record.created_at > PENDING_CLAIM_LEASE {
                warn!("abandoned idempotency claim taken over");
                self.release_claim(record.id).await;
                continue;
            }

            if Instant::now() >= deadline {
                return Err(ServiceError::Conflict(
                    "A request with this idempotency key is still in progress".to_string(),
                ));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn compute_and_store<F, Fut>(
        &self,
        claim_id: Uuid,
        compute: F,
    ) -> Result<IdempotentResponse, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<IdempotentResponse, ServiceError>>,
    {
        let response = match compute().await {
            Ok(response) => response,
            Err(e) => {
                self.release_claim(claim_id).await;
                return Err(e);
            }
        };

        if !response.status.is_success() {
            self.release_claim(claim_id).await;
            return Ok(response);
        }

        let stored = RecordEntity::update_many()
            .col_expr(
                idempotency_record::Column::State,
                Expr::value(RecordState::Completed),
            )
            .col_expr(
                idempotency_record::Column::StatusCode,
                Expr::value(i32::from(response.status.as_u16())),
            )
            .col_expr(
                idempotency_record::Column::ResponseBody,
                Expr::value(response.body.clone()),
            )
            .filter(idempotency_record::Column::Id.eq(claim_id))
            .exec(&*self.db)
            .await;

        match stored {
            Ok(result) if result.rows_affected == 1 => {}
            Ok(_) => warn!("idempotency claim disappeared before completion"),
            Err(e) => {
                warn!(error = %e, "failed to store idempotent response");
                self.release_claim(claim_id).await;
            }
        }
        Ok(response)
    }

    async fn release_claim(&self, claim_id: Uuid) {
        let released = RecordEntity::delete_many()
            .filter(idempotency_record::Column::Id.eq(claim_id))
            .filter(idempotency_record::Column::State.eq(RecordState::Pending))
            .exec(&*self.db)
            .await;
        if let Err(e) = released {
            warn!(error = %e, "failed to release idempotency claim");
        }
    }

    /// Deletes records past their expiry.
    pub async fn purge_expired(&self) -> Result<u64, ServiceError> {
        let result = RecordEntity::delete_many()
            .filter(idempotency_record::Column::ExpiresAt.lt(Utc::now()))
            .exec(&*self.db)
            .await?;
        if result.rows_affected > 0 {
            info!(purged = result.rows_affected, "expired idempotency records purged");
        }
        Ok(result.rows_affected)
    }
}

fn replay(record: idempotency_record::Model) -> Result<IdempotentResponse, ServiceError> {
    let status = record
        .status_code
        .and_then(|code| u16::try_from(code).ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| {
            ServiceError::InternalError(format!("idempotency record {} has no status", record.id))
        })?;
    counter!("shopwave_idempotent_replays_total", 1);
    debug!("replaying stored response");
    Ok(IdempotentResponse {
        status,
        body: record.response_body.unwrap_or_default(),
        replayed: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn blank_keys_mean_no_key() {
        assert_eq!(normalize_key(None).unwrap(), None);
        assert_eq!(normalize_key(Some("   ")).unwrap(), None);
        assert_eq!(normalize_key(Some(" abc ")).unwrap(), Some("abc".to_string()));
    }

    #[test]
    fn oversized_keys_are_rejected() {
        let key = "k".repeat(MAX_KEY_LEN + 1);
        assert_matches!(normalize_key(Some(&key)), Err(ServiceError::ValidationError(_)));
        assert!(normalize_key(Some(&"k".repeat(MAX_KEY_LEN))).unwrap().is_some());
    }

    #[test]
    fn replayed_responses_are_marked() {
        let response = IdempotentResponse {
            status: StatusCode::OK,
            body: "{\"sessionId\":\"cs_1\"}".into(),
            replayed: true,
        }
        .into_response();
        assert_eq!(response.headers()[IDEMPOTENT_REPLAYED_HEADER], "true");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");

        let fresh = IdempotentResponse::json(StatusCode::OK, &serde_json::json!({"a": 1}))
            .unwrap()
            .into_response();
        assert!(fresh.headers().get(IDEMPOTENT_REPLAYED_HEADER).is_none());
    }
}
