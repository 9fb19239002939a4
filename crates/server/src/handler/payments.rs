use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use payrail_core::cache::CacheOptions;
use payrail_core::context;
use payrail_core::error::Error;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppState;

const NAMESPACE: &str = "payments";
const PAYMENT_TTL_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub amount_minor: i64,
    pub currency: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CreatePayment {
    pub amount_minor: i64,
    pub currency: String,
}

fn tenant_tag(tenant_id: Uuid) -> String {
    format!("tenant:{tenant_id}")
}

fn require_tenant() -> Result<Uuid, Error> {
    context::require()?
        .tenant_id
        .ok_or_else(|| Error::Authentication("API key required".into()))
}

pub async fn list_payments(State(state): State<AppState>) -> Result<Json<Vec<Payment>>, Error> {
    require_tenant()?;

    let mut session = state.rls.acquire().await?;
    // No tenant filter in the query: the session binding lets the row-level
    // security policy do the filtering.
    let rows = sqlx::query_as::<_, Payment>(
        "SELECT id, tenant_id, amount_minor, currency, status, created_at \
         FROM payments ORDER BY created_at DESC LIMIT 100",
    )
    .fetch_all(session.conn())
    .await;
    session.release().await;

    Ok(Json(rows?))
}

pub async fn get_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Payment>, Error> {
    let tenant_id = require_tenant()?;
    let tag = tenant_tag(tenant_id);
    let cache_key = format!("{tenant_id}:{id}");

    let rls = state.rls.clone();
    let payment = state
        .cache
        .get_or_set_with_lock(
            &cache_key,
            CacheOptions {
                ttl_secs: Some(PAYMENT_TTL_SECS),
                namespace: Some(NAMESPACE),
                tags: &[tag.as_str()],
            },
            || async move {
                let mut session = rls.acquire().await?;
                let row = sqlx::query_as::<_, Payment>(
                    "SELECT id, tenant_id, amount_minor, currency, status, created_at \
                     FROM payments WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(session.conn())
                .await;
                session.release().await;
                row?.ok_or_else(|| Error::NotFound(format!("payment {id}")))
            },
        )
        .await?;

    Ok(Json(payment))
}

pub async fn create_payment(
    State(state): State<AppState>,
    Json(body): Json<CreatePayment>,
) -> Result<(StatusCode, Json<Payment>), Error> {
    let tenant_id = require_tenant()?;

    if body.amount_minor <= 0 {
        return Err(Error::BadRequest("amount-minor must be positive".into()));
    }
    if body.currency.len() != 3 || !body.currency.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(Error::BadRequest(
            "currency must be an ISO 4217 alpha-3 code".into(),
        ));
    }

    let mut session = state.rls.acquire().await?;
    // The insert policy's WITH CHECK verifies the bound tenant matches.
    let row = sqlx::query_as::<_, Payment>(
        "INSERT INTO payments (id, tenant_id, amount_minor, currency, status) \
         VALUES ($1, $2, $3, $4, 'pending') \
         RETURNING id, tenant_id, amount_minor, currency, status, created_at",
    )
    .bind(Uuid::new_v4())
    .bind(tenant_id)
    .bind(body.amount_minor)
    .bind(&body.currency)
    .fetch_one(session.conn())
    .await;
    session.release().await;
    let payment = row?;

    // Every cached read for this tenant is stale now.
    state.cache.invalidate_by_tag(&tenant_tag(tenant_id)).await;

    Ok((StatusCode::CREATED, Json(payment)))
}

pub async fn cancel_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Payment>, Error> {
    let tenant_id = require_tenant()?;
    let tag = tenant_tag(tenant_id);
    let cache_key = format!("{tenant_id}:{id}");

    state.cache.invalidate_by_tag(&tag).await;

    let rls = state.rls.clone();
    let payment = state
        .cache
        .write_through(
            &cache_key,
            CacheOptions {
                ttl_secs: Some(PAYMENT_TTL_SECS),
                namespace: Some(NAMESPACE),
                tags: &[tag.as_str()],
            },
            || async move {
                let mut session = rls.acquire().await?;
                let row = sqlx::query_as::<_, Payment>(
                    "UPDATE payments SET status = 'canceled' \
                     WHERE id = $1 AND status = 'pending' \
                     RETURNING id, tenant_id, amount_minor, currency, status, created_at",
                )
                .bind(id)
                .fetch_optional(session.conn())
                .await;
                session.release().await;
                row?.ok_or_else(|| Error::NotFound(format!("cancelable payment {id}")))
            },
        )
        .await?;

    Ok(Json(payment))
}
