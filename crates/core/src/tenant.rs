use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::context;
use crate::error::Error;

/// Length of the stored lookup prefix: `pk_live_`/`pk_test_` plus the first
/// four characters of the random part.
pub const KEY_PREFIX_LEN: usize = 12;

/// Traffic class an API key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "key_mode", rename_all = "lowercase")]
pub enum KeyMode {
    Test,
    Live,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// First [`KEY_PREFIX_LEN`] characters of the key, stored for candidate
    /// lookup; the full key exists only as `secret_hash`.
    pub prefix: String,
    /// bcrypt hash of the full key.
    pub secret_hash: String,
    pub mode: KeyMode,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TenantRecord {
    pub id: Uuid,
    pub name: String,
    pub active: bool,
}

/// Identity attached to the request context once a key resolves.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedIdentity {
    pub tenant_id: Uuid,
    pub api_key_id: Uuid,
    pub key_mode: KeyMode,
}

#[derive(Debug, Clone)]
pub struct KeyUsage {
    pub api_key_id: Uuid,
    pub used_at: DateTime<Utc>,
    pub client_ip: Option<String>,
}

/// Source of tenant and API-key records, supplied by the persistence layer.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn keys_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKeyRecord>, Error>;
    async fn tenant_by_id(&self, tenant_id: Uuid) -> Result<Option<TenantRecord>, Error>;
    async fn record_key_usage(&self, usage: &KeyUsage) -> Result<(), Error>;
}

/// Authenticates API keys and resolves the owning tenant.
///
/// Last-used bookkeeping runs on a supervised background task fed by a
/// bounded queue so it never delays a response; overflow and write failures
/// are logged and dropped.
pub struct TenantResolver {
    directory: Arc<dyn TenantDirectory>,
    usage_tx: mpsc::Sender<KeyUsage>,
}

impl TenantResolver {
    pub fn new(directory: Arc<dyn TenantDirectory>, usage_queue_capacity: usize) -> Self {
        let (usage_tx, usage_rx) = mpsc::channel(usage_queue_capacity.max(1));
        tokio::spawn(record_usage_worker(directory.clone(), usage_rx));
        Self {
            directory,
            usage_tx,
        }
    }

    /// Resolve a presented API key to a tenant identity.
    ///
    /// The prefix narrows the candidate set; the full key is then verified
    /// against each candidate's bcrypt hash, a deliberately slow comparison
    /// that never touches plaintext at rest. Error wording is identical for
    /// unknown, expired, and revoked keys so callers cannot enumerate
    /// accounts; an inactive tenant is the one distinct (authorization)
    /// failure.
    pub async fn resolve(&self, presented: &str) -> Result<ResolvedIdentity, Error> {
        if !(presented.starts_with("pk_live_") || presented.starts_with("pk_test_"))
            || !presented.is_ascii()
            || presented.len() < KEY_PREFIX_LEN
        {
            return Err(invalid_key());
        }
        let prefix = &presented[..KEY_PREFIX_LEN];

        let candidates = self.directory.keys_by_prefix(prefix).await?;
        let now = Utc::now();

        for key in candidates {
            if !bcrypt::verify(presented, &key.secret_hash).unwrap_or(false) {
                continue;
            }
            if key.revoked_at.is_some() {
                return Err(invalid_key());
            }
            if let Some(expires_at) = key.expires_at
                && expires_at <= now
            {
                return Err(invalid_key());
            }

            let tenant = self
                .directory
                .tenant_by_id(key.tenant_id)
                .await?
                .ok_or_else(invalid_key)?;
            if !tenant.active {
                return Err(Error::Authorization("tenant is inactive".into()));
            }

            self.enqueue_usage(KeyUsage {
                api_key_id: key.id,
                used_at: now,
                client_ip: context::current().and_then(|ctx| ctx.client_ip),
            });

            return Ok(ResolvedIdentity {
                tenant_id: key.tenant_id,
                api_key_id: key.id,
                key_mode: key.mode,
            });
        }

        Err(invalid_key())
    }

    fn enqueue_usage(&self, usage: KeyUsage) {
        if self.usage_tx.try_send(usage).is_err() {
            tracing::warn!("last-used queue full, dropping usage record");
        }
    }
}

fn invalid_key() -> Error {
    Error::Authentication("invalid API key".into())
}

async fn record_usage_worker(
    directory: Arc<dyn TenantDirectory>,
    mut usage_rx: mpsc::Receiver<KeyUsage>,
) {
    while let Some(usage) = usage_rx.recv().await {
        if let Err(e) = directory.record_key_usage(&usage).await {
            tracing::warn!(api_key_id = %usage.api_key_id, "failed to record key usage: {e}");
        }
    }
}

// ─── Postgres directory ────────────────────────────────────────────────────

/// [`TenantDirectory`] backed by the control-plane tables. These tables are
/// not tenant-scoped, so no session binding applies here.
pub struct PgTenantDirectory {
    pool: PgPool,
}

impl PgTenantDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantDirectory for PgTenantDirectory {
    async fn keys_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKeyRecord>, Error> {
        let keys = sqlx::query_as::<_, ApiKeyRecord>(
            "SELECT id, tenant_id, prefix, secret_hash, mode, expires_at, revoked_at \
             FROM api_keys WHERE prefix = $1",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }

    async fn tenant_by_id(&self, tenant_id: Uuid) -> Result<Option<TenantRecord>, Error> {
        let tenant = sqlx::query_as::<_, TenantRecord>(
            "SELECT id, name, active FROM tenants WHERE id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tenant)
    }

    async fn record_key_usage(&self, usage: &KeyUsage) -> Result<(), Error> {
        sqlx::query("UPDATE api_keys SET last_used_at = $2, last_used_ip = $3 WHERE id = $1")
            .bind(usage.api_key_id)
            .bind(usage.used_at)
            .bind(usage.client_ip.as_deref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
