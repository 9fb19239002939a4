use std::future::Future;
use std::time::Instant;

use tokio::task_local;
use uuid::Uuid;

use crate::error::Error;
use crate::tenant::KeyMode;

/// Per-request context carried across every async hop of one request.
///
/// Bound once by the correlation middleware via [`scope`] and readable from
/// anywhere inside that request's call graph with [`current`], so identity is
/// never threaded through handler arguments. Resolution of a tenant does not
/// mutate the bound value; it opens a nested scope with a superset copy, so
/// code running before resolution never observes tenant fields.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Client-supplied or generated; threads one logical request across
    /// services and logs.
    pub correlation_id: String,
    /// Always generated, unique per request.
    pub request_id: String,
    pub started_at: Instant,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub tenant_id: Option<Uuid>,
    pub api_key_id: Option<Uuid>,
    pub key_mode: Option<KeyMode>,
    pub user_id: Option<Uuid>,
    pub user_role: Option<String>,
}

impl RequestContext {
    pub fn new(
        correlation_id: impl Into<String>,
        client_ip: Option<String>,
        user_agent: Option<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            request_id: Uuid::new_v4().to_string(),
            started_at: Instant::now(),
            client_ip,
            user_agent,
            tenant_id: None,
            api_key_id: None,
            key_mode: None,
            user_id: None,
            user_role: None,
        }
    }

    /// Elapsed time since request start.
    pub fn elapsed_ms(&self) -> u128 {
        self.started_at.elapsed().as_millis()
    }

    /// Superset copy extended with tenant identity; the original is untouched.
    pub fn with_identity(&self, tenant_id: Uuid, api_key_id: Uuid, key_mode: KeyMode) -> Self {
        let mut next = self.clone();
        next.tenant_id = Some(tenant_id);
        next.api_key_id = Some(api_key_id);
        next.key_mode = Some(key_mode);
        next
    }

    /// Identifier the rate limiter counts this request under: the API key if
    /// resolved, otherwise the client IP.
    pub fn rate_limit_id(&self) -> Option<String> {
        if let Some(key_id) = self.api_key_id {
            Some(format!("key:{key_id}"))
        } else {
            self.client_ip.as_ref().map(|ip| format!("ip:{ip}"))
        }
    }
}

task_local! {
    static CURRENT: RequestContext;
}

/// Run `fut` (and everything it awaits) with `ctx` bound as the current
/// request context. Nested calls shadow the outer binding for their subtree
/// only; they never merge with or mutate it.
pub async fn scope<F>(ctx: RequestContext, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(ctx, fut).await
}

/// The currently bound context, or `None` outside any [`scope`]. Callers must
/// handle the absent case; background tasks and tests run unbound.
pub fn current() -> Option<RequestContext> {
    CURRENT.try_with(|ctx| ctx.clone()).ok()
}

/// Like [`current`] but absence is an error.
pub fn require() -> Result<RequestContext, Error> {
    current().ok_or(Error::ContextAbsent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_absent_outside_scope() {
        assert!(current().is_none());
        assert!(matches!(require(), Err(Error::ContextAbsent)));
    }

    #[tokio::test]
    async fn test_visible_across_nested_awaits() {
        let ctx = RequestContext::new("corr-1", Some("10.0.0.1".into()), None);
        let request_id = ctx.request_id.clone();

        async fn deep() -> Option<RequestContext> {
            tokio::task::yield_now().await;
            current()
        }

        let seen = scope(ctx, async { deep().await }).await.unwrap();
        assert_eq!(seen.correlation_id, "corr-1");
        assert_eq!(seen.request_id, request_id);
        assert_eq!(seen.client_ip.as_deref(), Some("10.0.0.1"));

        assert!(current().is_none());
    }

    #[tokio::test]
    async fn test_nested_scope_shadows_then_restores() {
        let outer = RequestContext::new("outer", None, None);
        let tenant = Uuid::new_v4();
        let key = Uuid::new_v4();

        scope(outer.clone(), async move {
            let before = current().unwrap();
            assert!(before.tenant_id.is_none());

            let extended = before.with_identity(tenant, key, KeyMode::Live);
            scope(extended, async move {
                let inner = current().unwrap();
                assert_eq!(inner.correlation_id, "outer");
                assert_eq!(inner.tenant_id, Some(tenant));
                assert_eq!(inner.api_key_id, Some(key));
            })
            .await;

            // Back in the outer scope, tenant fields are absent again.
            assert!(current().unwrap().tenant_id.is_none());
        })
        .await;
    }

    #[tokio::test]
    async fn test_concurrent_requests_see_distinct_ids() {
        let mut handles = Vec::new();
        for i in 0..8 {
            handles.push(tokio::spawn(scope(
                RequestContext::new(format!("corr-{i}"), None, None),
                async move {
                    tokio::task::yield_now().await;
                    let ctx = current().unwrap();
                    assert_eq!(ctx.correlation_id, format!("corr-{i}"));
                    ctx.request_id
                },
            )));
        }

        let mut ids = Vec::new();
        for handle in handles {
            let id = handle.await.unwrap();
            assert!(!id.is_empty());
            ids.push(id);
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8);
    }

    #[test]
    fn test_rate_limit_id_prefers_api_key() {
        let ctx = RequestContext::new("c", Some("10.0.0.1".into()), None);
        assert_eq!(ctx.rate_limit_id().unwrap(), "ip:10.0.0.1");

        let key = Uuid::new_v4();
        let extended = ctx.with_identity(Uuid::new_v4(), key, KeyMode::Test);
        assert_eq!(extended.rate_limit_id().unwrap(), format!("key:{key}"));

        let bare = RequestContext::new("c", None, None);
        assert!(bare.rate_limit_id().is_none());
    }
}
