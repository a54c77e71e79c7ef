//! Policy Store & Cache (spec.md §4.2). Replaces the source's module-level
//! singleton policy engine and cache dict (spec.md §9) with an explicit
//! `PolicyService` value holding the 30s TTL cache behind a `tokio::sync::
//! Mutex`, constructed once at startup and passed to callers rather than
//! reached for as global state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use man_types::ManPolicy;
use tokio::sync::Mutex;

/// 30-second positive-result cache TTL (spec.md §4.2).
pub const POLICY_CACHE_TTL: Duration = Duration::from_secs(30);

type PolicyKey = (Option<String>, Option<String>);

/// Backing source of policy rows. A production deployment implements this
/// over the `man_policies` table via `man-store::Store`; tests supply a
/// simple in-memory map.
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn fetch(&self, tenant_id: Option<&str>, workflow_key: Option<&str>) -> anyhow::Result<Option<ManPolicy>>;

    async fn upsert(&self, tenant_id: Option<&str>, workflow_key: Option<&str>, policy: ManPolicy) -> anyhow::Result<ManPolicy>;
}

struct CacheEntry {
    policy: ManPolicy,
    cached_at: Instant,
}

/// Resolves `(tenant_id, workflow_key) -> ManPolicy` with lookup order
/// `(tenant, workflow)`, `(tenant, None)`, `(None, None)`, built-in default,
/// caching positive results for `POLICY_CACHE_TTL`. The cache is
/// process-local; `upsert` invalidates the affected entry.
pub struct PolicyService {
    source: Arc<dyn PolicySource>,
    cache: Mutex<HashMap<PolicyKey, CacheEntry>>,
}

impl PolicyService {
    pub fn new(source: Arc<dyn PolicySource>) -> Self {
        Self {
            source,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn load(&self, tenant_id: Option<&str>, workflow_key: Option<&str>) -> anyhow::Result<ManPolicy> {
        let key: PolicyKey = (tenant_id.map(String::from), workflow_key.map(String::from));

        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&key) {
                if entry.cached_at.elapsed() < POLICY_CACHE_TTL {
                    return Ok(entry.policy.clone());
                }
            }
        }

        let resolved = self.resolve_uncached(tenant_id, workflow_key).await?;

        let mut cache = self.cache.lock().await;
        cache.insert(
            key,
            CacheEntry {
                policy: resolved.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(resolved)
    }

    async fn resolve_uncached(&self, tenant_id: Option<&str>, workflow_key: Option<&str>) -> anyhow::Result<ManPolicy> {
        if tenant_id.is_some() && workflow_key.is_some() {
            if let Some(p) = self.source.fetch(tenant_id, workflow_key).await? {
                return Ok(p);
            }
        }
        if tenant_id.is_some() {
            if let Some(p) = self.source.fetch(tenant_id, None).await? {
                return Ok(p);
            }
        }
        if let Some(p) = self.source.fetch(None, None).await? {
            return Ok(p);
        }
        Ok(ManPolicy::default())
    }

    pub async fn upsert(&self, tenant_id: Option<&str>, workflow_key: Option<&str>, policy: ManPolicy) -> anyhow::Result<ManPolicy> {
        let stored = self.source.upsert(tenant_id, workflow_key, policy).await?;
        let key: PolicyKey = (tenant_id.map(String::from), workflow_key.map(String::from));
        self.cache.lock().await.remove(&key);
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct FakeSource {
        rows: Arc<AsyncMutex<HashMap<PolicyKey, ManPolicy>>>,
        fetch_count: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl PolicySource for FakeSource {
        async fn fetch(&self, tenant_id: Option<&str>, workflow_key: Option<&str>) -> anyhow::Result<Option<ManPolicy>> {
            self.fetch_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let key = (tenant_id.map(String::from), workflow_key.map(String::from));
            Ok(self.rows.lock().await.get(&key).cloned())
        }

        async fn upsert(&self, tenant_id: Option<&str>, workflow_key: Option<&str>, policy: ManPolicy) -> anyhow::Result<ManPolicy> {
            let key = (tenant_id.map(String::from), workflow_key.map(String::from));
            self.rows.lock().await.insert(key, policy.clone());
            Ok(policy)
        }
    }

    #[tokio::test]
    async fn falls_back_to_default_policy_when_nothing_stored() {
        let service = PolicyService::new(Arc::new(FakeSource::default()));
        let policy = service.load(Some("t1"), Some("wf1")).await.unwrap();
        assert_eq!(policy.max_pending_per_tenant, 50);
    }

    #[tokio::test]
    async fn lookup_prefers_tenant_workflow_over_tenant_only_over_global() {
        let source = Arc::new(FakeSource::default());
        let mut global = ManPolicy::default();
        global.max_pending_per_tenant = 1;
        source.upsert(None, None, global).await.unwrap();

        let mut tenant_only = ManPolicy::default();
        tenant_only.max_pending_per_tenant = 2;
        source.upsert(Some("t1"), None, tenant_only).await.unwrap();

        let service = PolicyService::new(source);
        assert_eq!(service.load(Some("t1"), Some("wf1")).await.unwrap().max_pending_per_tenant, 2);
        assert_eq!(service.load(Some("t2"), Some("wf9")).await.unwrap().max_pending_per_tenant, 1);
    }

    #[tokio::test]
    async fn positive_results_are_cached_until_upsert_invalidates() {
        let source = Arc::new(FakeSource::default());
        let mut policy = ManPolicy::default();
        policy.max_pending_per_tenant = 5;
        source.upsert(Some("t1"), Some("wf1"), policy).await.unwrap();
        let fetch_count = source.fetch_count.clone();

        let service = PolicyService::new(source);
        service.load(Some("t1"), Some("wf1")).await.unwrap();
        service.load(Some("t1"), Some("wf1")).await.unwrap();
        assert_eq!(fetch_count.load(std::sync::atomic::Ordering::SeqCst), 1);

        let mut updated = ManPolicy::default();
        updated.max_pending_per_tenant = 9;
        service.upsert(Some("t1"), Some("wf1"), updated).await.unwrap();
        let reloaded = service.load(Some("t1"), Some("wf1")).await.unwrap();
        assert_eq!(reloaded.max_pending_per_tenant, 9);
    }
}
