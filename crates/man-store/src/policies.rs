//! A `man_policy::PolicySource` backed by the generic `Store` trait, over
//! the `man_policies` table described in spec.md §6: columns
//! `(tenant_id?, workflow_key?, policy_json, version, updated_by, updated_at)`,
//! unique index on `(tenant_id, workflow_key)` treating NULLs as equal.
//! Grounded on `man-store::tasks::ApprovalTaskRepository` for the
//! row<->typed-value marshalling shape over the same `Store` capability.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use man_policy::PolicySource;
use man_types::ManPolicy;
use serde_json::Value;

use crate::store::{Filters, Row, Store};

const TABLE: &str = "man_policies";

fn key_filters(tenant_id: Option<&str>, workflow_key: Option<&str>) -> Filters {
    let mut filters = Filters::new();
    filters.insert(
        "tenant_id".to_string(),
        tenant_id.map(Value::from).unwrap_or(Value::Null),
    );
    filters.insert(
        "workflow_key".to_string(),
        workflow_key.map(Value::from).unwrap_or(Value::Null),
    );
    filters
}

/// Reads/writes `ManPolicy` rows through the `Store` capability interface;
/// `PolicyService` (man-policy) layers the 30s TTL cache on top of this.
pub struct StoreBackedPolicySource {
    store: Arc<dyn Store>,
    next_version: AtomicU64,
}

impl StoreBackedPolicySource {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, next_version: AtomicU64::new(1) }
    }
}

#[async_trait]
impl PolicySource for StoreBackedPolicySource {
    async fn fetch(&self, tenant_id: Option<&str>, workflow_key: Option<&str>) -> anyhow::Result<Option<ManPolicy>> {
        let filters = key_filters(tenant_id, workflow_key);
        let Some(row) = self.store.select_one(TABLE, &filters).await? else {
            return Ok(None);
        };
        let Some(policy_json) = row.get("policy_json") else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(policy_json.clone())?))
    }

    async fn upsert(&self, tenant_id: Option<&str>, workflow_key: Option<&str>, policy: ManPolicy) -> anyhow::Result<ManPolicy> {
        anyhow::ensure!(policy.thresholds_valid(), "yellow threshold must be <= red threshold");

        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let mut record = Row::new();
        record.insert(
            "tenant_id".to_string(),
            tenant_id.map(Value::from).unwrap_or(Value::Null),
        );
        record.insert(
            "workflow_key".to_string(),
            workflow_key.map(Value::from).unwrap_or(Value::Null),
        );
        record.insert("policy_json".to_string(), serde_json::to_value(&policy)?);
        record.insert("version".to_string(), Value::from(version));
        record.insert("updated_at".to_string(), Value::String(Utc::now().to_rfc3339()));

        self.store.upsert(TABLE, record, &["tenant_id", "workflow_key"]).await?;
        Ok(policy)
    }
}

/// Same as `upsert`, additionally stamping `updated_by` — split out because
/// the HTTP layer (spec.md §6 `PUT /api/v1/man/policies`) takes the actor's
/// identity as a query parameter, while `PolicySource::upsert` does not.
pub async fn upsert_with_audit(
    store: &dyn Store,
    tenant_id: Option<&str>,
    workflow_key: Option<&str>,
    policy: &ManPolicy,
    updated_by: &str,
    version: u64,
) -> anyhow::Result<()> {
    anyhow::ensure!(policy.thresholds_valid(), "yellow threshold must be <= red threshold");
    let mut record = Row::new();
    record.insert(
        "tenant_id".to_string(),
        tenant_id.map(Value::from).unwrap_or(Value::Null),
    );
    record.insert(
        "workflow_key".to_string(),
        workflow_key.map(Value::from).unwrap_or(Value::Null),
    );
    record.insert("policy_json".to_string(), serde_json::to_value(policy)?);
    record.insert("version".to_string(), Value::from(version));
    record.insert("updated_by".to_string(), Value::String(updated_by.to_string()));
    record.insert("updated_at".to_string(), Value::String(Utc::now().to_rfc3339()));
    store.upsert(TABLE, record, &["tenant_id", "workflow_key"]).await?;
    Ok(())
}

/// List stored policy rows matching the given tenant/workflow filter,
/// for the `GET /api/v1/man/policies` listing endpoint. `None` in either
/// filter means "don't care" and matches rows of any value for that column,
/// mirroring `GET` query-parameter semantics rather than the NULL-match
/// semantics `fetch` uses for cache-key resolution.
pub async fn list_policy_rows(store: &dyn Store, tenant_id: Option<&str>, workflow_key: Option<&str>) -> anyhow::Result<Vec<Row>> {
    let mut filters = Filters::new();
    if let Some(t) = tenant_id {
        filters.insert("tenant_id".to_string(), Value::String(t.to_string()));
    }
    if let Some(w) = workflow_key {
        filters.insert("workflow_key".to_string(), Value::String(w.to_string()));
    }
    store.select(TABLE, &filters).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn fetch_returns_none_when_nothing_stored() {
        let source = StoreBackedPolicySource::new(Arc::new(InMemoryStore::new()));
        assert!(source.fetch(Some("t1"), Some("wf1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_then_fetch_roundtrips() {
        let source = StoreBackedPolicySource::new(Arc::new(InMemoryStore::new()));
        let mut policy = ManPolicy::default();
        policy.max_pending_per_tenant = 7;
        source.upsert(Some("t1"), Some("wf1"), policy).await.unwrap();

        let fetched = source.fetch(Some("t1"), Some("wf1")).await.unwrap().unwrap();
        assert_eq!(fetched.max_pending_per_tenant, 7);
    }

    #[tokio::test]
    async fn global_and_tenant_scoped_rows_are_distinct() {
        let source = StoreBackedPolicySource::new(Arc::new(InMemoryStore::new()));
        let mut global = ManPolicy::default();
        global.max_pending_per_tenant = 1;
        source.upsert(None, None, global).await.unwrap();

        let mut tenant = ManPolicy::default();
        tenant.max_pending_per_tenant = 2;
        source.upsert(Some("t1"), None, tenant).await.unwrap();

        assert_eq!(source.fetch(None, None).await.unwrap().unwrap().max_pending_per_tenant, 1);
        assert_eq!(source.fetch(Some("t1"), None).await.unwrap().unwrap().max_pending_per_tenant, 2);
    }

    #[tokio::test]
    async fn upsert_rejects_invalid_thresholds() {
        let source = StoreBackedPolicySource::new(Arc::new(InMemoryStore::new()));
        let mut policy = ManPolicy::default();
        policy.global_thresholds.yellow = 0.9;
        policy.global_thresholds.red = 0.5;
        assert!(source.upsert(Some("t1"), None, policy).await.is_err());
    }
}
