//! Approval Task Repository (spec.md §4.3): idempotent create/read/resolve
//! of `man_tasks` rows, backed by the `Store` capability interface. Grounded
//! on `original_source/orchestrator/providers/database/base.py` for the
//! repository shape and `original_source/orchestrator/models/man_mode.py`
//! for the idempotency-key recipe.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use man_observability::canonical_json;
use man_types::{ActionIntent, Decision, ManDecisionPayload, ManTask, ManTaskStatus, RiskTriageResult};
use serde_json::Value;
use uuid::Uuid;

use crate::decision_events::record_decision_event;
use crate::store::{Filters, Row, Store};

const TABLE: &str = "man_tasks";

/// Holds the store behind a trait object so the Workflow Coordinator, the
/// HTTP API, and the TTL expirer sweep can share one backing store instance
/// (matching the teacher's `Arc<dyn Tool>`/`Arc<dyn Provider>` pattern for
/// pluggable backends).
#[derive(Clone)]
pub struct ApprovalTaskRepository {
    store: Arc<dyn Store>,
}

/// `join("|", [tenant_id, workflow_id, step_id, tool_name, canonical_json(tool_params)])`
/// (spec.md §4.3). The canonical JSON of `tool_params` ensures key order and
/// formatting never change the derived key, matching `canonical_json`'s
/// sorted-key guarantee in `man-observability`.
pub fn idempotency_key(intent: &ActionIntent) -> String {
    let params_value: BTreeMap<String, Value> = intent.tool_params.clone();
    let params_json = canonical_json(&Value::Object(params_value.into_iter().collect()));
    [
        intent.tenant_id.as_str(),
        intent.workflow_id.as_str(),
        intent.step_id.as_str(),
        intent.tool_name.as_str(),
        params_json.as_str(),
    ]
    .join("|")
}

fn task_to_row(task: &ManTask) -> Row {
    match serde_json::to_value(task).expect("ManTask always serializes") {
        Value::Object(map) => map,
        _ => unreachable!("ManTask serializes to a JSON object"),
    }
}

fn row_to_task(row: Row) -> anyhow::Result<ManTask> {
    Ok(serde_json::from_value(Value::Object(row))?)
}

impl ApprovalTaskRepository {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Create (or return the existing) approval task for this intent.
    /// Only meaningful when `triage.lane` is RED; callers that invoke this
    /// for any other lane have a scheduler bug.
    pub async fn create(&self, intent: ActionIntent, triage: &RiskTriageResult) -> anyhow::Result<ManTask> {
        anyhow::ensure!(
            triage.lane == man_types::ManLane::Red,
            "approval tasks are only created for RED-lane triage results"
        );

        let key = idempotency_key(&intent);
        let mut filters = Filters::new();
        filters.insert("tenant_id".to_string(), Value::String(intent.tenant_id.clone()));
        filters.insert("idempotency_key".to_string(), Value::String(key.clone()));
        if let Some(existing) = self.store.select_one(TABLE, &filters).await? {
            return row_to_task(existing);
        }

        let task = ManTask::new(intent, triage, key);
        let row = self
            .store
            .upsert(TABLE, task_to_row(&task), &["tenant_id", "idempotency_key"])
            .await?;
        row_to_task(row)
    }

    pub async fn get(&self, task_id: Uuid) -> anyhow::Result<Option<ManTask>> {
        let mut filters = Filters::new();
        filters.insert("id".to_string(), Value::String(task_id.to_string()));
        match self.store.select_one(TABLE, &filters).await? {
            Some(row) => Ok(Some(row_to_task(row)?)),
            None => Ok(None),
        }
    }

    /// `UPDATE ... WHERE id = ? AND status = 'PENDING'` gate: the first
    /// decision wins, subsequent calls return the existing terminal row
    /// unchanged (spec.md invariant 3 and Scenario E).
    pub async fn resolve(&self, task_id: Uuid, decision: ManDecisionPayload) -> anyhow::Result<ManTask> {
        record_decision_event(self.store.as_ref(), task_id, &decision).await?;

        let mut gate = Filters::new();
        gate.insert("id".to_string(), Value::String(task_id.to_string()));
        gate.insert("status".to_string(), Value::String("PENDING".to_string()));

        let resulting_status = decision.decision.resulting_status();
        let mut updates = Row::new();
        updates.insert("status".to_string(), serde_json::to_value(resulting_status)?);
        updates.insert("reviewer_id".to_string(), Value::String(decision.reviewer_id.clone()));
        updates.insert("decision".to_string(), serde_json::to_value(&decision)?);
        updates.insert("updated_at".to_string(), Value::String(Utc::now().to_rfc3339()));

        if let Some(updated) = self.store.update(TABLE, &gate, updates).await? {
            return row_to_task(updated);
        }

        self.get(task_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("unknown task {task_id}"))
    }

    pub async fn list(&self, filters: Filters, limit: usize, offset: usize) -> anyhow::Result<(Vec<ManTask>, usize)> {
        let rows = self.store.select(TABLE, &filters).await?;
        let total = rows.len();
        let page = rows
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(row_to_task)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok((page, total))
    }

    pub async fn count_pending(&self, tenant_id: &str) -> anyhow::Result<u64> {
        let mut filters = Filters::new();
        filters.insert("tenant_id".to_string(), Value::String(tenant_id.to_string()));
        filters.insert("status".to_string(), Value::String("PENDING".to_string()));
        Ok(self.store.select(TABLE, &filters).await?.len() as u64)
    }

    /// Sweep PENDING tasks whose TTL has elapsed and promote them to
    /// EXPIRED, returning the tasks actually promoted so a caller can wake
    /// any step suspended in `await_decision` for each one (spec.md §5/§7:
    /// `DecisionExpired` wakes waiters like a DENY). `ttl_for_tenant`
    /// resolves the policy-derived TTL per tenant, falling back to the
    /// default when the caller has no override.
    pub async fn expire_overdue(
        &self,
        ttl_for_tenant: impl Fn(&str) -> Duration,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<ManTask>> {
        let mut pending_filter = Filters::new();
        pending_filter.insert("status".to_string(), Value::String("PENDING".to_string()));
        let pending_rows = self.store.select(TABLE, &pending_filter).await?;

        let mut expired = Vec::new();
        for row in pending_rows {
            let task = row_to_task(row)?;
            let ttl = ttl_for_tenant(&task.tenant_id);
            if task.is_overdue(ttl, now) {
                let mut gate = Filters::new();
                gate.insert("id".to_string(), Value::String(task.id.to_string()));
                gate.insert("status".to_string(), Value::String("PENDING".to_string()));
                let mut updates = Row::new();
                updates.insert("status".to_string(), serde_json::to_value(ManTaskStatus::Expired)?);
                updates.insert("updated_at".to_string(), Value::String(now.to_rfc3339()));
                if let Some(updated) = self.store.update(TABLE, &gate, updates).await? {
                    expired.push(row_to_task(updated)?);
                }
            }
        }
        Ok(expired)
    }
}

/// `DecisionExpired` is treated like DENY for downstream waiters (spec.md §7).
pub fn expired_as_denial(reviewer_id: &str) -> ManDecisionPayload {
    ManDecisionPayload {
        decision: Decision::Deny,
        reason: Some("approval task TTL exceeded".to_string()),
        reviewer_id: reviewer_id.to_string(),
        modified_params: None,
    }
}
