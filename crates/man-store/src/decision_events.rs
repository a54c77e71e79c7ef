//! `man_decision_events`: append-only audit of decisions keyed by `task_id`
//! (spec.md §6). Recorded by `tasks::resolve` alongside the task's status
//! transition; read back by the Operator HTTP API's task-detail endpoint.

use chrono::Utc;
use man_types::ManDecisionPayload;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::store::{Filters, Row, Store};

const TABLE: &str = "man_decision_events";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEventRecord {
    pub id: Uuid,
    pub task_id: Uuid,
    pub decision: ManDecisionPayload,
    pub recorded_at: chrono::DateTime<Utc>,
}

pub async fn record_decision_event(store: &dyn Store, task_id: Uuid, decision: &ManDecisionPayload) -> anyhow::Result<()> {
    let record = DecisionEventRecord {
        id: Uuid::new_v4(),
        task_id,
        decision: decision.clone(),
        recorded_at: Utc::now(),
    };
    let row = match serde_json::to_value(&record)? {
        Value::Object(map) => map,
        _ => unreachable!("DecisionEventRecord always serializes to an object"),
    };
    store.insert(TABLE, row).await?;
    Ok(())
}

pub async fn list_decision_events(store: &dyn Store, task_id: Uuid) -> anyhow::Result<Vec<DecisionEventRecord>> {
    let mut filters = Filters::new();
    filters.insert("task_id".to_string(), Value::String(task_id.to_string()));
    let rows = store.select(TABLE, &filters).await?;
    let mut records = rows
        .into_iter()
        .map(|row| Ok(serde_json::from_value::<DecisionEventRecord>(Value::Object(row))?))
        .collect::<anyhow::Result<Vec<_>>>()?;
    records.sort_by_key(|r| r.recorded_at);
    Ok(records)
}
