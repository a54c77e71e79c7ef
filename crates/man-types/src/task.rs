use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::intent::ActionIntent;
use crate::triage::RiskTriageResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManTaskStatus {
    Pending,
    Approved,
    Denied,
    Modified,
    Cancelled,
    Expired,
}

impl ManTaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ManTaskStatus::Pending)
    }

    /// `decision` is present iff status != PENDING and != EXPIRED.
    pub fn carries_decision(self) -> bool {
        !matches!(self, ManTaskStatus::Pending | ManTaskStatus::Expired)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Approve,
    Deny,
    Modify,
    CancelWorkflow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManDecisionPayload {
    pub decision: Decision,
    #[serde(default)]
    pub reason: Option<String>,
    pub reviewer_id: String,
    #[serde(default)]
    pub modified_params: Option<Map<String, Value>>,
}

impl Decision {
    pub fn resulting_status(self) -> ManTaskStatus {
        match self {
            Decision::Approve => ManTaskStatus::Approved,
            Decision::Deny => ManTaskStatus::Denied,
            Decision::Modify => ManTaskStatus::Modified,
            Decision::CancelWorkflow => ManTaskStatus::Cancelled,
        }
    }
}

/// A persisted approval record. `(tenant_id, idempotency_key)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManTask {
    pub id: Uuid,
    pub idempotency_key: String,
    pub tenant_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub step_id: String,
    pub tool_name: String,
    pub status: ManTaskStatus,
    pub risk_score: f64,
    pub risk_reasons: Vec<String>,
    pub intent: ActionIntent,
    #[serde(default)]
    pub reviewer_id: Option<String>,
    #[serde(default)]
    pub decision: Option<ManDecisionPayload>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ManTask {
    pub fn new(intent: ActionIntent, triage: &RiskTriageResult, idempotency_key: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            idempotency_key,
            tenant_id: intent.tenant_id.clone(),
            workflow_id: intent.workflow_id.clone(),
            run_id: intent.run_id.clone(),
            step_id: intent.step_id.clone(),
            tool_name: intent.tool_name.clone(),
            status: ManTaskStatus::Pending,
            risk_score: triage.risk_score,
            risk_reasons: triage.reasons.clone(),
            intent,
            reviewer_id: None,
            decision: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_overdue(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.status == ManTaskStatus::Pending && now - self.created_at > ttl
    }
}
