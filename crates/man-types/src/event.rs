use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::task::ManDecisionPayload;

/// A single, append-only step result recorded after a compensation runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationResult {
    pub step_id: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Event-sourced log entries. Authoritative state; never mutated once
/// appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    GoalReceived {
        correlation_id: Uuid,
        workflow_id: String,
        goal: String,
    },
    PlanGenerated {
        correlation_id: Uuid,
        workflow_id: String,
        plan_id: String,
        step_count: usize,
    },
    ToolCallRequested {
        correlation_id: Uuid,
        workflow_id: String,
        step_id: String,
        tool_name: String,
        input: Value,
    },
    ToolResultReceived {
        correlation_id: Uuid,
        workflow_id: String,
        step_id: String,
        success: bool,
        result: Option<Value>,
        error: Option<String>,
    },
    ManTaskOpened {
        correlation_id: Uuid,
        workflow_id: String,
        step_id: String,
        task_id: Uuid,
    },
    ManDecisionApplied {
        correlation_id: Uuid,
        workflow_id: String,
        step_id: String,
        task_id: Uuid,
        decision: ManDecisionPayload,
    },
    CompensationExecuted {
        correlation_id: Uuid,
        workflow_id: String,
        step_id: String,
        success: bool,
    },
    WorkflowCompleted {
        correlation_id: Uuid,
        workflow_id: String,
        steps_executed: usize,
        duration_ms: u64,
    },
    WorkflowFailed {
        correlation_id: Uuid,
        workflow_id: String,
        failed_step_id: String,
        compensation_results: Vec<CompensationResult>,
    },
}

impl AgentEvent {
    pub fn workflow_id(&self) -> &str {
        match self {
            AgentEvent::GoalReceived { workflow_id, .. }
            | AgentEvent::PlanGenerated { workflow_id, .. }
            | AgentEvent::ToolCallRequested { workflow_id, .. }
            | AgentEvent::ToolResultReceived { workflow_id, .. }
            | AgentEvent::ManTaskOpened { workflow_id, .. }
            | AgentEvent::ManDecisionApplied { workflow_id, .. }
            | AgentEvent::CompensationExecuted { workflow_id, .. }
            | AgentEvent::WorkflowCompleted { workflow_id, .. }
            | AgentEvent::WorkflowFailed { workflow_id, .. } => workflow_id,
        }
    }

    pub fn correlation_id(&self) -> Uuid {
        match self {
            AgentEvent::GoalReceived { correlation_id, .. }
            | AgentEvent::PlanGenerated { correlation_id, .. }
            | AgentEvent::ToolCallRequested { correlation_id, .. }
            | AgentEvent::ToolResultReceived { correlation_id, .. }
            | AgentEvent::ManTaskOpened { correlation_id, .. }
            | AgentEvent::ManDecisionApplied { correlation_id, .. }
            | AgentEvent::CompensationExecuted { correlation_id, .. }
            | AgentEvent::WorkflowCompleted { correlation_id, .. }
            | AgentEvent::WorkflowFailed { correlation_id, .. } => *correlation_id,
        }
    }
}
