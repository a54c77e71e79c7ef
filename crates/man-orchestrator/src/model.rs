//! State shapes for the Workflow Coordinator (spec.md §4.6), generalized
//! from `tandem-orchestrator::model`'s `MissionState`/`MissionEvent` split
//! between "what happened" (event log) and "what we snapshot to resume".

use std::collections::HashMap;

use man_types::CompensationResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    AwaitingMan,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForceManModeScope {
    All,
    Steps,
}

/// Minimal `continue_as_new` snapshot (spec.md §4.6): goal, identity, plan,
/// step results so far, the saga's pending compensation stack, and the
/// MAN-mode force flags. Events before the cutover are archived, not
/// replayed into the fresh instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub goal: String,
    pub user_id: String,
    pub plan_id: String,
    pub plan_steps: Vec<man_types::Step>,
    pub step_results: HashMap<String, Value>,
    pub compensation_stack: Vec<SerializableCompensationStep>,
    pub force_man_mode_all: bool,
    pub force_man_mode_steps: Vec<String>,
    pub paused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializableCompensationStep {
    pub activity_name: String,
    pub input: serde_json::Map<String, Value>,
    pub step_id: String,
}

impl From<&man_saga::CompensationStep> for SerializableCompensationStep {
    fn from(step: &man_saga::CompensationStep) -> Self {
        Self {
            activity_name: step.activity_name.clone(),
            input: step.input.clone(),
            step_id: step.step_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowOutcome {
    pub status: WorkflowStatus,
    pub steps_executed: usize,
    pub failed_step_id: Option<String>,
    pub compensation_results: Vec<CompensationResult>,
    pub duration_ms: u64,
}
