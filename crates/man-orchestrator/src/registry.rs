//! In-process registry of running `WorkflowCoordinator`s, keyed by
//! `workflow_id`. Grounded on `tandem-server::RunRegistry` (an `Arc<RwLock<
//! HashMap<...>>>` of live run state, looked up by id from HTTP handlers).
//!
//! The durable executor itself is out of scope (spec.md §1); this registry
//! is the thin in-process stand-in the Operator HTTP API and the `worker`/
//! `submit` CLI modes use to locate a workflow's coordinator for signals,
//! updates, and status reads. A deployment atop a real durable substrate
//! would replace this with a lookup into that substrate instead.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use man_notify::NotificationDispatcher;
use man_policy::PolicyService;
use man_store::ApprovalTaskRepository;
use man_types::{ManError, Plan};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::coordinator::{CoordinatorConfig, DurableExecutor};
use crate::model::{ForceManModeScope, WorkflowOutcome};
use crate::WorkflowCoordinator;

/// The LLM planner is an external collaborator (spec.md §1); this is the
/// narrow interface the core demands of it: turn a goal into a `Plan`.
/// Consumers (the engine binary, the HTTP API) supply a real implementation
/// or fall back to `StubPlanner` for local testing.
#[async_trait]
pub trait GoalPlanner: Send + Sync {
    async fn plan_for_goal(&self, workflow_id: &str, goal: &str) -> Result<Plan, ManError>;
}

/// Deterministic single-step planner used by the `test` CLI mode and as the
/// registry's default: turns the goal into one `noop` tool call so the DAG
/// scheduler and MAN-mode gate have something real to execute without a
/// live planner or semantic cache wired in.
pub struct StubPlanner;

#[async_trait]
impl GoalPlanner for StubPlanner {
    async fn plan_for_goal(&self, workflow_id: &str, goal: &str) -> Result<Plan, ManError> {
        Ok(Plan {
            id: format!("plan-{workflow_id}"),
            steps: vec![man_types::Step {
                id: "s1".to_string(),
                name: "execute_goal".to_string(),
                tool: "noop".to_string(),
                input: std::collections::BTreeMap::from([(
                    "goal".to_string(),
                    serde_json::Value::String(goal.to_string()),
                )]),
                depends_on: Vec::new(),
                compensation: None,
                compensation_input: std::collections::BTreeMap::new(),
            }],
        })
    }
}

#[derive(Debug, Clone)]
pub enum WorkflowRunState {
    Running,
    Finished(WorkflowOutcome),
    Crashed(String),
}

pub struct WorkflowEntry {
    pub coordinator: Arc<WorkflowCoordinator>,
    pub state: RwLock<WorkflowRunState>,
    pub started_at: DateTime<Utc>,
}

/// Shared collaborators every workflow in this process runs against: one
/// policy service, one approval-task repository, one notifier, and a
/// `DurableExecutor` the engine wires to real tool activities.
#[derive(Clone)]
pub struct WorkflowDeps {
    pub policy: Arc<PolicyService>,
    pub tasks: Arc<ApprovalTaskRepository>,
    pub notifier: Arc<NotificationDispatcher>,
    pub executor: Arc<dyn DurableExecutor>,
    pub planner: Arc<dyn GoalPlanner>,
}

#[derive(Default)]
pub struct WorkflowRegistry {
    entries: RwLock<HashMap<String, Arc<WorkflowEntry>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, workflow_id: &str) -> Option<Arc<WorkflowEntry>> {
        self.entries.read().await.get(workflow_id).cloned()
    }

    pub async fn list_ids(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// `POST /api/v1/goals` (spec.md §6): plan the goal, register a fresh
    /// coordinator under a new `workflow_id`, and drive it to completion in
    /// a background task. Returns immediately with the assigned id.
    pub async fn submit_goal(
        &self,
        deps: WorkflowDeps,
        tenant_id: String,
        user_id: String,
        goal: String,
        workflow_key: Option<String>,
    ) -> Result<String, ManError> {
        let workflow_id = Uuid::new_v4().to_string();
        let run_id = Uuid::new_v4().to_string();
        let plan = deps.planner.plan_for_goal(&workflow_id, &goal).await?;

        let config = CoordinatorConfig {
            tenant_id,
            workflow_id: workflow_id.clone(),
            run_id,
            user_id,
            goal,
            workflow_key,
        };
        let coordinator = Arc::new(WorkflowCoordinator::new(
            config,
            deps.policy,
            deps.tasks,
            deps.notifier,
            deps.executor,
        ));
        let entry = Arc::new(WorkflowEntry {
            coordinator: coordinator.clone(),
            state: RwLock::new(WorkflowRunState::Running),
            started_at: Utc::now(),
        });
        self.entries.write().await.insert(workflow_id.clone(), entry.clone());

        tokio::spawn(async move {
            let outcome = coordinator.run(&plan).await;
            let mut state = entry.state.write().await;
            *state = match outcome {
                Ok(o) => WorkflowRunState::Finished(o),
                Err(e) => WorkflowRunState::Crashed(e.to_string()),
            };
        });

        Ok(workflow_id)
    }

    pub async fn pause(&self, workflow_id: &str) -> bool {
        match self.get(workflow_id).await {
            Some(entry) => {
                entry.coordinator.pause();
                true
            }
            None => false,
        }
    }

    pub async fn resume(&self, workflow_id: &str) -> bool {
        match self.get(workflow_id).await {
            Some(entry) => {
                entry.coordinator.resume();
                true
            }
            None => false,
        }
    }

    pub async fn cancel(&self, workflow_id: &str) -> bool {
        match self.get(workflow_id).await {
            Some(entry) => {
                entry.coordinator.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn force_man_mode(&self, workflow_id: &str, scope: ForceManModeScope, step_ids: Vec<String>) -> bool {
        match self.get(workflow_id).await {
            Some(entry) => {
                entry.coordinator.force_man_mode(scope, step_ids).await;
                true
            }
            None => false,
        }
    }

    /// Wake the in-memory waiter for `task_id` if any workflow in this
    /// process is currently awaiting it. Unlike signals, decisions are not
    /// addressed by `workflow_id` (spec.md §4.6 update semantics), so every
    /// live coordinator is offered the decision; at most one will actually
    /// be waiting on this `task_id`.
    pub async fn submit_man_decision(&self, task_id: Uuid, payload: man_types::ManDecisionPayload) {
        let entries: Vec<Arc<WorkflowEntry>> = self.entries.read().await.values().cloned().collect();
        for entry in entries {
            entry.coordinator.submit_man_decision(task_id, payload.clone()).await;
        }
    }

    /// Called by the TTL-expirer sweep (`man-engine`'s `worker` mode, the
    /// Operator HTTP API's background task) for every task it promotes to
    /// EXPIRED. The expirer only knows the task id, not which live
    /// coordinator (if any) is hosting it, so this reuses the same
    /// broadcast-and-let-at-most-one-match shape as `submit_man_decision`.
    pub async fn notify_expired(&self, task_id: Uuid) {
        self.submit_man_decision(task_id, man_store::expired_as_denial("ttl-expirer")).await;
    }
}
