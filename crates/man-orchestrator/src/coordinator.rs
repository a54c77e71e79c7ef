//! The Workflow Coordinator (spec.md §4.6): drives one goal from
//! `GoalReceived` to a terminal state atop an abstract durable executor.
//! Grounded on `tandem-orchestrator::{model, reducer}` for the
//! event/command split, and on `tandem-core::permissions::PermissionManager`
//! for the "register a waiter, signal wakes it" pattern used here for
//! `AwaitingMAN` suspension.
//!
//! Per the design notes in spec.md §9: coroutines + `wait_condition` become
//! an explicit suspension modeled with `tokio::sync::watch` channels; the
//! saga never holds a back-pointer to the coordinator (`execute_with_
//! compensation`/`rollback` take the executor as a parameter).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use man_notify::NotificationDispatcher;
use man_policy::PolicyService;
use man_saga::{CompensationExecutor, SagaContext};
use man_scheduler::{execute_plan_with_pause, StepRunner};
use man_store::ApprovalTaskRepository;
use man_types::{
    ActionIntent, AgentEvent, Decision, IntentFlags, ManDecisionPayload, ManError, ManErrorKind, ManLane, ManPolicy,
    ManTaskStatus, Plan, Step,
};
use serde_json::Value;
use tokio::sync::{watch, Mutex, RwLock};
use uuid::Uuid;

use crate::model::{ForceManModeScope, WorkflowOutcome, WorkflowSnapshot, WorkflowStatus};

/// Tools known to be irreversible / rights-affecting by name, used to derive
/// `ActionIntent.flags` from step metadata (spec.md §4.6 step 3) when the
/// plan itself doesn't carry richer flag annotations.
const IRREVERSIBLE_TOOLS: &[&str] = &["send_email", "call_webhook", "create_record", "delete_record"];
const RIGHTS_AFFECTING_TOOLS: &[&str] = &["update_user", "delete_user", "change_permissions"];
const SENSITIVE_KEY_SUBSTRINGS: &[&str] = &["password", "secret", "token", "key"];

/// Default forward-activity timeout/retry policy (spec.md §5); compensation
/// calls use a shorter timeout via `man_saga::SagaContext::rollback`.
pub const ACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);
pub const COMPENSATION_TIMEOUT: Duration = Duration::from_secs(15);
/// `MAX_HISTORY_SIZE` before a `continue_as_new` snapshot is due (spec.md §4.6).
pub const MAX_HISTORY_SIZE: usize = 1000;

/// The durable executor's activity-invocation surface (spec.md §6),
/// consumed abstractly: `execute_activity(name, args, timeout, retry) ->
/// result`. This also backs `man_saga::CompensationExecutor` — the
/// scheduler is agnostic to whether a call is a forward step or a rollback.
#[async_trait]
pub trait DurableExecutor: Send + Sync {
    async fn execute_activity(&self, name: &str, args: Value, timeout: Duration) -> Result<Value, ManError>;
}

struct ExecutorAdapter<'a> {
    executor: &'a dyn DurableExecutor,
    timeout: Duration,
}

#[async_trait]
impl<'a> CompensationExecutor for ExecutorAdapter<'a> {
    async fn invoke(&self, tool: &str, input: Value) -> Result<Value, ManError> {
        self.executor.execute_activity(tool, input, self.timeout).await
    }
}

fn derive_flags(tool: &str, tool_params: &BTreeMap<String, Value>) -> IntentFlags {
    IntentFlags {
        irreversible: IRREVERSIBLE_TOOLS.contains(&tool),
        affects_rights: RIGHTS_AFFECTING_TOOLS.contains(&tool),
        contains_sensitive_data: tool_params.keys().any(|k| {
            let lower = k.to_lowercase();
            SENSITIVE_KEY_SUBSTRINGS.iter().any(|needle| lower.contains(needle))
        }),
    }
}

/// Identity + wiring for one workflow run. Constructed once per goal by the
/// engine binary / test harness.
pub struct CoordinatorConfig {
    pub tenant_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub user_id: String,
    pub goal: String,
    pub workflow_key: Option<String>,
}

struct ManModeState {
    force_all: AtomicBool,
    force_steps: Mutex<HashSet<String>>,
}

/// Drives one goal's plan execution. `run` suspends internally at pause
/// latches and `AwaitingMAN` waits, and is cancel-aware at every step.
pub struct WorkflowCoordinator {
    config: CoordinatorConfig,
    policy: Arc<PolicyService>,
    tasks: Arc<ApprovalTaskRepository>,
    notifier: Arc<NotificationDispatcher>,
    executor: Arc<dyn DurableExecutor>,
    saga: Mutex<SagaContext>,
    events: Mutex<Vec<AgentEvent>>,
    event_count: AtomicUsize,
    paused: watch::Sender<bool>,
    cancelled: AtomicBool,
    man_mode: ManModeState,
    pending_decisions: RwLock<HashMap<Uuid, watch::Sender<Option<ManDecisionPayload>>>>,
}

impl WorkflowCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        policy: Arc<PolicyService>,
        tasks: Arc<ApprovalTaskRepository>,
        notifier: Arc<NotificationDispatcher>,
        executor: Arc<dyn DurableExecutor>,
    ) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            config,
            policy,
            tasks,
            notifier,
            executor,
            saga: Mutex::new(SagaContext::new()),
            events: Mutex::new(Vec::new()),
            event_count: AtomicUsize::new(0),
            paused,
            cancelled: AtomicBool::new(false),
            man_mode: ManModeState { force_all: AtomicBool::new(false), force_steps: Mutex::new(HashSet::new()) },
            pending_decisions: RwLock::new(HashMap::new()),
        }
    }

    // ---- signals (at-least-once, idempotent) -----------------------------

    pub fn pause(&self) {
        let _ = self.paused.send(true);
    }

    pub fn resume(&self) {
        let _ = self.paused.send(false);
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // Wake every AwaitingMAN waiter so it can observe the cancel latch.
        let pending = self.pending_decisions.try_read();
        if let Ok(pending) = pending {
            for tx in pending.values() {
                let _ = tx.send(tx.borrow().clone());
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub async fn force_man_mode(&self, scope: ForceManModeScope, step_ids: Vec<String>) {
        match scope {
            ForceManModeScope::All => self.man_mode.force_all.store(true, Ordering::SeqCst),
            ForceManModeScope::Steps => self.man_mode.force_steps.lock().await.extend(step_ids),
        }
    }

    // ---- update (at-most-once from the caller) ----------------------------

    /// Wake the step awaiting this task's decision. Persisting the decision
    /// to the repository is a separate call the HTTP layer makes before
    /// this one, so replicas converge even if this in-memory wake is lost
    /// (spec.md §4.6 update semantics).
    pub async fn submit_man_decision(&self, task_id: Uuid, payload: ManDecisionPayload) {
        let pending = self.pending_decisions.read().await;
        if let Some(tx) = pending.get(&task_id) {
            let _ = tx.send(Some(payload));
        }
        // Unknown task ids are silently recorded (late-arriving decisions
        // are harmless, per spec.md §4.6).
    }

    async fn record(&self, event: AgentEvent) {
        self.events.lock().await.push(event);
        self.event_count.fetch_add(1, Ordering::SeqCst);
    }

    pub async fn events(&self) -> Vec<AgentEvent> {
        self.events.lock().await.clone()
    }

    /// Cheap, lock-free check so it can be used as the scheduler's
    /// between-frontiers pause predicate without an `.await`.
    pub fn needs_continue_as_new(&self) -> bool {
        self.event_count.load(Ordering::SeqCst) >= MAX_HISTORY_SIZE
    }

    /// Drop the in-memory event log after a `continue_as_new` snapshot.
    /// Spec.md §4.6 treats events before the cutover as archived, not
    /// replayed into the fresh instance.
    async fn archive_history(&self) {
        self.events.lock().await.clear();
        self.event_count.store(0, Ordering::SeqCst);
    }

    pub async fn snapshot(&self, plan: &Plan, step_results: &HashMap<String, Value>) -> WorkflowSnapshot {
        let saga = self.saga.lock().await;
        WorkflowSnapshot {
            goal: self.config.goal.clone(),
            user_id: self.config.user_id.clone(),
            plan_id: plan.id.clone(),
            plan_steps: plan.steps.clone(),
            step_results: step_results.clone(),
            compensation_stack: saga.compensation_stack().iter().map(Into::into).collect(),
            force_man_mode_all: self.man_mode.force_all.load(Ordering::SeqCst),
            force_man_mode_steps: self.man_mode.force_steps.lock().await.iter().cloned().collect(),
            paused: *self.paused.borrow(),
        }
    }

    /// Drive `plan` to completion via the DAG scheduler, gating RED-lane
    /// steps on operator decision and rolling back on fatal failure.
    pub async fn run(&self, plan: &Plan) -> Result<WorkflowOutcome, ManError> {
        let correlation_id = Uuid::new_v4();
        self.record(AgentEvent::GoalReceived {
            correlation_id,
            workflow_id: self.config.workflow_id.clone(),
            goal: self.config.goal.clone(),
        })
        .await;
        self.record(AgentEvent::PlanGenerated {
            correlation_id,
            workflow_id: self.config.workflow_id.clone(),
            plan_id: plan.id.clone(),
            step_count: plan.steps.len(),
        })
        .await;

        let started_at = Utc::now();
        let mut accumulated: HashMap<String, Value> = HashMap::new();
        let dag_result = loop {
            let attempt = execute_plan_with_pause(plan, self, &accumulated, &|| self.needs_continue_as_new()).await?;
            if !attempt.paused {
                break attempt;
            }
            accumulated = attempt.step_results.clone();
            let _snapshot = self.snapshot(plan, &accumulated).await;
            tracing::info!(
                workflow_id = %self.config.workflow_id,
                plan_id = %plan.id,
                steps_done = accumulated.len(),
                "continue_as_new: event history reached MAX_HISTORY_SIZE, snapshotting and resuming"
            );
            self.archive_history().await;
        };

        if let Some(failed_step_id) = dag_result.failed_step_id.clone() {
            let compensation_results = self.saga.lock().await.rollback(
                &ExecutorAdapter { executor: self.executor.as_ref(), timeout: COMPENSATION_TIMEOUT },
                COMPENSATION_TIMEOUT,
            )
            .await;

            self.record(AgentEvent::WorkflowFailed {
                correlation_id,
                workflow_id: self.config.workflow_id.clone(),
                failed_step_id: failed_step_id.clone(),
                compensation_results: compensation_results.clone(),
            })
            .await;

            let status = if self.is_cancelled() { WorkflowStatus::Cancelled } else { WorkflowStatus::Failed };
            return Ok(WorkflowOutcome {
                status,
                steps_executed: dag_result.executed_step_ids.len(),
                failed_step_id: Some(failed_step_id),
                compensation_results,
                duration_ms: (Utc::now() - started_at).num_milliseconds().max(0) as u64,
            });
        }

        self.record(AgentEvent::WorkflowCompleted {
            correlation_id,
            workflow_id: self.config.workflow_id.clone(),
            steps_executed: dag_result.executed_step_ids.len(),
            duration_ms: (Utc::now() - started_at).num_milliseconds().max(0) as u64,
        })
        .await;

        Ok(WorkflowOutcome {
            status: WorkflowStatus::Completed,
            steps_executed: dag_result.executed_step_ids.len(),
            failed_step_id: None,
            compensation_results: Vec::new(),
            duration_ms: (Utc::now() - started_at).num_milliseconds().max(0) as u64,
        })
    }

    async fn wait_while_paused(&self) {
        let mut rx = self.paused.subscribe();
        loop {
            if !*rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Suspend until a decision for `task_id` arrives, or the cancel latch
    /// wakes us. Models `wait_condition(decision_for(task_id) present)`.
    async fn await_decision(&self, task_id: Uuid) -> Option<ManDecisionPayload> {
        let (tx, mut rx) = watch::channel(None);
        self.pending_decisions.write().await.insert(task_id, tx);

        let decision = loop {
            if self.is_cancelled() {
                break None;
            }
            if let Some(existing) = rx.borrow().clone() {
                break Some(existing);
            }
            if rx.changed().await.is_err() {
                break None;
            }
        };

        self.pending_decisions.write().await.remove(&task_id);
        decision
    }

    fn build_intent(&self, step: &Step, params: &BTreeMap<String, Value>) -> ActionIntent {
        let flags = derive_flags(&step.tool, params);
        ActionIntent::new(
            self.config.tenant_id.clone(),
            self.config.workflow_id.clone(),
            self.config.run_id.clone(),
            step.id.clone(),
            step.tool.clone(),
            params.clone(),
            flags,
        )
    }

    async fn effective_lane(&self, step: &Step, mut triage: man_types::RiskTriageResult) -> man_types::RiskTriageResult {
        let forced = self.man_mode.force_all.load(Ordering::SeqCst)
            || self.man_mode.force_steps.lock().await.contains(&step.id);
        if forced && triage.lane < ManLane::Red {
            triage.lane = ManLane::Red;
            triage.reasons.push("force_man_mode active for this step".to_string());
        }
        triage
    }

    /// The per-step protocol (spec.md §4.6): cancel/pause check, backlog
    /// check, triage, gate, tool call + compensation registration.
    async fn run_step(&self, step: &Step) -> Result<Value, ManError> {
        if self.is_cancelled() {
            return Err(ManError::new(ManErrorKind::Cancelled, false, "workflow cancelled"));
        }
        self.wait_while_paused().await;
        if self.is_cancelled() {
            return Err(ManError::new(ManErrorKind::Cancelled, false, "workflow cancelled"));
        }

        let mut params = step.input.clone();
        let intent = self.build_intent(step, &params);

        let policy = self
            .policy
            .load(Some(self.config.tenant_id.as_str()), self.config.workflow_key.as_deref())
            .await
            .map_err(|e| ManError::new(ManErrorKind::StoreTransient, true, e.to_string()))
            .unwrap_or_default();

        // Backlog check fails open on store errors (spec.md §7).
        let pending_count = self.tasks.count_pending(&self.config.tenant_id).await.unwrap_or(0);
        if pending_count >= policy.max_pending_per_tenant as u64 {
            match policy.degrade_behavior {
                man_types::DegradeBehavior::BlockNew => {
                    return Err(ManError::new(ManErrorKind::BacklogOverloaded, false, "approval backlog exceeded"));
                }
                man_types::DegradeBehavior::ForcePause => {
                    self.pause();
                    self.wait_while_paused().await;
                }
                man_types::DegradeBehavior::AutoDeny => {
                    return Err(ManError::new(ManErrorKind::Denied, false, "auto-denied under backlog degrade"));
                }
            }
        }

        // Triage failures fail open: proceed without the gate (spec.md §7).
        let triage = man_policy::triage(&intent, &policy, self.config.workflow_key.as_deref(), &[]);
        let triage = self.effective_lane(step, triage).await;

        if triage.lane == ManLane::Blocked {
            return Err(ManError::new(ManErrorKind::PolicyBlocked, false, "step blocked by policy"));
        }

        if triage.lane == ManLane::Red {
            let task = self
                .tasks
                .create(intent.clone(), &triage)
                .await
                .map_err(|e| ManError::new(ManErrorKind::StoreTransient, true, e.to_string()))?;

            self.record(AgentEvent::ManTaskOpened {
                correlation_id: Uuid::new_v4(),
                workflow_id: self.config.workflow_id.clone(),
                step_id: step.id.clone(),
                task_id: task.id,
            })
            .await;
            self.notifier.dispatch(&task).await;

            // Record the as-proposed call before awaiting the operator's
            // decision, so a MODIFY still leaves the original input in the
            // event log alongside the modified one recorded below
            // (spec.md §8 Scenario C).
            self.record(AgentEvent::ToolCallRequested {
                correlation_id: Uuid::new_v4(),
                workflow_id: self.config.workflow_id.clone(),
                step_id: step.id.clone(),
                tool_name: step.tool.clone(),
                input: Value::Object(params.clone().into_iter().collect()),
            })
            .await;

            let decision = match self.await_decision(task.id).await {
                Some(d) => d,
                None => {
                    return Err(ManError::new(ManErrorKind::Cancelled, false, "workflow cancelled while awaiting decision"));
                }
            };

            self.record(AgentEvent::ManDecisionApplied {
                correlation_id: Uuid::new_v4(),
                workflow_id: self.config.workflow_id.clone(),
                step_id: step.id.clone(),
                task_id: task.id,
                decision: decision.clone(),
            })
            .await;

            match decision.decision {
                Decision::Approve => {}
                Decision::Modify => {
                    if let Some(modified) = decision.modified_params {
                        for (k, v) in modified {
                            params.insert(k, v);
                        }
                    }
                }
                Decision::Deny => {
                    return Err(ManError::new(ManErrorKind::Denied, false, "operator denied step"));
                }
                Decision::CancelWorkflow => {
                    self.cancel();
                    return Err(ManError::new(ManErrorKind::Cancelled, false, "operator cancelled workflow"));
                }
            }
        }

        self.record(AgentEvent::ToolCallRequested {
            correlation_id: Uuid::new_v4(),
            workflow_id: self.config.workflow_id.clone(),
            step_id: step.id.clone(),
            tool_name: step.tool.clone(),
            input: Value::Object(params.clone().into_iter().collect()),
        })
        .await;

        // Invoke the tool without holding the saga lock: a second concurrent
        // frontier step must not block on this step's activity call. The
        // lock is only taken afterward, briefly, to register the
        // compensation (if any).
        let adapter = ExecutorAdapter { executor: self.executor.as_ref(), timeout: ACTIVITY_TIMEOUT };
        let input_value = Value::Object(params.into_iter().collect());
        let result = adapter.invoke(&step.tool, input_value).await;

        if let Ok(ref value) = result {
            if let Some(comp_tool) = step.compensation.as_deref() {
                let compensation_input: serde_json::Map<String, Value> =
                    step.compensation_input.clone().into_iter().collect();
                let substituted = man_saga::substitute_result_placeholders(&compensation_input, value);
                self.saga.lock().await.register_compensation(comp_tool.to_string(), substituted, step.id.clone());
            }
        }

        self.record(AgentEvent::ToolResultReceived {
            correlation_id: Uuid::new_v4(),
            workflow_id: self.config.workflow_id.clone(),
            step_id: step.id.clone(),
            success: result.is_ok(),
            result: result.as_ref().ok().cloned(),
            error: result.as_ref().err().map(|e| e.to_string()),
        })
        .await;

        result
    }
}

#[async_trait]
impl StepRunner for WorkflowCoordinator {
    async fn run(&self, step: &Step) -> Result<Value, ManError> {
        self.run_step(step).await
    }
}

pub fn task_status_label(status: ManTaskStatus) -> &'static str {
    match status {
        ManTaskStatus::Pending => "PENDING",
        ManTaskStatus::Approved => "APPROVED",
        ManTaskStatus::Denied => "DENIED",
        ManTaskStatus::Modified => "MODIFIED",
        ManTaskStatus::Cancelled => "CANCELLED",
        ManTaskStatus::Expired => "EXPIRED",
    }
}
