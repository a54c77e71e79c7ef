//! End-to-end scenarios A-G (spec.md §8) driven through `WorkflowCoordinator`
//! against an in-memory store, a fake policy source, and a recording fake
//! `DurableExecutor` — no network, no real durable substrate.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use man_notify::{NotificationConfig, NotificationDispatcher};
use man_orchestrator::{CoordinatorConfig, DurableExecutor, WorkflowCoordinator, WorkflowStatus};
use man_policy::{PolicyService, PolicySource};
use man_store::ApprovalTaskRepository;
use man_store::InMemoryStore;
use man_types::{Decision, ManDecisionPayload, ManError, ManLane, ManPolicy, Plan, RiskTriageResult, Step};
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;

#[derive(Default)]
struct FakePolicySource {
    rows: AsyncMutex<HashMap<(Option<String>, Option<String>), ManPolicy>>,
}

#[async_trait]
impl PolicySource for FakePolicySource {
    async fn fetch(&self, tenant_id: Option<&str>, workflow_key: Option<&str>) -> anyhow::Result<Option<ManPolicy>> {
        let key = (tenant_id.map(String::from), workflow_key.map(String::from));
        Ok(self.rows.lock().await.get(&key).cloned())
    }

    async fn upsert(&self, tenant_id: Option<&str>, workflow_key: Option<&str>, policy: ManPolicy) -> anyhow::Result<ManPolicy> {
        let key = (tenant_id.map(String::from), workflow_key.map(String::from));
        self.rows.lock().await.insert(key, policy.clone());
        Ok(policy)
    }
}

struct FakeExecutor {
    calls: AsyncMutex<Vec<(String, Value)>>,
    results: HashMap<String, Value>,
}

impl FakeExecutor {
    fn new(results: HashMap<String, Value>) -> Self {
        Self { calls: AsyncMutex::new(Vec::new()), results }
    }

    async fn call_log(&self) -> Vec<(String, Value)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl DurableExecutor for FakeExecutor {
    async fn execute_activity(&self, name: &str, args: Value, _timeout: Duration) -> Result<Value, ManError> {
        self.calls.lock().await.push((name.to_string(), args));
        Ok(self.results.get(name).cloned().unwrap_or(Value::Null))
    }
}

fn step(id: &str, tool: &str, input: &[(&str, Value)], deps: &[&str]) -> Step {
    Step {
        id: id.to_string(),
        name: id.to_string(),
        tool: tool.to_string(),
        input: input.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        depends_on: deps.iter().map(|s| s.to_string()).collect(),
        compensation: None,
        compensation_input: BTreeMap::new(),
    }
}

async fn new_coordinator(
    policy: ManPolicy,
    executor: Arc<FakeExecutor>,
) -> (Arc<WorkflowCoordinator>, Arc<ApprovalTaskRepository>) {
    let source = Arc::new(FakePolicySource::default());
    source.upsert(None, None, policy).await.unwrap();
    let policy_service = Arc::new(PolicyService::new(source));
    let tasks = Arc::new(ApprovalTaskRepository::new(Arc::new(InMemoryStore::new())));
    let notifier = Arc::new(NotificationDispatcher::new(NotificationConfig::default()));
    let config = CoordinatorConfig {
        tenant_id: "t1".to_string(),
        workflow_id: "wf1".to_string(),
        run_id: "r1".to_string(),
        user_id: "u1".to_string(),
        goal: "test goal".to_string(),
        workflow_key: None,
    };
    let coordinator = Arc::new(WorkflowCoordinator::new(
        config,
        policy_service,
        tasks.clone(),
        notifier,
        executor as Arc<dyn DurableExecutor>,
    ));
    (coordinator, tasks)
}

/// Scenario A — GREEN straight-through.
#[tokio::test]
async fn scenario_a_green_straight_through_completes_without_a_task() {
    let executor = Arc::new(FakeExecutor::new(HashMap::new()));
    let (coordinator, tasks) = new_coordinator(ManPolicy::default(), executor.clone()).await;

    let plan = Plan {
        id: "p1".to_string(),
        steps: vec![step(
            "s1",
            "search_database",
            &[("table", json!("users")), ("filter", json!({"id": "123"}))],
            &[],
        )],
    };

    let outcome = coordinator.run(&plan).await.unwrap();
    assert_eq!(outcome.status, WorkflowStatus::Completed);
    assert_eq!(outcome.steps_executed, 1);
    assert_eq!(executor.call_log().await.len(), 1);
    assert_eq!(tasks.count_pending("t1").await.unwrap(), 0);
}

/// Scenario B — RED with APPROVE.
#[tokio::test]
async fn scenario_b_red_with_approve_resumes_and_calls_tool_once() {
    let mut policy = ManPolicy::default();
    policy.tool_minimum_lanes.insert("delete_record".to_string(), ManLane::Red);
    let executor = Arc::new(FakeExecutor::new(HashMap::new()));
    let (coordinator, tasks) = new_coordinator(policy, executor.clone()).await;

    let mut s1 = step("s1", "delete_record", &[("id", json!(42))], &[]);
    s1.compensation = Some("undo_delete".to_string());
    let plan = Plan { id: "p1".to_string(), steps: vec![s1] };

    let run_handle = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run(&plan).await })
    };

    let task = wait_for_pending_task(&tasks, "t1").await;
    assert_eq!(task.idempotency_key, "t1|wf1|s1|delete_record|{\"id\":42}");

    tasks
        .resolve(
            task.id,
            ManDecisionPayload {
                decision: Decision::Approve,
                reason: Some("ok".to_string()),
                reviewer_id: "r1".to_string(),
                modified_params: None,
            },
        )
        .await
        .unwrap();
    coordinator
        .submit_man_decision(
            task.id,
            ManDecisionPayload {
                decision: Decision::Approve,
                reason: Some("ok".to_string()),
                reviewer_id: "r1".to_string(),
                modified_params: None,
            },
        )
        .await;

    let outcome = run_handle.await.unwrap().unwrap();
    assert_eq!(outcome.status, WorkflowStatus::Completed);
    assert_eq!(executor.call_log().await, vec![("delete_record".to_string(), json!({"id": 42}))]);
}

/// Scenario C — RED with MODIFY: the tool is invoked with the operator's
/// modified params rather than the original ones.
#[tokio::test]
async fn scenario_c_red_with_modify_invokes_tool_with_modified_params() {
    let mut policy = ManPolicy::default();
    policy.tool_minimum_lanes.insert("delete_record".to_string(), ManLane::Red);
    let executor = Arc::new(FakeExecutor::new(HashMap::new()));
    let (coordinator, tasks) = new_coordinator(policy, executor.clone()).await;

    let mut s1 = step("s1", "delete_record", &[("id", json!(42))], &[]);
    s1.compensation = Some("undo_delete".to_string());
    let plan = Plan { id: "p1".to_string(), steps: vec![s1] };

    let run_handle = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run(&plan).await })
    };

    let task = wait_for_pending_task(&tasks, "t1").await;
    let modified = json!({"id": 42, "soft": true}).as_object().unwrap().clone();
    coordinator
        .submit_man_decision(
            task.id,
            ManDecisionPayload {
                decision: Decision::Modify,
                reason: None,
                reviewer_id: "r1".to_string(),
                modified_params: Some(modified),
            },
        )
        .await;

    let outcome = run_handle.await.unwrap().unwrap();
    assert_eq!(outcome.status, WorkflowStatus::Completed);
    assert_eq!(
        executor.call_log().await,
        vec![("delete_record".to_string(), json!({"id": 42, "soft": true}))]
    );

    let events = coordinator.events().await;
    let tool_call_inputs: Vec<&Value> = events
        .iter()
        .filter_map(|e| match e {
            man_types::AgentEvent::ToolCallRequested { input, .. } => Some(input),
            _ => None,
        })
        .collect();
    // Both the original (pre-MODIFY) and the modified input are recorded.
    assert_eq!(tool_call_inputs, vec![&json!({"id": 42}), &json!({"id": 42, "soft": true})]);
}

/// Scenario D — DENY triggers rollback of the already-succeeded step.
#[tokio::test]
async fn scenario_d_deny_triggers_rollback_of_prior_step() {
    let mut policy = ManPolicy::default();
    policy.tool_minimum_lanes.insert("send_email".to_string(), ManLane::Red);
    let mut results = HashMap::new();
    results.insert("book_flight".to_string(), json!({"booking_id": "BK-9"}));
    let executor = Arc::new(FakeExecutor::new(results));
    let (coordinator, tasks) = new_coordinator(policy, executor.clone()).await;

    let mut s1 = step("s1", "book_flight", &[("to", json!("CDG"))], &[]);
    s1.compensation = Some("cancel_flight".to_string());
    s1.compensation_input = BTreeMap::from([("booking_id".to_string(), json!("{result.booking_id}"))]);
    let s2 = step("s2", "send_email", &[], &["s1"]);
    let plan = Plan { id: "p1".to_string(), steps: vec![s1, s2] };

    let run_handle = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run(&plan).await })
    };

    let task = wait_for_pending_task(&tasks, "t1").await;
    assert_eq!(task.step_id, "s2");
    coordinator
        .submit_man_decision(
            task.id,
            ManDecisionPayload {
                decision: Decision::Deny,
                reason: Some("not today".to_string()),
                reviewer_id: "r1".to_string(),
                modified_params: None,
            },
        )
        .await;

    let outcome = run_handle.await.unwrap().unwrap();
    assert_eq!(outcome.status, WorkflowStatus::Failed);
    assert_eq!(outcome.failed_step_id.as_deref(), Some("s2"));
    assert_eq!(outcome.compensation_results.len(), 1);
    assert_eq!(outcome.compensation_results[0].step_id, "s1");
    assert!(outcome.compensation_results[0].success);

    let calls = executor.call_log().await;
    assert_eq!(calls.iter().filter(|(name, _)| name == "cancel_flight").count(), 1);
    let (_, cancel_input) = calls.iter().find(|(name, _)| name == "cancel_flight").unwrap();
    assert_eq!(cancel_input["booking_id"], json!("BK-9"));
}

/// Scenario E — idempotent decision: resolving twice returns the same
/// terminal task and the tool runs exactly once.
#[tokio::test]
async fn scenario_e_idempotent_decision_tool_invoked_once() {
    let mut policy = ManPolicy::default();
    policy.tool_minimum_lanes.insert("delete_record".to_string(), ManLane::Red);
    let executor = Arc::new(FakeExecutor::new(HashMap::new()));
    let (coordinator, tasks) = new_coordinator(policy, executor.clone()).await;

    let s1 = step("s1", "delete_record", &[("id", json!(7))], &[]);
    let plan = Plan { id: "p1".to_string(), steps: vec![s1] };

    let run_handle = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run(&plan).await })
    };

    let task = wait_for_pending_task(&tasks, "t1").await;
    let approve = ManDecisionPayload {
        decision: Decision::Approve,
        reason: None,
        reviewer_id: "r1".to_string(),
        modified_params: None,
    };
    let first = tasks.resolve(task.id, approve.clone()).await.unwrap();
    let deny = ManDecisionPayload {
        decision: Decision::Deny,
        reason: None,
        reviewer_id: "r2".to_string(),
        modified_params: None,
    };
    let second = tasks.resolve(task.id, deny).await.unwrap();
    assert_eq!(first.status, second.status);
    assert_eq!(second.reviewer_id.as_deref(), Some("r1"));

    coordinator.submit_man_decision(task.id, approve).await;
    let outcome = run_handle.await.unwrap().unwrap();
    assert_eq!(outcome.status, WorkflowStatus::Completed);
    assert_eq!(executor.call_log().await.len(), 1);
}

/// Scenario F — backlog BLOCK_NEW fails the step immediately, no task created.
#[tokio::test]
async fn scenario_f_backlog_block_new_fails_without_creating_a_task() {
    let mut policy = ManPolicy::default();
    policy.max_pending_per_tenant = 2;
    policy.degrade_behavior = man_types::DegradeBehavior::BlockNew;
    policy.tool_minimum_lanes.insert("delete_record".to_string(), ManLane::Red);
    let executor = Arc::new(FakeExecutor::new(HashMap::new()));
    let (coordinator, tasks) = new_coordinator(policy, executor.clone()).await;

    for i in 0..2 {
        let intent = man_types::ActionIntent::new(
            "t1",
            "wf1",
            "r1",
            format!("seed-{i}"),
            "delete_record",
            BTreeMap::from([("id".to_string(), json!(i))]),
            man_types::IntentFlags::default(),
        );
        let triage = RiskTriageResult::new(ManLane::Red, 0.9, vec!["Hard trigger activated".to_string()]);
        tasks.create(intent, &triage).await.unwrap();
    }
    assert_eq!(tasks.count_pending("t1").await.unwrap(), 2);

    let s1 = step("s1", "delete_record", &[("id", json!(99))], &[]);
    let plan = Plan { id: "p1".to_string(), steps: vec![s1] };

    let outcome = coordinator.run(&plan).await.unwrap();
    assert_eq!(outcome.status, WorkflowStatus::Failed);
    assert_eq!(executor.call_log().await.len(), 0);
    assert_eq!(tasks.count_pending("t1").await.unwrap(), 2);
}

/// Scenario G — DAG parallel frontier: `a`/`b` run concurrently, `c` waits
/// for both.
#[tokio::test]
async fn scenario_g_dag_parallel_frontier_waits_for_both_parents() {
    let executor = Arc::new(FakeExecutor::new(HashMap::new()));
    let (coordinator, _tasks) = new_coordinator(ManPolicy::default(), executor.clone()).await;

    let plan = Plan {
        id: "p1".to_string(),
        steps: vec![
            step("a", "noop_a", &[], &[]),
            step("b", "noop_b", &[], &[]),
            step("c", "noop_c", &[], &["a", "b"]),
        ],
    };

    let outcome = coordinator.run(&plan).await.unwrap();
    assert_eq!(outcome.status, WorkflowStatus::Completed);
    let calls = executor.call_log().await;
    assert_eq!(calls.len(), 3);
    assert_eq!(calls.last().unwrap().0, "noop_c");
}

/// Continue-as-new: once the event log crosses `MAX_HISTORY_SIZE` mid-plan,
/// the run loop snapshots, archives the event log, and resumes from
/// already-computed results rather than re-running finished steps.
#[tokio::test]
async fn continue_as_new_triggers_mid_plan_and_resumes_without_rerunning() {
    let executor = Arc::new(FakeExecutor::new(HashMap::new()));
    let (coordinator, _tasks) = new_coordinator(ManPolicy::default(), executor.clone()).await;

    // Two `ToolCallRequested`/`ToolResultReceived` events per green step: 510
    // steps push the log from 2 (Goal/PlanGenerated) to 1022, past
    // MAX_HISTORY_SIZE, before the dependent final step's frontier starts.
    let mut steps: Vec<Step> = (0..510).map(|i| step(&format!("s{i}"), "noop", &[], &[])).collect();
    let dep_ids: Vec<String> = steps.iter().map(|s| s.id.clone()).collect();
    let dep_refs: Vec<&str> = dep_ids.iter().map(String::as_str).collect();
    steps.push(step("final", "noop_final", &[], &dep_refs));
    let plan = Plan { id: "p1".to_string(), steps };

    let outcome = coordinator.run(&plan).await.unwrap();
    assert_eq!(outcome.status, WorkflowStatus::Completed);
    assert_eq!(outcome.steps_executed, 511);
    assert_eq!(executor.call_log().await.len(), 511);

    // The pre-cutover history was archived: only the post-resume tail
    // (the final step's two events plus WorkflowCompleted) remains.
    let events = coordinator.events().await;
    assert_eq!(events.len(), 3);
    assert!(matches!(events.last(), Some(man_types::AgentEvent::WorkflowCompleted { .. })));
}

/// Saga-lock fix: two sibling frontier steps that each register a
/// compensation must not serialize on the saga mutex. A barrier that only
/// releases once both tool calls are in flight concurrently would hang
/// forever if the lock were still held across the tool-call await.
#[tokio::test]
async fn concurrent_frontier_steps_do_not_serialize_on_the_saga_lock() {
    struct BarrierExecutor {
        barrier: tokio::sync::Barrier,
    }
    #[async_trait]
    impl DurableExecutor for BarrierExecutor {
        async fn execute_activity(&self, name: &str, _args: Value, _timeout: Duration) -> Result<Value, ManError> {
            self.barrier.wait().await;
            Ok(json!({"id": name}))
        }
    }

    let executor = Arc::new(BarrierExecutor { barrier: tokio::sync::Barrier::new(2) });
    let source = Arc::new(FakePolicySource::default());
    source.upsert(None, None, ManPolicy::default()).await.unwrap();
    let policy_service = Arc::new(PolicyService::new(source));
    let tasks = Arc::new(ApprovalTaskRepository::new(Arc::new(InMemoryStore::new())));
    let notifier = Arc::new(NotificationDispatcher::new(NotificationConfig::default()));
    let config = CoordinatorConfig {
        tenant_id: "t1".to_string(),
        workflow_id: "wf1".to_string(),
        run_id: "r1".to_string(),
        user_id: "u1".to_string(),
        goal: "test goal".to_string(),
        workflow_key: None,
    };
    let coordinator =
        WorkflowCoordinator::new(config, policy_service, tasks, notifier, executor as Arc<dyn DurableExecutor>);

    let mut a = step("a", "book_flight", &[], &[]);
    a.compensation = Some("cancel_flight".to_string());
    let mut b = step("b", "book_hotel", &[], &[]);
    b.compensation = Some("cancel_hotel".to_string());
    let plan = Plan { id: "p1".to_string(), steps: vec![a, b] };

    let outcome = tokio::time::timeout(Duration::from_secs(5), coordinator.run(&plan))
        .await
        .expect("frontier steps serialized on the saga lock and deadlocked")
        .unwrap();
    assert_eq!(outcome.status, WorkflowStatus::Completed);
}

async fn wait_for_pending_task(tasks: &ApprovalTaskRepository, tenant_id: &str) -> man_types::ManTask {
    for _ in 0..200 {
        let (page, _total) = tasks.list(BTreeMap::from([("tenant_id".to_string(), json!(tenant_id))]), 10, 0).await.unwrap();
        if let Some(task) = page.into_iter().find(|t| t.status == man_types::ManTaskStatus::Pending) {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no pending task appeared for tenant {tenant_id}");
}
