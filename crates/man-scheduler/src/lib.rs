//! The DAG Scheduler (spec.md §4.5): parses a `Plan`, topologically sorts
//! it, and executes each frontier's steps concurrently. Grounded on the DAG
//! execution notes in `original_source/orchestrator/workflows/agent_saga.py`.
//!
//! The scheduler is agnostic to what a step's execution actually does
//! (triage, gate, tool call, compensation registration all live in
//! `man-orchestrator`); it only drives a `StepRunner` callback per step and
//! enforces the dependency order.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use man_types::{ManError, ManErrorKind, Plan, Step};
use serde_json::Value;

/// One step's execution, as seen by the scheduler: success carries the
/// tool's result value (consumed by dependents and by compensation
/// placeholder substitution); failure carries the terminal error.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(&self, step: &Step) -> Result<Value, ManError>;
}

#[derive(Debug, Default)]
pub struct DagExecutionResult {
    pub step_results: HashMap<String, Value>,
    pub executed_step_ids: Vec<String>,
    pub failed_step_id: Option<String>,
    pub failure: Option<ManError>,
    /// `true` when execution stopped early because `should_pause` returned
    /// `true` between frontiers, with steps still left to run. Distinct from
    /// failure: `step_results`/`executed_step_ids` reflect real progress a
    /// caller can resume from via `already_computed`.
    pub paused: bool,
}

impl DagExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.failed_step_id.is_none() && !self.paused
    }
}

/// Execute `plan` to completion (or first fatal failure), honoring
/// `already_computed` results for steps a prior attempt (replay, or a
/// `continue_as_new` resume) already finished.
pub async fn execute_plan(
    plan: &Plan,
    runner: &dyn StepRunner,
    already_computed: &HashMap<String, Value>,
) -> Result<DagExecutionResult, ManError> {
    execute_plan_with_pause(plan, runner, already_computed, &|| false).await
}

/// As `execute_plan`, but checks `should_pause` between frontiers and
/// returns early (`paused: true`) with partial results instead of continuing
/// — the hook `man-orchestrator`'s `continue_as_new` snapshotting drives.
pub async fn execute_plan_with_pause(
    plan: &Plan,
    runner: &dyn StepRunner,
    already_computed: &HashMap<String, Value>,
    should_pause: &dyn Fn() -> bool,
) -> Result<DagExecutionResult, ManError> {
    plan.validate()?;

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in &plan.steps {
        in_degree.entry(step.id.as_str()).or_insert(0);
        for dep in &step.depends_on {
            *in_degree.entry(step.id.as_str()).or_insert(0) += 1;
            dependents.entry(dep.as_str()).or_default().push(step.id.as_str());
        }
    }

    let mut executed: HashSet<&str> = HashSet::new();
    let mut step_results: HashMap<String, Value> = already_computed.clone();
    let mut executed_order = Vec::new();

    // Steps already computed before this attempt (continue-as-new resume)
    // count as executed and unblock their dependents up front.
    for step in &plan.steps {
        if step_results.contains_key(&step.id) {
            executed.insert(step.id.as_str());
            executed_order.push(step.id.clone());
            if let Some(deps) = dependents.get(step.id.as_str()) {
                for d in deps {
                    if let Some(degree) = in_degree.get_mut(d) {
                        *degree = degree.saturating_sub(1);
                    }
                }
            }
        }
    }

    let mut frontier: Vec<&str> = in_degree
        .iter()
        .filter(|(id, degree)| **degree == 0 && !executed.contains(*id))
        .map(|(id, _)| *id)
        .collect();
    frontier.sort_unstable();

    let mut failed_step_id: Option<String> = None;
    let mut failure: Option<ManError> = None;

    while !frontier.is_empty() {
        let calls = frontier.iter().map(|id| {
            let step = plan.step(id).expect("frontier id always resolves to a plan step");
            async move { (*id, runner.run(step).await) }
        });
        let outcomes = futures::future::join_all(calls).await;

        let mut next_candidates: Vec<&str> = Vec::new();
        for (id, outcome) in outcomes {
            executed.insert(id);
            executed_order.push(id.to_string());
            match outcome {
                Ok(value) => {
                    step_results.insert(id.to_string(), value);
                    if failed_step_id.is_none() {
                        if let Some(deps) = dependents.get(id) {
                            for d in deps {
                                let degree = in_degree.get_mut(d).expect("dependent id registered in in_degree");
                                *degree -= 1;
                                if *degree == 0 {
                                    next_candidates.push(d);
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    if failed_step_id.is_none() {
                        failed_step_id = Some(id.to_string());
                        failure = Some(e);
                    }
                }
            }
        }

        frontier = if failed_step_id.is_some() {
            Vec::new()
        } else {
            next_candidates
        };
        frontier.sort_unstable();

        if failed_step_id.is_none() && !frontier.is_empty() && should_pause() {
            return Ok(DagExecutionResult {
                step_results,
                executed_step_ids: executed_order,
                failed_step_id: None,
                failure: None,
                paused: true,
            });
        }
    }

    if failed_step_id.is_none() && executed.len() != plan.steps.len() {
        let missing: Vec<&str> = plan
            .steps
            .iter()
            .map(|s| s.id.as_str())
            .filter(|id| !executed.contains(id))
            .collect();
        return Err(ManError::new(
            ManErrorKind::DagCycleOrMissingDependency,
            false,
            format!("steps never reached zero in-degree: {missing:?}"),
        ));
    }

    Ok(DagExecutionResult {
        step_results,
        executed_step_ids: executed_order,
        failed_step_id,
        failure,
        paused: false,
    })
}
