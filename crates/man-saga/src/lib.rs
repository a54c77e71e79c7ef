//! Saga Context (spec.md §4.4): a LIFO compensation stack with
//! result-value placeholder substitution and best-effort rollback.
//! Grounded on `original_source/orchestrator/workflows/agent_saga.py`.
//!
//! Per the design note in spec.md §9 ("cyclic references between
//! coordinator and saga"), `SagaContext` is a pure data holder — it never
//! holds a reference back to the workflow or its executor. The executor is
//! passed into `execute_with_compensation`/`rollback` by the caller.

use std::time::Duration;

use async_trait::async_trait;
use man_types::{CompensationResult, ManError};
use serde_json::{Map, Value};

/// A registered inverse operation, pushed after a step's tool call succeeds.
#[derive(Debug, Clone)]
pub struct CompensationStep {
    pub activity_name: String,
    pub input: Map<String, Value>,
    pub step_id: String,
}

/// The narrow capability the saga needs to invoke a tool or its inverse.
/// The Workflow Coordinator's activity-call wrapper implements this; the
/// saga itself is agnostic to how invocation happens.
#[async_trait]
pub trait CompensationExecutor: Send + Sync {
    async fn invoke(&self, tool: &str, input: Value) -> Result<Value, ManError>;
}

/// `"{result.FIELD}"` in a compensation-input value is replaced with
/// `result[FIELD]`; any other string passes through verbatim. Recurses into
/// nested objects/arrays so a compensation input can nest the reference.
pub fn substitute_result_placeholders(template: &Map<String, Value>, result: &Value) -> Map<String, Value> {
    template
        .iter()
        .map(|(k, v)| (k.clone(), substitute_value(v, result)))
        .collect()
}

fn substitute_value(value: &Value, result: &Value) -> Value {
    match value {
        Value::String(s) => s
            .strip_prefix("{result.")
            .and_then(|rest| rest.strip_suffix('}'))
            .map(|field| result.get(field).cloned().unwrap_or(Value::Null))
            .unwrap_or_else(|| value.clone()),
        Value::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), substitute_value(v, result))).collect()),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute_value(v, result)).collect()),
        other => other.clone(),
    }
}

#[derive(Default)]
pub struct SagaContext {
    stack: Vec<CompensationStep>,
    already_executed: bool,
}

impl SagaContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn already_rolled_back(&self) -> bool {
        self.already_executed
    }

    /// Snapshot of the pending compensation stack, for `continue_as_new`.
    pub fn compensation_stack(&self) -> &[CompensationStep] {
        &self.stack
    }

    pub fn restore(stack: Vec<CompensationStep>) -> Self {
        Self { stack, already_executed: false }
    }

    /// Register a compensation step whose input has already been substituted
    /// against the forward call's result. Split out from
    /// `execute_with_compensation` so a caller that needs to invoke the tool
    /// without holding `&mut self` across the await (e.g. to let sibling
    /// frontier steps run concurrently) can invoke first and register after,
    /// taking the lock only for this push.
    pub fn register_compensation(&mut self, activity_name: String, input: Map<String, Value>, step_id: String) {
        self.stack.push(CompensationStep { activity_name, input, step_id });
    }

    /// Invoke `tool` via `executor`, and on success push a compensation
    /// registration with `compensation_input`'s `"{result.FIELD}"`
    /// placeholders resolved against the tool's own result.
    pub async fn execute_with_compensation(
        &mut self,
        executor: &dyn CompensationExecutor,
        tool: &str,
        input: Value,
        compensation_tool: Option<&str>,
        compensation_input: &Map<String, Value>,
        step_id: &str,
    ) -> Result<Value, ManError> {
        let result = executor.invoke(tool, input).await?;
        if let Some(comp_tool) = compensation_tool {
            let substituted = substitute_result_placeholders(compensation_input, &result);
            self.register_compensation(comp_tool.to_string(), substituted, step_id.to_string());
        }
        Ok(result)
    }

    /// Pop compensations in LIFO order and invoke each with a shorter
    /// timeout than forward activities (15s default, spec.md §5).
    /// Compensation failures are logged, never abort the rollback.
    /// Idempotent: a second call after the stack has been drained returns
    /// an empty result set without invoking anything again.
    pub async fn rollback(&mut self, executor: &dyn CompensationExecutor, timeout: Duration) -> Vec<CompensationResult> {
        if self.already_executed {
            return Vec::new();
        }
        self.already_executed = true;
        let steps: Vec<CompensationStep> = self.stack.drain(..).rev().collect();

        let mut results = Vec::with_capacity(steps.len());
        for step in steps {
            let outcome = tokio::time::timeout(
                timeout,
                executor.invoke(&step.activity_name, Value::Object(step.input.clone())),
            )
            .await;

            let result = match outcome {
                Ok(Ok(_)) => CompensationResult {
                    step_id: step.step_id.clone(),
                    success: true,
                    error: None,
                },
                Ok(Err(e)) => {
                    tracing::warn!(step_id = %step.step_id, tool = %step.activity_name, error = %e, "compensation failed");
                    CompensationResult {
                        step_id: step.step_id.clone(),
                        success: false,
                        error: Some(e.to_string()),
                    }
                }
                Err(_) => {
                    tracing::warn!(step_id = %step.step_id, tool = %step.activity_name, "compensation timed out");
                    CompensationResult {
                        step_id: step.step_id.clone(),
                        success: false,
                        error: Some("compensation timed out".to_string()),
                    }
                }
            };
            results.push(result);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use man_types::ManErrorKind;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingExecutor {
        calls: Mutex<Vec<(String, Value)>>,
        fail_tools: Vec<String>,
    }

    #[async_trait]
    impl CompensationExecutor for RecordingExecutor {
        async fn invoke(&self, tool: &str, input: Value) -> Result<Value, ManError> {
            self.calls.lock().unwrap().push((tool.to_string(), input));
            if self.fail_tools.contains(&tool.to_string()) {
                return Err(ManError::new(ManErrorKind::ToolFatal, false, "boom"));
            }
            Ok(json!({"booking_id": "BK-9"}))
        }
    }

    #[test]
    fn substitutes_result_field_placeholder() {
        let template = Map::from_iter([("booking_id".to_string(), json!("{result.booking_id}"))]);
        let result = json!({"booking_id": "BK-9"});
        let substituted = substitute_result_placeholders(&template, &result);
        assert_eq!(substituted["booking_id"], json!("BK-9"));
    }

    #[test]
    fn non_placeholder_strings_pass_through_verbatim() {
        let template = Map::from_iter([("mode".to_string(), json!("soft"))]);
        let substituted = substitute_result_placeholders(&template, &json!({}));
        assert_eq!(substituted["mode"], json!("soft"));
    }

    #[tokio::test]
    async fn execute_with_compensation_registers_after_success() {
        let executor = RecordingExecutor::default();
        let mut saga = SagaContext::new();
        let template = Map::from_iter([("booking_id".to_string(), json!("{result.booking_id}"))]);

        saga.execute_with_compensation(&executor, "book_flight", json!({"to": "CDG"}), Some("cancel_flight"), &template, "s1")
            .await
            .unwrap();

        assert_eq!(saga.len(), 1);
        assert_eq!(saga.compensation_stack()[0].input["booking_id"], json!("BK-9"));
    }

    #[tokio::test]
    async fn rollback_runs_lifo_and_is_idempotent() {
        let executor = RecordingExecutor::default();
        let mut saga = SagaContext::new();
        saga.execute_with_compensation(&executor, "t1", json!({}), Some("c1"), &Map::new(), "s1").await.unwrap();
        saga.execute_with_compensation(&executor, "t2", json!({}), Some("c2"), &Map::new(), "s2").await.unwrap();

        let results = saga.rollback(&executor, Duration::from_secs(15)).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].step_id, "s2");
        assert_eq!(results[1].step_id, "s1");
        assert!(results.iter().all(|r| r.success));

        let second_rollback = saga.rollback(&executor, Duration::from_secs(15)).await;
        assert!(second_rollback.is_empty());
    }

    #[tokio::test]
    async fn compensation_failure_does_not_abort_rollback() {
        let executor = RecordingExecutor {
            calls: Mutex::new(Vec::new()),
            fail_tools: vec!["c1".to_string()],
        };
        let mut saga = SagaContext::new();
        saga.execute_with_compensation(&executor, "t1", json!({}), Some("c1"), &Map::new(), "s1").await.unwrap();
        saga.execute_with_compensation(&executor, "t2", json!({}), Some("c2"), &Map::new(), "s2").await.unwrap();

        let results = saga.rollback(&executor, Duration::from_secs(15)).await;
        assert_eq!(results.len(), 2);
        assert!(results[0].success); // c2 ran first (LIFO), succeeded
        assert!(!results[1].success); // c1 failed but rollback still recorded it
    }
}
