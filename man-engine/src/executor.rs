//! Stand-in `DurableExecutor` for local running of `man-engine` without a
//! real durable substrate wired in (spec.md §1 keeps that substrate out of
//! scope). Echoes every activity call back as its own `args`, the same
//! shape the `registry` and `man-server` test suites use for `NoopExecutor`,
//! generalized into a reusable type the CLI binary wires by default.

use std::time::Duration;

use async_trait::async_trait;
use man_types::{ManError, ManErrorKind};
use serde_json::Value;

use man_orchestrator::DurableExecutor;

pub struct EchoExecutor;

#[async_trait]
impl DurableExecutor for EchoExecutor {
    async fn execute_activity(&self, name: &str, args: Value, _timeout: Duration) -> Result<Value, ManError> {
        if name.is_empty() {
            return Err(ManError::new(ManErrorKind::ToolFatal, false, "activity name must not be empty"));
        }
        tracing::debug!(tool = name, "echo executor: activity invoked");
        Ok(args)
    }
}
