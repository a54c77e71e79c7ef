//! Operator HTTP API (spec.md §4.7/§6): a thin adapter over the Approval
//! Task Repository, the Policy Store & Cache, and the Workflow Registry.
//! Grounded on `tandem-server::{lib, http}` for the `AppState` + `serve()`
//! shape — background-task spawn before `axum::serve(...).
//! with_graceful_shutdown(...)`, aborted on shutdown.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use man_orchestrator::{WorkflowDeps, WorkflowRegistry};
use man_store::{ApprovalTaskRepository, Store};

mod http;

pub use http::serve;

/// Everything an HTTP handler needs, cloned cheaply per request (every field
/// is an `Arc`). Grounded on `tandem-server::AppState`'s "bag of `Arc<...>`
/// capability handles" shape.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<WorkflowRegistry>,
    pub deps: WorkflowDeps,
    pub tasks: Arc<ApprovalTaskRepository>,
    pub store: Arc<dyn Store>,
    pub policy_version: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(registry: Arc<WorkflowRegistry>, deps: WorkflowDeps, store: Arc<dyn Store>) -> Self {
        Self {
            tasks: deps.tasks.clone(),
            registry,
            deps,
            store,
            policy_version: Arc::new(AtomicU64::new(1)),
        }
    }
}
