//! `man-engine`: the CLI binary hosting the worker loop, the Operator HTTP
//! API, and two local diagnostic modes. Grounded on `engine/src/main.rs`'s
//! `clap::Parser` + `Command` subcommand shape and its
//! `build_state`/`resolve_state_dir`/`log_startup_paths` assembly pattern.

mod config;
mod executor;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use man_notify::{NotificationConfig, NotificationDispatcher};
use man_observability::logging::{canonical_logs_dir_from_root, init_process_logging, ProcessRole};
use man_orchestrator::{StubPlanner, WorkflowDeps, WorkflowRegistry, WorkflowRunState};
use man_policy::PolicyService;
use man_store::{ApprovalTaskRepository, InMemoryStore, StoreBackedPolicySource};
use man_server::AppState;

use config::EngineConfig;
use executor::EchoExecutor;

#[derive(Parser)]
#[command(name = "man-engine", about = "MAN-mode orchestration core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the TTL-expirer sweep standalone, without serving HTTP.
    Worker,
    /// Serve the Operator HTTP API (spec.md §6).
    Api,
    /// Submit one goal, wait for the workflow to finish, print the outcome.
    Submit {
        goal: String,
        #[arg(long, default_value = "default")]
        tenant_id: String,
        #[arg(long, default_value = "cli")]
        user_id: String,
    },
    /// Run an embedded smoke test: submit a trivial goal end to end.
    Test,
}

fn resolve_state_dir() -> PathBuf {
    std::env::var("MAN_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")).join(".man-engine"))
}

fn log_startup_paths(state_dir: &PathBuf, logs_dir: &PathBuf) {
    tracing::info!(state_dir = %state_dir.display(), logs_dir = %logs_dir.display(), "man-engine starting up");
}

/// Assembles the shared collaborators every CLI mode runs against, and the
/// backing store they share. `DurableExecutor` has no real durable substrate
/// wired in here (spec.md §1 keeps that out of scope) so every mode runs
/// against `EchoExecutor`.
fn build_deps() -> (WorkflowDeps, Arc<dyn man_store::Store>) {
    let store: Arc<dyn man_store::Store> = Arc::new(InMemoryStore::new());
    let policy_source = Arc::new(StoreBackedPolicySource::new(store.clone()));
    let deps = WorkflowDeps {
        policy: Arc::new(PolicyService::new(policy_source)),
        tasks: Arc::new(ApprovalTaskRepository::new(store.clone())),
        notifier: Arc::new(NotificationDispatcher::new(NotificationConfig::from_env())),
        executor: Arc::new(EchoExecutor),
        planner: Arc::new(StubPlanner),
    };
    (deps, store)
}

fn build_app_state(deps: WorkflowDeps, store: Arc<dyn man_store::Store>) -> AppState {
    AppState::new(Arc::new(WorkflowRegistry::new()), deps, store)
}

async fn run_ttl_expirer(state: AppState, ttl_minutes: i64) {
    loop {
        tokio::time::sleep(Duration::from_secs(60)).await;
        let ttl = chrono::Duration::minutes(ttl_minutes);
        match state.tasks.expire_overdue(|_tenant_id| ttl, chrono::Utc::now()).await {
            Ok(expired) if !expired.is_empty() => {
                tracing::info!(count = expired.len(), "ttl-expirer: promoted overdue tasks to EXPIRED");
                for task in expired {
                    state.registry.notify_expired(task.id).await;
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "ttl-expirer sweep failed"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::from_env();
    let state_dir = resolve_state_dir();
    let logs_dir = canonical_logs_dir_from_root(&state_dir);

    match cli.command {
        Command::Worker => {
            let _guard = init_process_logging(ProcessRole::Worker, &logs_dir)?;
            log_startup_paths(&state_dir, &logs_dir);
            tracing::info!(temporal_host = %config.temporal_host, temporal_namespace = %config.temporal_namespace, "worker: durable substrate is an external collaborator; running TTL-expirer only");
            let (deps, store) = build_deps();
            let state = build_app_state(deps, store);
            run_ttl_expirer(state, 1440).await;
            Ok(())
        }
        Command::Api => {
            let _guard = init_process_logging(ProcessRole::Api, &logs_dir)?;
            log_startup_paths(&state_dir, &logs_dir);
            let (deps, store) = build_deps();
            let state = build_app_state(deps, store);
            let addr: SocketAddr = format!("{}:{}", config.api_host, config.api_port).parse()?;
            tracing::info!(%addr, "man-engine api: serving Operator HTTP API");
            man_server::serve(addr, state).await
        }
        Command::Submit { goal, tenant_id, user_id } => {
            let _guard = init_process_logging(ProcessRole::Worker, &logs_dir)?;
            let (deps, _store) = build_deps();
            let registry = WorkflowRegistry::new();
            let workflow_id = registry.submit_goal(deps, tenant_id, user_id, goal, None).await?;
            tracing::info!(workflow_id = %workflow_id, "submitted goal");

            for _ in 0..600 {
                let entry = registry.get(&workflow_id).await.expect("just registered");
                let state = entry.state.read().await;
                match &*state {
                    WorkflowRunState::Running => {}
                    WorkflowRunState::Finished(outcome) => {
                        println!("{}", serde_json::to_string_pretty(outcome)?);
                        return Ok(());
                    }
                    WorkflowRunState::Crashed(detail) => {
                        eprintln!("workflow crashed: {detail}");
                        std::process::exit(1);
                    }
                }
                drop(state);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            eprintln!("workflow did not finish within the polling window");
            std::process::exit(1);
        }
        Command::Test => {
            let _guard = init_process_logging(ProcessRole::Worker, &logs_dir)?;
            let (deps, _store) = build_deps();
            let registry = WorkflowRegistry::new();
            let workflow_id = registry
                .submit_goal(deps, "smoke-test".to_string(), "smoke-test".to_string(), "say hello".to_string(), None)
                .await?;

            for _ in 0..200 {
                let entry = registry.get(&workflow_id).await.expect("just registered");
                let finished = matches!(*entry.state.read().await, WorkflowRunState::Finished(_));
                if finished {
                    println!("test: PASS");
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            println!("test: FAIL (workflow never completed)");
            std::process::exit(1);
        }
    }
}
