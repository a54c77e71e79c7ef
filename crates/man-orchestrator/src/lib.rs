pub mod coordinator;
pub mod model;
pub mod registry;

pub use coordinator::{CoordinatorConfig, DurableExecutor, WorkflowCoordinator, ACTIVITY_TIMEOUT, COMPENSATION_TIMEOUT, MAX_HISTORY_SIZE};
pub use model::{ForceManModeScope, WorkflowOutcome, WorkflowSnapshot, WorkflowStatus};
pub use registry::{GoalPlanner, StubPlanner, WorkflowDeps, WorkflowEntry, WorkflowRegistry, WorkflowRunState};
